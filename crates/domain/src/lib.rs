//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod accountability;
mod filter;
mod permission;
mod query;
mod schema;
mod system;

pub use accountability::Accountability;
pub use filter::{
    DynamicVariable, FieldCondition, Filter, FilterOperator, FilterValue, RelatedFilter,
    RelationQuantifier,
};
pub use permission::{FieldAllowList, PermissionAction, PermissionRule, Policy, Role};
pub use query::{
    AnyToOneBranch, AnyToOneNode, FieldFunction, FieldNode, FunctionNode, Limit, NestedNode,
    NodeQuery, QueryNode, QueryTree, SortDirection, SortField,
};
pub use schema::{
    CollectionSchema, FieldDefinition, FieldSpecial, FieldType, Relation, RelationKind,
    SchemaOverview,
};
pub use system::{APP_ACCESS_POLICY, POLICIES_COLLECTION, ROLES_COLLECTION, app_access_rules};
