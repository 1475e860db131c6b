use crate::{
    DynamicVariable, FieldAllowList, FieldCondition, Filter, FilterOperator, FilterValue,
    PermissionAction, PermissionRule,
};

/// Policy id reported on rules granted by the app access flag.
pub const APP_ACCESS_POLICY: &str = "$app_access";

/// Role collection name.
pub const ROLES_COLLECTION: &str = "system_roles";

/// Policy collection name.
pub const POLICIES_COLLECTION: &str = "system_policies";

const OPEN_APP_COLLECTIONS: [&str; 4] = [
    "system_collections",
    "system_fields",
    "system_relations",
    "system_settings",
];

/// Returns the fixed read rules granted to callers with app access.
#[must_use]
pub fn app_access_rules(collection: &str, user_collection: &str) -> Vec<PermissionRule> {
    let rule = |filter: Option<Filter>| {
        let rule = PermissionRule::new(APP_ACCESS_POLICY, collection, PermissionAction::Read)
            .with_fields(FieldAllowList::All);
        match filter {
            Some(filter) => rule.with_filter(filter),
            None => rule,
        }
    };

    if collection == user_collection {
        return vec![rule(Some(variable_condition(
            "id",
            FilterOperator::Eq,
            DynamicVariable::CurrentUser { path: Vec::new() },
        )))];
    }

    match collection {
        ROLES_COLLECTION => vec![rule(Some(variable_condition(
            "id",
            FilterOperator::In,
            DynamicVariable::CurrentRoles,
        )))],
        POLICIES_COLLECTION => vec![rule(Some(variable_condition(
            "id",
            FilterOperator::In,
            DynamicVariable::CurrentPolicies,
        )))],
        name if OPEN_APP_COLLECTIONS.contains(&name) => vec![rule(None)],
        _ => Vec::new(),
    }
}

fn variable_condition(field: &str, operator: FilterOperator, variable: DynamicVariable) -> Filter {
    Filter::Condition(FieldCondition {
        field: field.to_owned(),
        operator,
        value: FilterValue::Variable(variable),
    })
}
