//! Authorized query plans consumed by the SQL compiler and the runner.

use serde_json::Value;
use tessera_domain::{FieldAllowList, FieldFunction, FilterOperator, RelationQuantifier, SortDirection};

use crate::ColumnKind;

/// One collection level of an authorized query.
///
/// Every filter in a planned level has been validated against the schema,
/// combined with the caller's permissions and stripped of placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedLevel {
    /// Collection read by this level.
    pub collection: String,
    /// Primary key field, always selected.
    pub primary_key: String,
    /// Primary key column kind.
    pub primary_key_kind: ColumnKind,
    /// Output fields in request order.
    pub fields: Vec<PlannedField>,
    /// Related levels in request order.
    pub relations: Vec<PlannedRelation>,
    /// Effective row filter, `None` when unrestricted.
    pub filter: Option<BoundFilter>,
    /// Sort keys, the primary key tie-breaker is appended by the compiler.
    pub sort: Vec<BoundSort>,
    /// Row limit (per parent for deferred levels), `None` reads every row.
    pub limit: Option<u64>,
    /// Rows to skip (per parent for deferred levels).
    pub offset: u64,
    /// Row-level field visibility.
    pub access: LevelAccess,
}

impl PlannedLevel {
    /// Returns the schema field behind an output key.
    #[must_use]
    pub fn source_field(&self, output_key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.output_key() == output_key)
            .map(PlannedField::field)
            .or_else(|| {
                self.relations
                    .iter()
                    .find(|relation| relation.output_key == output_key)
                    .map(|relation| relation.field.as_str())
            })
    }
}

/// Scalar output of a level.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedField {
    /// Stored column.
    Column {
        /// Key in the output row.
        output_key: String,
        /// Field name.
        field: String,
        /// Decoding hint.
        kind: ColumnKind,
        /// Masks non-null values in the output.
        concealed: bool,
    },
    /// Date part of a temporal column.
    Function {
        /// Key in the output row.
        output_key: String,
        /// Transform.
        function: FieldFunction,
        /// Underlying field.
        field: String,
    },
}

impl PlannedField {
    /// Returns the output key.
    #[must_use]
    pub fn output_key(&self) -> &str {
        match self {
            Self::Column { output_key, .. } | Self::Function { output_key, .. } => output_key,
        }
    }

    /// Returns the underlying field.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Column { field, .. } | Self::Function { field, .. } => field,
        }
    }
}

/// Shape a relation takes in the output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOutput {
    /// Nested objects.
    Nested,
    /// Related primary keys only.
    Keys,
}

/// Relation of a level to other levels.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRelation {
    /// Key in the output row.
    pub output_key: String,
    /// Relation field on the parent collection.
    pub field: String,
    /// Output shape.
    pub output: RelationOutput,
    /// How related rows are fetched.
    pub strategy: RelationStrategy,
}

/// Fetch strategy of a relation.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationStrategy {
    /// Many-to-one, joined into the parent statement.
    Joined {
        /// Foreign key on the parent.
        foreign_key: String,
        /// Related level.
        level: Box<PlannedLevel>,
    },
    /// One-to-many, fetched after the parent by batches of parent keys.
    Deferred {
        /// Foreign key on the related collection.
        foreign_key: String,
        /// Column kind of the foreign key.
        foreign_key_kind: ColumnKind,
        /// Related level.
        level: Box<PlannedLevel>,
    },
    /// Any-to-one, one joined branch per requested collection.
    Polymorphic {
        /// Foreign key on the parent, stored as text.
        foreign_key: String,
        /// Sibling field naming the related collection.
        collection_field: String,
        /// Requested branches.
        branches: Vec<PolymorphicBranch>,
    },
}

/// One target collection of an any-to-one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolymorphicBranch {
    /// Target collection.
    pub collection: String,
    /// Target level.
    pub level: PlannedLevel,
}

/// Field visibility of a level's rows.
///
/// `always` applies to every returned row. Each case adds fields to rows
/// that satisfy the case filter.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelAccess {
    /// Fields visible on every row.
    pub always: FieldAllowList,
    /// Row-dependent grants, evaluated as flag columns.
    pub cases: Vec<AccessCase>,
}

impl LevelAccess {
    /// Access without restrictions.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            always: FieldAllowList::All,
            cases: Vec::new(),
        }
    }

    /// Returns fields visible on a row with the given case flags.
    #[must_use]
    pub fn visible_fields(&self, flags: &[bool]) -> FieldAllowList {
        self.cases
            .iter()
            .zip(flags)
            .filter(|(_, matched)| **matched)
            .fold(self.always.clone(), |visible, (case, _)| {
                visible.union(&case.fields)
            })
    }
}

/// Field grant of one permission rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessCase {
    /// Rule row filter.
    pub filter: BoundFilter,
    /// Fields granted on matching rows.
    pub fields: FieldAllowList,
}

/// Sort key bound to a column.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSort {
    /// Field name.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
    /// Rows failing this filter sort as if the field were null.
    pub visible_when: Option<BoundFilter>,
}

/// Filter validated against the schema and free of placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundFilter {
    /// All children match, empty matches everything.
    And(Vec<BoundFilter>),
    /// Any child matches, empty matches nothing.
    Or(Vec<BoundFilter>),
    /// Matches nothing.
    Never,
    /// Column comparison.
    Compare {
        /// Field name.
        field: String,
        /// Column kind used to coerce the operand.
        kind: ColumnKind,
        /// Operator.
        operator: FilterOperator,
        /// Operand.
        value: BoundValue,
    },
    /// Condition on related rows.
    Related(RelatedCondition),
}

impl BoundFilter {
    /// Conjunction that drops match-all children and absorbs `Never`.
    #[must_use]
    pub fn all_of(filters: Vec<BoundFilter>) -> Option<Self> {
        let mut children = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                Self::Never => return Some(Self::Never),
                Self::And(nested) if nested.is_empty() => {}
                Self::And(nested) => children.extend(nested),
                other => children.push(other),
            }
        }

        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(Self::And(children)),
        }
    }
}

/// Right-hand side of a bound comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    /// Constant.
    Literal(Value),
    /// Attribute of the caller's user record.
    UserAttribute(UserAttribute),
}

/// Path from the caller's user id to an attribute value.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAttribute {
    /// Caller user id.
    pub user: String,
    /// Lookups, first on the user collection.
    pub steps: Vec<UserAttributeStep>,
}

/// One scalar lookup of a user attribute path.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAttributeStep {
    /// Collection read.
    pub collection: String,
    /// Key column matched against the previous value.
    pub key_field: String,
    /// Key column kind.
    pub key_kind: ColumnKind,
    /// Column read.
    pub field: String,
}

/// Condition on rows of a related collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedCondition {
    /// `None` negates the existence check.
    pub quantifier: RelationQuantifier,
    /// Join between the current and the related collection.
    pub link: RelatedLink,
    /// Filter on the related rows, permission filter included.
    pub filter: Box<BoundFilter>,
}

/// Join of a relational condition.
#[derive(Debug, Clone, PartialEq)]
pub enum RelatedLink {
    /// Related row referenced by a foreign key of the current row.
    ManyToOne {
        /// Foreign key on the current collection.
        foreign_key: String,
        /// Related collection.
        collection: String,
        /// Related primary key.
        primary_key: String,
    },
    /// Related rows referencing the current row.
    OneToMany {
        /// Related collection.
        collection: String,
        /// Foreign key on the related collection.
        foreign_key: String,
        /// Primary key of the current collection.
        parent_key: String,
    },
    /// Related row in the collection named by a sibling field.
    AnyToOne {
        /// Foreign key on the current collection.
        foreign_key: String,
        /// Sibling field naming the target collection.
        collection_field: String,
        /// Target collection.
        collection: String,
        /// Target primary key.
        primary_key: String,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tessera_domain::{FieldAllowList, FilterOperator};

    use super::{AccessCase, BoundFilter, BoundValue, LevelAccess};
    use crate::ColumnKind;

    fn status_is(value: &str) -> BoundFilter {
        BoundFilter::Compare {
            field: "status".to_owned(),
            kind: ColumnKind::Text,
            operator: FilterOperator::Eq,
            value: BoundValue::Literal(json!(value)),
        }
    }

    #[test]
    fn all_of_flattens_and_absorbs() {
        assert_eq!(BoundFilter::all_of(Vec::new()), None);
        assert_eq!(
            BoundFilter::all_of(vec![BoundFilter::And(Vec::new()), status_is("a")]),
            Some(status_is("a"))
        );
        assert_eq!(
            BoundFilter::all_of(vec![status_is("a"), BoundFilter::Never]),
            Some(BoundFilter::Never)
        );
    }

    #[test]
    fn matched_cases_extend_visible_fields() {
        let access = LevelAccess {
            always: FieldAllowList::from_fields(Some(vec!["id"])),
            cases: vec![
                AccessCase {
                    filter: status_is("published"),
                    fields: FieldAllowList::from_fields(Some(vec!["title"])),
                },
                AccessCase {
                    filter: status_is("draft"),
                    fields: FieldAllowList::from_fields(Some(vec!["notes"])),
                },
            ],
        };

        let visible = access.visible_fields(&[true, false]);
        assert!(visible.allows("id"));
        assert!(visible.allows("title"));
        assert!(!visible.allows("notes"));
    }
}
