use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_core::{AppError, AppResult};

use crate::Filter;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

impl SortDirection {
    /// Returns the SQL keyword.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    /// Field name on the node's collection.
    pub field: String,
    /// Direction.
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortField {
    /// Parses the transport form, where a leading `-` means descending.
    pub fn parse_transport(value: &str) -> AppResult<Self> {
        let (field, direction) = match value.strip_prefix('-') {
            Some(field) => (field, SortDirection::Desc),
            None => (value, SortDirection::Asc),
        };
        if field.trim().is_empty() {
            return Err(AppError::InvalidQuery(format!(
                "invalid sort key '{value}'"
            )));
        }

        Ok(Self {
            field: field.to_owned(),
            direction,
        })
    }
}

/// Date-part transform applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFunction {
    /// Calendar year.
    Year,
    /// Month of year.
    Month,
    /// Week of year.
    Week,
    /// Day of month.
    Day,
    /// Day of week, Sunday is 0.
    Weekday,
    /// Hour of day.
    Hour,
    /// Minute of hour.
    Minute,
    /// Second of minute.
    Second,
}

impl FieldFunction {
    /// Returns stable transport value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Week => "week",
            Self::Day => "day",
            Self::Weekday => "weekday",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }
}

impl FromStr for FieldFunction {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "year" => Ok(Self::Year),
            "month" => Ok(Self::Month),
            "week" => Ok(Self::Week),
            "day" => Ok(Self::Day),
            "weekday" => Ok(Self::Weekday),
            "hour" => Ok(Self::Hour),
            "minute" => Ok(Self::Minute),
            "second" => Ok(Self::Second),
            _ => Err(AppError::InvalidQuery(format!(
                "unknown field function '{value}'"
            ))),
        }
    }
}

/// Requested row limit of a level.
///
/// The transport form is an integer where `-1` asks for every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Limit {
    /// At most this many rows.
    Rows(u64),
    /// No limit beyond the configured maximum.
    Unlimited,
}

impl TryFrom<i64> for Limit {
    type Error = AppError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unlimited),
            rows if rows >= 0 => Ok(Self::Rows(rows.unsigned_abs())),
            _ => Err(AppError::InvalidQuery(format!(
                "invalid limit {value}, expected -1 or a non-negative number"
            ))),
        }
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Rows(rows) => i64::try_from(rows).unwrap_or(i64::MAX),
            Limit::Unlimited => -1,
        }
    }
}

/// Query modifiers scoped to one collection level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeQuery {
    /// Caller filter.
    #[serde(default)]
    pub filter: Option<Filter>,
    /// Sort keys.
    #[serde(default)]
    pub sort: Vec<SortField>,
    /// Maximum rows (per parent for one-to-many).
    #[serde(default)]
    pub limit: Option<Limit>,
    /// Rows to skip (per parent for one-to-many).
    #[serde(default)]
    pub offset: u64,
    /// One-based page of `limit` rows, skipped on top of `offset`.
    #[serde(default)]
    pub page: Option<u64>,
    /// Free-text search term.
    #[serde(default)]
    pub search: Option<String>,
}

/// Plain field request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNode {
    /// Field name, or `*` for every visible field.
    pub name: String,
    /// Output key override.
    #[serde(default)]
    pub alias: Option<String>,
}

/// Function applied to a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNode {
    /// Transform.
    pub function: FieldFunction,
    /// Underlying field.
    pub field: String,
    /// Output key override.
    #[serde(default)]
    pub alias: Option<String>,
}

/// Many-to-one or one-to-many relation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedNode {
    /// Relation field on the parent collection.
    pub field: String,
    /// Output key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Requested fields of the related collection.
    pub children: Vec<QueryNode>,
    /// Modifiers on the related collection.
    #[serde(default)]
    pub query: NodeQuery,
}

/// Requested shape for one any-to-one target collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyToOneBranch {
    /// Requested fields of the target collection.
    pub children: Vec<QueryNode>,
    /// Modifiers on the target collection.
    #[serde(default)]
    pub query: NodeQuery,
}

/// Any-to-one relation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyToOneNode {
    /// Relation field on the parent collection.
    pub field: String,
    /// Output key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Requested shape per target collection.
    pub branches: BTreeMap<String, AnyToOneBranch>,
}

/// Node of the query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryNode {
    /// Plain field.
    Field(FieldNode),
    /// Function over a field.
    Function(FunctionNode),
    /// Single related row joined by foreign key.
    ManyToOne(NestedNode),
    /// Related rows referencing the parent.
    OneToMany(NestedNode),
    /// Single related row in a per-row collection.
    AnyToOne(AnyToOneNode),
}

impl QueryNode {
    /// Creates a plain field node.
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(FieldNode {
            name: name.into(),
            alias: None,
        })
    }

    /// Returns the key this node occupies in the output row.
    #[must_use]
    pub fn output_key(&self) -> String {
        match self {
            Self::Field(node) => node.alias.clone().unwrap_or_else(|| node.name.clone()),
            Self::Function(node) => node
                .alias
                .clone()
                .unwrap_or_else(|| format!("{}({})", node.function.as_str(), node.field)),
            Self::ManyToOne(node) | Self::OneToMany(node) => {
                node.alias.clone().unwrap_or_else(|| node.field.clone())
            }
            Self::AnyToOne(node) => node.alias.clone().unwrap_or_else(|| node.field.clone()),
        }
    }
}

/// Root of a read request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTree {
    /// Root collection.
    pub collection: String,
    /// Requested fields of the root collection.
    pub children: Vec<QueryNode>,
    /// Root modifiers.
    #[serde(default)]
    pub query: NodeQuery,
}

impl QueryTree {
    /// Creates a tree without modifiers.
    #[must_use]
    pub fn new(collection: impl Into<String>, children: Vec<QueryNode>) -> Self {
        Self {
            collection: collection.into(),
            children,
            query: NodeQuery::default(),
        }
    }

    /// Replaces root modifiers.
    #[must_use]
    pub fn with_query(mut self, query: NodeQuery) -> Self {
        self.query = query;
        self
    }
}
