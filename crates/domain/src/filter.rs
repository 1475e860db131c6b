use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tessera_core::{AppError, AppResult};

use crate::{FieldDefinition, FieldType};

/// Comparison operator of a field condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// Equality.
    Eq,
    /// Inequality.
    Neq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Membership in a list.
    In,
    /// Absence from a list.
    Nin,
    /// Null check, `true` for null and `false` for not null.
    Null,
    /// Not-null check, `true` for not null and `false` for null.
    Nnull,
    /// Case-sensitive substring match.
    Contains,
    /// Negated substring match.
    Ncontains,
    /// Case-insensitive substring match.
    Icontains,
    /// Prefix match.
    StartsWith,
    /// Negated prefix match.
    NstartsWith,
    /// Suffix match.
    EndsWith,
    /// Negated suffix match.
    NendsWith,
    /// Inclusive range.
    Between,
    /// Outside an inclusive range.
    Nbetween,
    /// Null or empty string.
    Empty,
    /// Neither null nor empty string.
    Nempty,
}

impl FilterOperator {
    /// Parses a transport operator such as `_eq`.
    pub fn parse_transport(value: &str) -> AppResult<Self> {
        match value {
            "_eq" => Ok(Self::Eq),
            "_neq" => Ok(Self::Neq),
            "_lt" => Ok(Self::Lt),
            "_lte" => Ok(Self::Lte),
            "_gt" => Ok(Self::Gt),
            "_gte" => Ok(Self::Gte),
            "_in" => Ok(Self::In),
            "_nin" => Ok(Self::Nin),
            "_null" => Ok(Self::Null),
            "_nnull" => Ok(Self::Nnull),
            "_contains" => Ok(Self::Contains),
            "_ncontains" => Ok(Self::Ncontains),
            "_icontains" => Ok(Self::Icontains),
            "_starts_with" => Ok(Self::StartsWith),
            "_nstarts_with" => Ok(Self::NstartsWith),
            "_ends_with" => Ok(Self::EndsWith),
            "_nends_with" => Ok(Self::NendsWith),
            "_between" => Ok(Self::Between),
            "_nbetween" => Ok(Self::Nbetween),
            "_empty" => Ok(Self::Empty),
            "_nempty" => Ok(Self::Nempty),
            _ => Err(AppError::InvalidQuery(format!(
                "unknown filter operator '{value}'"
            ))),
        }
    }

    /// Returns the transport operator.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "_eq",
            Self::Neq => "_neq",
            Self::Lt => "_lt",
            Self::Lte => "_lte",
            Self::Gt => "_gt",
            Self::Gte => "_gte",
            Self::In => "_in",
            Self::Nin => "_nin",
            Self::Null => "_null",
            Self::Nnull => "_nnull",
            Self::Contains => "_contains",
            Self::Ncontains => "_ncontains",
            Self::Icontains => "_icontains",
            Self::StartsWith => "_starts_with",
            Self::NstartsWith => "_nstarts_with",
            Self::EndsWith => "_ends_with",
            Self::NendsWith => "_nends_with",
            Self::Between => "_between",
            Self::Nbetween => "_nbetween",
            Self::Empty => "_empty",
            Self::Nempty => "_nempty",
        }
    }

    /// Returns whether the operator only makes sense on character data.
    #[must_use]
    pub fn is_text_only(self) -> bool {
        matches!(
            self,
            Self::Contains
                | Self::Ncontains
                | Self::Icontains
                | Self::StartsWith
                | Self::NstartsWith
                | Self::EndsWith
                | Self::NendsWith
                | Self::Empty
                | Self::Nempty
        )
    }

    /// Returns whether the operator compares by order.
    #[must_use]
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::Lt | Self::Lte | Self::Gt | Self::Gte | Self::Between | Self::Nbetween
        )
    }

    /// Returns whether the operator expects a list value.
    #[must_use]
    pub fn expects_list(self) -> bool {
        matches!(self, Self::In | Self::Nin)
    }

    /// Returns whether the operator expects a two-element range.
    #[must_use]
    pub fn expects_range(self) -> bool {
        matches!(self, Self::Between | Self::Nbetween)
    }

    /// Returns whether the operator checks for null.
    #[must_use]
    pub fn is_null_check(self) -> bool {
        matches!(self, Self::Null | Self::Nnull)
    }

    /// Returns whether the operator may be applied to the field.
    #[must_use]
    pub fn accepts_field(self, field: &FieldDefinition) -> bool {
        let field_type = field.field_type();
        if field_type == FieldType::Alias {
            return false;
        }
        if field.is_concealed() {
            return self.is_null_check();
        }
        if self.is_text_only() {
            return field_type.is_textual();
        }
        if self.is_ordering() {
            return field_type.is_ordered();
        }

        true
    }

    /// Validates the shape of a literal operand.
    pub fn validate_literal(self, value: &Value) -> AppResult<()> {
        let valid = if self.expects_list() {
            value.is_array()
        } else if self.expects_range() {
            value.as_array().is_some_and(|items| items.len() == 2)
        } else if self.is_null_check() {
            value.is_boolean()
        } else if matches!(self, Self::Empty | Self::Nempty) {
            true
        } else {
            !value.is_array() && !value.is_object()
        };

        if !valid {
            return Err(AppError::InvalidQuery(format!(
                "operator '{}' does not accept value {value}",
                self.as_str()
            )));
        }

        Ok(())
    }
}

/// Caller-dependent placeholder inside a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DynamicVariable {
    /// `$CURRENT_USER` or `$CURRENT_USER.<path>`.
    CurrentUser {
        /// Attribute path on the user record, empty for the id itself.
        path: Vec<String>,
    },
    /// `$CURRENT_ROLE`.
    CurrentRole,
    /// `$CURRENT_ROLES`.
    CurrentRoles,
    /// `$CURRENT_POLICIES`.
    CurrentPolicies,
    /// `$NOW`, optionally shifted, e.g. `$NOW(-7 days)`.
    Now {
        /// Shift applied to the request time.
        offset_seconds: i64,
    },
}

impl DynamicVariable {
    /// Parses a placeholder string, returning `None` for plain literals.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if !value.starts_with('$') {
            return None;
        }

        match value {
            "$CURRENT_USER" => {
                return Some(Self::CurrentUser { path: Vec::new() });
            }
            "$CURRENT_ROLE" => return Some(Self::CurrentRole),
            "$CURRENT_ROLES" => return Some(Self::CurrentRoles),
            "$CURRENT_POLICIES" => return Some(Self::CurrentPolicies),
            "$NOW" => return Some(Self::Now { offset_seconds: 0 }),
            _ => {}
        }

        if let Some(path) = value.strip_prefix("$CURRENT_USER.") {
            let path = path.split('.').map(str::to_owned).collect::<Vec<_>>();
            if path.iter().any(|segment| segment.is_empty()) {
                return None;
            }
            return Some(Self::CurrentUser { path });
        }

        value
            .strip_prefix("$NOW(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(parse_now_offset)
            .map(|offset_seconds| Self::Now { offset_seconds })
    }

    /// Returns the placeholder spelling.
    #[must_use]
    pub fn placeholder(&self) -> String {
        match self {
            Self::CurrentUser { path } if path.is_empty() => "$CURRENT_USER".to_owned(),
            Self::CurrentUser { path } => format!("$CURRENT_USER.{}", path.join(".")),
            Self::CurrentRole => "$CURRENT_ROLE".to_owned(),
            Self::CurrentRoles => "$CURRENT_ROLES".to_owned(),
            Self::CurrentPolicies => "$CURRENT_POLICIES".to_owned(),
            Self::Now { offset_seconds: 0 } => "$NOW".to_owned(),
            Self::Now { offset_seconds } => format!("$NOW({offset_seconds:+} seconds)"),
        }
    }
}

fn parse_now_offset(expression: &str) -> Option<i64> {
    let mut parts = expression.split_whitespace();
    let amount = parts.next()?.parse::<i64>().ok()?;
    let unit = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let seconds_per_unit = match unit.trim_end_matches('s') {
        "second" => 1,
        "minute" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 604_800,
        _ => return None,
    };

    amount.checked_mul(seconds_per_unit)
}

/// Right-hand side of a field condition.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// Constant JSON value.
    Literal(Value),
    /// Placeholder not yet resolved against the caller.
    Variable(DynamicVariable),
    /// Attribute of the caller's user record, read at query time.
    UserAttribute {
        /// Caller user id.
        user: String,
        /// Attribute path on the user collection.
        path: Vec<String>,
    },
}

impl FilterValue {
    fn to_json(&self) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Variable(variable) => Value::String(variable.placeholder()),
            Self::UserAttribute { path, .. } => Value::String(
                DynamicVariable::CurrentUser { path: path.clone() }.placeholder(),
            ),
        }
    }
}

/// How a relational condition quantifies over related rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationQuantifier {
    /// Plain nested filter (at least one related row for one-to-many).
    Direct,
    /// `_some`: at least one related row matches.
    Some,
    /// `_none`: no related row matches.
    None,
}

/// Leaf comparison on a field of the current collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    /// Field name.
    pub field: String,
    /// Operator.
    pub operator: FilterOperator,
    /// Operand.
    pub value: FilterValue,
}

/// Condition evaluated on rows reached through a relation field.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedFilter {
    /// Relation field on the current collection.
    pub field: String,
    /// Target collection scope for any-to-one relations (`field:collection`).
    pub collection: Option<String>,
    /// Quantifier over related rows.
    pub quantifier: RelationQuantifier,
    /// Filter on the related collection.
    pub filter: Box<Filter>,
}

/// Recursive row filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Filter {
    /// All children must match. Empty matches everything.
    And(Vec<Filter>),
    /// Any child may match.
    Or(Vec<Filter>),
    /// Matches nothing.
    Never,
    /// Field comparison.
    Condition(FieldCondition),
    /// Relational condition.
    Related(RelatedFilter),
}

impl Filter {
    /// Returns a filter that matches every row.
    #[must_use]
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    /// Creates a field condition with a literal operand.
    #[must_use]
    pub fn condition(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self::Condition(FieldCondition {
            field: field.into(),
            operator,
            value: FilterValue::Literal(value),
        })
    }

    /// Returns whether the filter matches every row.
    #[must_use]
    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::And(children) if children.is_empty())
    }

    /// Returns whether the filter matches no row.
    #[must_use]
    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    /// Builds a normalized conjunction.
    #[must_use]
    pub fn and(filters: Vec<Filter>) -> Self {
        let mut children = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                Self::Never => return Self::Never,
                Self::And(nested) => children.extend(nested),
                other => children.push(other),
            }
        }

        if children.len() == 1 {
            return children.remove(0);
        }
        Self::And(children)
    }

    /// Builds a normalized disjunction.
    #[must_use]
    pub fn or(filters: Vec<Filter>) -> Self {
        let mut children = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter {
                Self::Never => {}
                filter if filter.is_match_all() => return Self::all(),
                Self::Or(nested) => children.extend(nested),
                other => children.push(other),
            }
        }

        match children.len() {
            0 => Self::Never,
            1 => children.remove(0),
            _ => Self::Or(children),
        }
    }

    /// Parses the JSON filter language.
    pub fn from_json(value: &Value) -> AppResult<Self> {
        match value {
            Value::Object(map) => parse_filter_object(map),
            Value::Null => Ok(Self::all()),
            other => Err(AppError::InvalidQuery(format!(
                "filter must be an object, got {other}"
            ))),
        }
    }

    /// Renders the filter in the JSON filter language.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::And(children) if children.is_empty() => Value::Object(Map::new()),
            Self::And(children) => single_key(
                "_and",
                Value::Array(children.iter().map(Self::to_json).collect()),
            ),
            Self::Or(children) => single_key(
                "_or",
                Value::Array(children.iter().map(Self::to_json).collect()),
            ),
            Self::Never => single_key("_or", Value::Array(Vec::new())),
            Self::Condition(condition) => single_key(
                condition.field.as_str(),
                single_key(condition.operator.as_str(), condition.value.to_json()),
            ),
            Self::Related(related) => {
                let key = match &related.collection {
                    Some(collection) => format!("{}:{collection}", related.field),
                    None => related.field.clone(),
                };
                let nested = related.filter.to_json();
                let body = match related.quantifier {
                    RelationQuantifier::Direct => nested,
                    RelationQuantifier::Some => single_key("_some", nested),
                    RelationQuantifier::None => single_key("_none", nested),
                };
                single_key(key.as_str(), body)
            }
        }
    }

    /// Visits every operand, including those in nested relational filters.
    pub fn for_each_value<F>(&self, visit: &mut F)
    where
        F: FnMut(&FilterValue),
    {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.for_each_value(visit);
                }
            }
            Self::Never => {}
            Self::Condition(condition) => visit(&condition.value),
            Self::Related(related) => related.filter.for_each_value(visit),
        }
    }

    /// Rewrites every field condition, renormalizing groups on the way up.
    #[must_use]
    pub fn map_conditions<F>(self, rewrite: &mut F) -> Self
    where
        F: FnMut(FieldCondition) -> Filter,
    {
        match self {
            Self::And(children) => Self::and(
                children
                    .into_iter()
                    .map(|child| child.map_conditions(rewrite))
                    .collect(),
            ),
            Self::Or(children) => Self::or(
                children
                    .into_iter()
                    .map(|child| child.map_conditions(rewrite))
                    .collect(),
            ),
            Self::Never => Self::Never,
            Self::Condition(condition) => rewrite(condition),
            Self::Related(related) => Self::Related(RelatedFilter {
                filter: Box::new(related.filter.map_conditions(rewrite)),
                ..related
            }),
        }
    }
}

impl TryFrom<Value> for Filter {
    type Error = AppError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        filter.to_json()
    }
}

fn single_key(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_owned(), value);
    Value::Object(map)
}

fn parse_filter_object(map: &Map<String, Value>) -> AppResult<Filter> {
    let mut parts = Vec::with_capacity(map.len());

    for (key, value) in map {
        match key.as_str() {
            "_and" => parts.push(Filter::and(parse_filter_list(key, value)?)),
            "_or" => parts.push(Filter::or(parse_filter_list(key, value)?)),
            operator if operator.starts_with('_') => {
                return Err(AppError::InvalidQuery(format!(
                    "operator '{operator}' must be nested under a field"
                )));
            }
            field => parts.push(parse_field_filter(field, value)?),
        }
    }

    Ok(Filter::and(parts))
}

fn parse_filter_list(key: &str, value: &Value) -> AppResult<Vec<Filter>> {
    let Value::Array(items) = value else {
        return Err(AppError::InvalidQuery(format!(
            "'{key}' expects an array of filters"
        )));
    };

    items.iter().map(Filter::from_json).collect()
}

fn parse_field_filter(key: &str, value: &Value) -> AppResult<Filter> {
    let (field, collection) = match key.split_once(':') {
        Some((field, collection)) if !field.is_empty() && !collection.is_empty() => {
            (field.to_owned(), Some(collection.to_owned()))
        }
        Some(_) => {
            return Err(AppError::InvalidQuery(format!(
                "malformed scoped filter key '{key}'"
            )));
        }
        None => (key.to_owned(), None),
    };

    let Value::Object(entries) = value else {
        return Err(AppError::InvalidQuery(format!(
            "filter for field '{field}' must be an object"
        )));
    };

    let mut parts = Vec::new();
    let mut nested = Map::new();
    for (entry_key, entry_value) in entries {
        let quantifier = match entry_key.as_str() {
            "_some" => Some(RelationQuantifier::Some),
            "_none" => Some(RelationQuantifier::None),
            _ => None,
        };

        if let Some(quantifier) = quantifier {
            parts.push(Filter::Related(RelatedFilter {
                field: field.clone(),
                collection: collection.clone(),
                quantifier,
                filter: Box::new(Filter::from_json(entry_value)?),
            }));
        } else if entry_key.starts_with('_') {
            if collection.is_some() {
                return Err(AppError::InvalidQuery(format!(
                    "scoped key '{key}' only accepts a nested filter"
                )));
            }
            parts.push(Filter::Condition(FieldCondition {
                field: field.clone(),
                operator: FilterOperator::parse_transport(entry_key)?,
                value: parse_filter_value(entry_value),
            }));
        } else {
            nested.insert(entry_key.clone(), entry_value.clone());
        }
    }

    if !nested.is_empty() || (entries.is_empty() && collection.is_some()) {
        parts.push(Filter::Related(RelatedFilter {
            field,
            collection,
            quantifier: RelationQuantifier::Direct,
            filter: Box::new(parse_filter_object(&nested)?),
        }));
    }

    Ok(Filter::and(parts))
}

fn parse_filter_value(value: &Value) -> FilterValue {
    match value {
        Value::String(text) => DynamicVariable::parse(text)
            .map(FilterValue::Variable)
            .unwrap_or_else(|| FilterValue::Literal(value.clone())),
        other => FilterValue::Literal(other.clone()),
    }
}
