use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::Value;
use tessera_domain::{
    Accountability, DynamicVariable, FieldCondition, Filter, FilterOperator, FilterValue,
};

/// Placeholders that occur inside one merged filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicVariableContext {
    /// `$CURRENT_USER` as a constant id.
    pub current_user: bool,
    /// `$CURRENT_USER.<path>` lookups that need a correlated sub-select.
    pub current_user_paths: BTreeSet<Vec<String>>,
    /// `$CURRENT_ROLE`.
    pub current_role: bool,
    /// `$CURRENT_ROLES`.
    pub current_roles: bool,
    /// `$CURRENT_POLICIES`.
    pub current_policies: bool,
    /// `$NOW`.
    pub now: bool,
}

impl DynamicVariableContext {
    /// Collects the placeholders used by `filter`.
    #[must_use]
    pub fn collect(filter: &Filter) -> Self {
        let mut context = Self::default();
        filter.for_each_value(&mut |value| {
            if let FilterValue::Variable(variable) = value {
                match variable {
                    DynamicVariable::CurrentUser { path } if path.is_empty() => {
                        context.current_user = true;
                    }
                    DynamicVariable::CurrentUser { path } => {
                        context.current_user_paths.insert(path.clone());
                    }
                    DynamicVariable::CurrentRole => context.current_role = true,
                    DynamicVariable::CurrentRoles => context.current_roles = true,
                    DynamicVariable::CurrentPolicies => context.current_policies = true,
                    DynamicVariable::Now { .. } => context.now = true,
                }
            }
        });
        context
    }

    /// Returns whether the filter is free of placeholders.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Substitutes caller-dependent placeholders inside permission filters.
#[derive(Debug, Clone, Copy)]
pub struct DynamicVariableResolver {
    now: DateTime<Utc>,
}

impl DynamicVariableResolver {
    /// Creates a resolver with a fixed request time.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Replaces every placeholder of `filter` with a value taken from `accountability`.
    ///
    /// A placeholder without a value for this caller turns its comparison into
    /// [`Filter::Never`]. User attribute paths become [`FilterValue::UserAttribute`]
    /// markers rendered as correlated sub-selects.
    #[must_use]
    pub fn resolve(
        &self,
        filter: Filter,
        accountability: &Accountability,
        context: &DynamicVariableContext,
    ) -> Filter {
        if context.is_empty() {
            return filter;
        }

        filter.map_conditions(&mut |condition| self.resolve_condition(condition, accountability))
    }

    fn resolve_condition(&self, condition: FieldCondition, accountability: &Accountability) -> Filter {
        let FilterValue::Variable(variable) = &condition.value else {
            return Filter::Condition(condition);
        };

        let value = match variable {
            DynamicVariable::CurrentUser { path } => match accountability.user() {
                Some(user) if path.is_empty() => FilterValue::Literal(Value::String(user.to_owned())),
                Some(user) => FilterValue::UserAttribute {
                    user: user.to_owned(),
                    path: path.clone(),
                },
                None => return Filter::Never,
            },
            DynamicVariable::CurrentRole => match accountability.role() {
                Some(role) => FilterValue::Literal(Value::String(role.to_owned())),
                None => return Filter::Never,
            },
            DynamicVariable::CurrentRoles => string_list(accountability.roles()),
            DynamicVariable::CurrentPolicies => string_list(accountability.policies()),
            DynamicVariable::Now { offset_seconds } => {
                let shifted = TimeDelta::try_seconds(*offset_seconds)
                    .and_then(|offset| self.now.checked_add_signed(offset));
                match shifted {
                    Some(moment) => FilterValue::Literal(Value::String(
                        moment.to_rfc3339_opts(SecondsFormat::Millis, true),
                    )),
                    None => return Filter::Never,
                }
            }
        };

        let operator = match (&value, condition.operator) {
            (FilterValue::Literal(Value::Array(_)), FilterOperator::Eq) => FilterOperator::In,
            (FilterValue::Literal(Value::Array(_)), FilterOperator::Neq) => FilterOperator::Nin,
            (_, operator) => operator,
        };

        Filter::Condition(FieldCondition {
            field: condition.field,
            operator,
            value,
        })
    }
}

fn string_list(values: &[String]) -> FilterValue {
    FilterValue::Literal(Value::Array(
        values.iter().cloned().map(Value::String).collect(),
    ))
}
