use serde_json::{Map, Value};
use tessera_domain::{FieldAllowList, Filter, PermissionRule};

/// How rules for the same collection and action combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Any rule grants access: filters OR, fields union.
    Union,
    /// Every rule must grant access: filters AND, fields intersection.
    Intersection,
}

/// Effective permission of a rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPermission {
    /// Row filter; `None` is unrestricted.
    pub filter: Option<Filter>,
    /// Field allow-list.
    pub fields: FieldAllowList,
    /// Merged presets, later rules winning per key.
    pub presets: Option<Value>,
    /// Number of merged rules.
    pub rule_count: usize,
}

impl MergedPermission {
    /// Returns the "no access" result of an empty rule set.
    #[must_use]
    pub fn locked() -> Self {
        Self {
            filter: Some(Filter::Never),
            fields: FieldAllowList::none(),
            presets: None,
            rule_count: 0,
        }
    }

    /// Returns whether the permission grants nothing.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.filter.as_ref().is_some_and(Filter::is_never) || self.fields.is_empty()
    }
}

/// Merges rules into one effective filter and field allow-list.
#[must_use]
pub fn merge_permissions(rules: &[PermissionRule], strategy: MergeStrategy) -> MergedPermission {
    if rules.is_empty() {
        return MergedPermission::locked();
    }

    let (filter, fields) = match strategy {
        MergeStrategy::Union => (union_filters(rules), union_fields(rules)),
        MergeStrategy::Intersection => (intersect_filters(rules), intersect_fields(rules)),
    };

    MergedPermission {
        filter,
        fields,
        presets: merge_presets(rules),
        rule_count: rules.len(),
    }
}

fn union_filters(rules: &[PermissionRule]) -> Option<Filter> {
    let mut filters = Vec::with_capacity(rules.len());
    for rule in rules {
        match rule.filter() {
            None => return None,
            Some(filter) if filter.is_match_all() => return None,
            Some(filter) => filters.push(filter.clone()),
        }
    }

    Some(Filter::or(filters))
}

fn intersect_filters(rules: &[PermissionRule]) -> Option<Filter> {
    let filters = rules
        .iter()
        .filter_map(PermissionRule::filter)
        .filter(|filter| !filter.is_match_all())
        .cloned()
        .collect::<Vec<_>>();

    if filters.is_empty() {
        return None;
    }
    Some(Filter::and(filters))
}

fn union_fields(rules: &[PermissionRule]) -> FieldAllowList {
    rules
        .iter()
        .fold(FieldAllowList::none(), |merged, rule| merged.union(rule.fields()))
}

fn intersect_fields(rules: &[PermissionRule]) -> FieldAllowList {
    rules
        .iter()
        .fold(FieldAllowList::All, |merged, rule| {
            merged.intersection(rule.fields())
        })
}

fn merge_presets(rules: &[PermissionRule]) -> Option<Value> {
    let mut merged = Map::new();
    let mut seen = false;
    for presets in rules.iter().filter_map(PermissionRule::presets) {
        if let Value::Object(entries) = presets {
            seen = true;
            merged.extend(entries.clone());
        }
    }

    seen.then_some(Value::Object(merged))
}
