use serde_json::{Number, Value};
use tessera_domain::{
    FieldCondition, FieldType, FilterOperator, FilterValue, RelatedFilter, RelationQuantifier,
    SortField,
};

use super::*;
use crate::query_plan::{
    BoundSort, BoundValue, RelatedCondition, RelatedLink, UserAttribute, UserAttributeStep,
};

impl LevelAuthorizer<'_> {
    /// Resolves placeholders in a caller filter, then binds it with allow-list checks.
    pub(super) fn bind_caller_filter(
        &self,
        collection: &CollectionSchema,
        filter: &Filter,
        depth: usize,
    ) -> AppResult<BoundFilter> {
        let context = DynamicVariableContext::collect(filter);
        let resolved = self
            .resolver
            .resolve(filter.clone(), self.accountability, &context);
        self.bind_filter(collection, &resolved, depth, FilterSource::Caller)
    }

    pub(super) fn bind_filter(
        &self,
        collection: &CollectionSchema,
        filter: &Filter,
        depth: usize,
        source: FilterSource,
    ) -> AppResult<BoundFilter> {
        match filter {
            Filter::And(children) => Ok(BoundFilter::And(
                children
                    .iter()
                    .map(|child| self.bind_filter(collection, child, depth, source))
                    .collect::<AppResult<_>>()?,
            )),
            Filter::Or(children) => Ok(BoundFilter::Or(
                children
                    .iter()
                    .map(|child| self.bind_filter(collection, child, depth, source))
                    .collect::<AppResult<_>>()?,
            )),
            Filter::Never => Ok(BoundFilter::Never),
            Filter::Condition(condition) => {
                self.bind_condition(collection, condition, depth, source)
            }
            Filter::Related(related) => self.bind_related(collection, related, depth, source),
        }
    }

    fn bind_condition(
        &self,
        collection: &CollectionSchema,
        condition: &FieldCondition,
        depth: usize,
        source: FilterSource,
    ) -> AppResult<BoundFilter> {
        let field = self.referenced_field(collection, &condition.field, source)?;
        if !condition.operator.accepts_field(field) {
            return Err(AppError::InvalidQuery(format!(
                "operator '{}' cannot be used on field '{}' of '{}'",
                condition.operator.as_str(),
                condition.field,
                collection.name()
            )));
        }

        let value = match &condition.value {
            FilterValue::Literal(value) => {
                condition.operator.validate_literal(value)?;
                BoundValue::Literal(value.clone())
            }
            FilterValue::UserAttribute { user, path } => {
                if !matches!(
                    condition.operator,
                    FilterOperator::Eq
                        | FilterOperator::Neq
                        | FilterOperator::Lt
                        | FilterOperator::Lte
                        | FilterOperator::Gt
                        | FilterOperator::Gte
                        | FilterOperator::In
                        | FilterOperator::Nin
                ) {
                    return Err(AppError::InvalidQuery(format!(
                        "operator '{}' cannot compare against a user attribute",
                        condition.operator.as_str()
                    )));
                }
                BoundValue::UserAttribute(self.user_attribute(user, path)?)
            }
            FilterValue::Variable(variable) => {
                return Err(AppError::Internal(format!(
                    "placeholder '{}' reached the planner unresolved",
                    variable.placeholder()
                )));
            }
        };

        let null_check = condition.operator.is_null_check()
            || (matches!(condition.operator, FilterOperator::Eq | FilterOperator::Neq)
                && matches!(&value, BoundValue::Literal(Value::Null)));
        let compare = BoundFilter::Compare {
            field: condition.field.clone(),
            kind: column_kind(collection, field)?,
            operator: condition.operator,
            value,
        };
        if source == FilterSource::Permission {
            return Ok(compare);
        }

        let visible = self.field_visibility(collection, &condition.field, depth, !null_check)?;
        Ok(restrict(visible, compare))
    }

    fn bind_related(
        &self,
        collection: &CollectionSchema,
        related: &RelatedFilter,
        depth: usize,
        source: FilterSource,
    ) -> AppResult<BoundFilter> {
        let field = self.referenced_field(collection, &related.field, source)?;
        let relation = self
            .schema
            .relation(collection.name(), field.name())
            .ok_or_else(|| {
                AppError::InvalidQuery(format!(
                    "field '{}' of '{}' is not a relation",
                    related.field,
                    collection.name()
                ))
            })?;
        let depth = match source {
            FilterSource::Caller => self.descend(depth)?,
            FilterSource::Permission => depth + 1,
        };

        let (quantifier, target, link) = match relation.kind() {
            RelationKind::ManyToOne => {
                self.require_unscoped(related)?;
                if related.quantifier != RelationQuantifier::Direct {
                    return Err(quantifier_needs_one_to_many(related));
                }
                let target = self.related_collection(relation)?;
                let link = RelatedLink::ManyToOne {
                    foreign_key: field.name().to_owned(),
                    collection: target.name().to_owned(),
                    primary_key: target.primary_key().to_owned(),
                };
                (RelationQuantifier::Direct, target, link)
            }
            RelationKind::OneToMany => {
                self.require_unscoped(related)?;
                let target = self.related_collection(relation)?;
                let (foreign_key, _) = self.inverse_key(relation, target)?;
                let quantifier = match related.quantifier {
                    RelationQuantifier::Direct | RelationQuantifier::Some => RelationQuantifier::Some,
                    RelationQuantifier::None => RelationQuantifier::None,
                };
                let link = RelatedLink::OneToMany {
                    collection: target.name().to_owned(),
                    foreign_key,
                    parent_key: collection.primary_key().to_owned(),
                };
                (quantifier, target, link)
            }
            RelationKind::AnyToOne => {
                let Some(scope) = related.collection.as_deref() else {
                    return Err(AppError::InvalidQuery(format!(
                        "filter on any-to-one '{0}' needs a collection scope such as '{0}:<collection>'",
                        related.field
                    )));
                };
                if !relation.allowed_collections().iter().any(|allowed| allowed == scope) {
                    return Err(AppError::InvalidQuery(format!(
                        "collection '{scope}' is not allowed on any-to-one '{}.{}'",
                        collection.name(),
                        related.field
                    )));
                }
                if related.quantifier != RelationQuantifier::Direct {
                    return Err(quantifier_needs_one_to_many(related));
                }
                let target = self.collection(scope)?;
                let collection_field = relation.collection_field().ok_or_else(|| {
                    AppError::Internal(format!(
                        "any-to-one '{}.{}' has no collection field",
                        collection.name(),
                        related.field
                    ))
                })?;
                let link = RelatedLink::AnyToOne {
                    foreign_key: field.name().to_owned(),
                    collection_field: collection_field.to_owned(),
                    collection: target.name().to_owned(),
                    primary_key: target.primary_key().to_owned(),
                };
                (RelationQuantifier::Direct, target, link)
            }
        };

        let filter = self.related_rows_filter(target, &related.filter, depth, source)?;
        let condition = BoundFilter::Related(RelatedCondition {
            quantifier,
            link,
            filter: Box::new(filter),
        });
        if source == FilterSource::Permission {
            return Ok(condition);
        }

        let visible = self.field_visibility(collection, &related.field, depth, false)?;
        Ok(restrict(visible, condition))
    }

    /// Returns the condition under which `field` of a row is visible to the
    /// caller, `None` when it is visible on every returned row.
    ///
    /// A field granted only by some rules is visible on rows matching one of
    /// those rules. With `key_link`, a many-to-one key is also hidden when
    /// the related row is not readable, as in its shadow output.
    pub(super) fn field_visibility(
        &self,
        collection: &CollectionSchema,
        field: &str,
        depth: usize,
        key_link: bool,
    ) -> AppResult<Option<BoundFilter>> {
        if self.is_admin() {
            return Ok(None);
        }

        let grant = self.grant(collection.name())?;
        let mut parts = Vec::with_capacity(2);
        if !grant.cases.is_empty() && !grant.always.allows(field) {
            let mut granting = grant
                .cases
                .iter()
                .filter(|(_, fields)| fields.allows(field))
                .map(|(filter, _)| {
                    self.bind_filter(collection, filter, depth, FilterSource::Permission)
                })
                .collect::<AppResult<Vec<_>>>()?;
            parts.push(match granting.len() {
                0 => BoundFilter::Never,
                1 => granting.remove(0),
                _ => BoundFilter::Or(granting),
            });
        }
        if key_link && let Some(linked) = self.linked_key_visibility(collection, field, depth)? {
            parts.push(linked);
        }

        Ok(BoundFilter::all_of(parts))
    }

    /// Requires the row referenced by a many-to-one key to be readable.
    fn linked_key_visibility(
        &self,
        collection: &CollectionSchema,
        field: &str,
        depth: usize,
    ) -> AppResult<Option<BoundFilter>> {
        let Some(relation) = self
            .schema
            .relation(collection.name(), field)
            .filter(|relation| relation.kind() == RelationKind::ManyToOne)
        else {
            return Ok(None);
        };
        let related = self.related_collection(relation)?;
        if related.is_system() {
            return Ok(None);
        }

        let filter = match &self.grant(related.name())?.filter {
            None => return Ok(None),
            Some(filter) if filter.is_never() => return Ok(Some(BoundFilter::Never)),
            Some(filter) => {
                self.bind_filter(related, filter, depth + 1, FilterSource::Permission)?
            }
        };
        Ok(Some(BoundFilter::Related(RelatedCondition {
            quantifier: RelationQuantifier::Direct,
            link: RelatedLink::ManyToOne {
                foreign_key: field.to_owned(),
                collection: related.name().to_owned(),
                primary_key: related.primary_key().to_owned(),
            },
            filter: Box::new(filter),
        })))
    }

    /// Binds the filter applied to related rows. Caller filters only see
    /// related rows the caller may read.
    fn related_rows_filter(
        &self,
        target: &CollectionSchema,
        filter: &Filter,
        depth: usize,
        source: FilterSource,
    ) -> AppResult<BoundFilter> {
        if source == FilterSource::Permission {
            return self.bind_filter(target, filter, depth, source);
        }

        let grant = self.require_readable(target.name())?;
        let mut parts = Vec::with_capacity(2);
        if let Some(permission) = &grant.filter {
            parts.push(self.bind_filter(target, permission, depth, FilterSource::Permission)?);
        }
        parts.push(self.bind_filter(target, filter, depth, source)?);

        Ok(BoundFilter::all_of(parts).unwrap_or_else(|| BoundFilter::And(Vec::new())))
    }

    fn require_unscoped(&self, related: &RelatedFilter) -> AppResult<()> {
        match &related.collection {
            Some(scope) => Err(AppError::InvalidQuery(format!(
                "collection scope '{scope}' only applies to any-to-one fields, '{}' is not one",
                related.field
            ))),
            None => Ok(()),
        }
    }

    /// Resolves `$CURRENT_USER.<path>` to a chain of scalar lookups starting
    /// at the user collection.
    fn user_attribute(&self, user: &str, path: &[String]) -> AppResult<UserAttribute> {
        let mut collection = self
            .schema
            .collection(&self.config.user_collection)
            .ok_or_else(|| {
                AppError::InvalidQuery(format!(
                    "user collection '{}' does not exist",
                    self.config.user_collection
                ))
            })?;

        let mut steps = Vec::with_capacity(path.len());
        for (index, segment) in path.iter().enumerate() {
            let unknown = || {
                AppError::InvalidQuery(format!(
                    "unknown user attribute '$CURRENT_USER.{}'",
                    path.join(".")
                ))
            };
            let field = collection
                .field(segment)
                .filter(|field| field.field_type().has_column())
                .ok_or_else(unknown)?;
            let key = collection.primary_key_field()?;
            steps.push(UserAttributeStep {
                collection: collection.name().to_owned(),
                key_field: key.name().to_owned(),
                key_kind: column_kind(collection, key)?,
                field: field.name().to_owned(),
            });

            if index + 1 < path.len() {
                let relation = self
                    .schema
                    .relation(collection.name(), segment)
                    .filter(|relation| relation.kind() == RelationKind::ManyToOne)
                    .ok_or_else(unknown)?;
                collection = self.related_collection(relation)?;
            }
        }

        Ok(UserAttribute {
            user: user.to_owned(),
            steps,
        })
    }

    /// Builds the OR of per-field matches for a free-text search term over
    /// fields visible to the caller.
    pub(super) fn search_filter(
        &self,
        collection: &CollectionSchema,
        term: &str,
        depth: usize,
    ) -> AppResult<BoundFilter> {
        let grant = self.grant(collection.name())?;
        let integer = term.parse::<i64>().ok();
        let float = term.parse::<f64>().ok().and_then(Number::from_f64);

        let mut options = Vec::new();
        for field in collection.fields() {
            if !grant.fields.allows(field.name()) || field.is_concealed() {
                continue;
            }
            let field_type = field.field_type();
            let (operator, value) = if field_type.is_textual() {
                (FilterOperator::Icontains, Value::String(term.to_owned()))
            } else if field_type.is_numeric() {
                let number = match field_type {
                    FieldType::Float => float.clone(),
                    _ => integer.map(Number::from),
                };
                let Some(number) = number else {
                    continue;
                };
                (FilterOperator::Eq, Value::Number(number))
            } else {
                continue;
            };

            let compare = BoundFilter::Compare {
                field: field.name().to_owned(),
                kind: column_kind(collection, field)?,
                operator,
                value: BoundValue::Literal(value),
            };
            let visible = self.field_visibility(collection, field.name(), depth, true)?;
            match restrict(visible, compare) {
                BoundFilter::Never => {}
                option => options.push(option),
            }
        }

        if options.is_empty() {
            return Ok(BoundFilter::Never);
        }
        Ok(BoundFilter::Or(options))
    }

    pub(super) fn bind_sort(
        &self,
        collection: &CollectionSchema,
        sort: &[SortField],
        depth: usize,
    ) -> AppResult<Vec<BoundSort>> {
        sort.iter()
            .map(|key| {
                let field = self.referenced_field(collection, &key.field, FilterSource::Caller)?;
                if !field.field_type().has_column() || field.is_concealed() {
                    return Err(AppError::InvalidQuery(format!(
                        "field '{}' of '{}' cannot be sorted on",
                        key.field,
                        collection.name()
                    )));
                }
                Ok(BoundSort {
                    field: key.field.clone(),
                    direction: key.direction,
                    visible_when: self.field_visibility(collection, &key.field, depth, true)?,
                })
            })
            .collect()
    }
}

/// Applies `filter` only where the referenced field is visible.
fn restrict(visible: Option<BoundFilter>, filter: BoundFilter) -> BoundFilter {
    match visible {
        None => filter,
        Some(visible) => BoundFilter::all_of(vec![visible, filter])
            .unwrap_or_else(|| BoundFilter::And(Vec::new())),
    }
}

fn quantifier_needs_one_to_many(related: &RelatedFilter) -> AppError {
    AppError::InvalidQuery(format!(
        "'_some' and '_none' need a one-to-many field, '{}' is not one",
        related.field
    ))
}
