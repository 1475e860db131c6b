use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tessera_core::{AppError, AppResult};
use tessera_domain::{
    Accountability, CollectionSchema, FieldAllowList, FieldDefinition, Filter, NodeQuery,
    PermissionAction, PermissionRule, QueryNode, QueryTree, Relation, RelationKind,
    SchemaOverview,
};
use tracing::debug;

use crate::query_plan::{
    AccessCase, BoundFilter, LevelAccess, PlannedField, PlannedLevel, PlannedRelation,
};
use crate::{
    ColumnKind, DynamicVariableContext, DynamicVariableResolver, EngineConfig, MergeStrategy,
    PermissionCatalog, merge_permissions,
};

mod collect;
mod filters;
mod levels;

/// Turns a query tree into an authorized plan.
///
/// Permissions of every collection the tree can touch are loaded up front,
/// so planning itself never waits on storage and no statement can be built
/// from a partially resolved filter.
pub struct PermissionInjector<'a> {
    schema: &'a SchemaOverview,
    catalog: &'a PermissionCatalog,
    config: &'a EngineConfig,
    resolver: DynamicVariableResolver,
}

impl<'a> PermissionInjector<'a> {
    /// Creates an injector for one request.
    #[must_use]
    pub fn new(
        schema: &'a SchemaOverview,
        catalog: &'a PermissionCatalog,
        config: &'a EngineConfig,
        resolver: DynamicVariableResolver,
    ) -> Self {
        Self {
            schema,
            catalog,
            config,
            resolver,
        }
    }

    /// Authorizes `tree` for an already resolved caller.
    pub async fn inject(
        &self,
        tree: &QueryTree,
        accountability: &Accountability,
    ) -> AppResult<PlannedLevel> {
        let collections = collect::referenced_collections(self.schema, tree);
        let grants = self.load_grants(collections, accountability).await;

        let authorizer = LevelAuthorizer {
            schema: self.schema,
            config: self.config,
            accountability,
            resolver: self.resolver,
            grants: &grants,
        };
        authorizer.root(tree)
    }

    async fn load_grants(
        &self,
        collections: BTreeSet<String>,
        accountability: &Accountability,
    ) -> BTreeMap<String, CollectionGrant> {
        if accountability.is_admin() {
            return collections
                .into_iter()
                .map(|collection| (collection, CollectionGrant::unrestricted()))
                .collect();
        }

        let loads = collections.into_iter().map(|collection| async move {
            let rules = self
                .catalog
                .rules_for_accountability(accountability, &collection, PermissionAction::Read)
                .await;
            (collection, rules)
        });
        let loaded = join_all(loads).await;
        debug!(collections = loaded.len(), "loaded read permissions");

        loaded
            .into_iter()
            .map(|(collection, rules)| {
                let grant = CollectionGrant::from_rules(&rules, &self.resolver, accountability);
                (collection, grant)
            })
            .collect()
    }
}

/// Read access of the caller on one collection, placeholders resolved.
#[derive(Debug, Clone)]
struct CollectionGrant {
    readable: bool,
    fields: FieldAllowList,
    filter: Option<Filter>,
    always: FieldAllowList,
    cases: Vec<(Filter, FieldAllowList)>,
}

impl CollectionGrant {
    fn unrestricted() -> Self {
        Self {
            readable: true,
            fields: FieldAllowList::All,
            filter: None,
            always: FieldAllowList::All,
            cases: Vec::new(),
        }
    }

    fn from_rules(
        rules: &[PermissionRule],
        resolver: &DynamicVariableResolver,
        accountability: &Accountability,
    ) -> Self {
        let resolve = |filter: Filter| {
            let context = DynamicVariableContext::collect(&filter);
            resolver.resolve(filter, accountability, &context)
        };

        let merged = merge_permissions(rules, MergeStrategy::Union);
        let filter = merged.filter.clone().map(resolve);

        let uniform = rules
            .windows(2)
            .all(|pair| pair[0].fields() == pair[1].fields());
        let (always, cases) = if uniform {
            (merged.fields.clone(), Vec::new())
        } else {
            let mut always = FieldAllowList::none();
            let mut cases = Vec::new();
            for rule in rules {
                let resolved = rule
                    .filter()
                    .filter(|filter| !filter.is_match_all())
                    .map(|filter| resolve(filter.clone()));
                match resolved {
                    None => always = always.union(rule.fields()),
                    Some(filter) if filter.is_match_all() => always = always.union(rule.fields()),
                    Some(filter) if filter.is_never() => {}
                    Some(filter) => cases.push((filter, rule.fields().clone())),
                }
            }
            cases.retain(|(_, fields)| !fields.is_subset_of(&always));
            (always, cases)
        };

        Self {
            readable: !merged.is_locked(),
            fields: merged.fields,
            filter,
            always,
            cases,
        }
    }
}

/// Where a filter came from; only caller filters are checked against the
/// field allow-list and the depth bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterSource {
    Caller,
    Permission,
}

struct LevelAuthorizer<'a> {
    schema: &'a SchemaOverview,
    config: &'a EngineConfig,
    accountability: &'a Accountability,
    resolver: DynamicVariableResolver,
    grants: &'a BTreeMap<String, CollectionGrant>,
}

impl LevelAuthorizer<'_> {
    fn is_admin(&self) -> bool {
        self.accountability.is_admin()
    }

    fn grant(&self, collection: &str) -> AppResult<&CollectionGrant> {
        self.grants.get(collection).ok_or_else(|| {
            AppError::Internal(format!(
                "permissions for collection '{collection}' were not loaded"
            ))
        })
    }

    fn collection(&self, name: &str) -> AppResult<&CollectionSchema> {
        match self.schema.collection(name) {
            Some(collection) => Ok(collection),
            None if self.is_admin() => Err(AppError::InvalidQuery(format!(
                "collection '{name}' does not exist"
            ))),
            None => Err(collection_forbidden(name)),
        }
    }

    fn require_readable(&self, collection: &str) -> AppResult<&CollectionGrant> {
        let grant = self.grant(collection)?;
        if !grant.readable {
            return Err(collection_forbidden(collection));
        }
        Ok(grant)
    }

    fn related_collection(&self, relation: &Relation) -> AppResult<&CollectionSchema> {
        relation
            .related_collection()
            .and_then(|name| self.schema.collection(name))
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "relation '{}.{}' has no related collection",
                    relation.collection(),
                    relation.field()
                ))
            })
    }

    fn relation_of(
        &self,
        collection: &CollectionSchema,
        field: &str,
        kind: RelationKind,
    ) -> AppResult<&Relation> {
        match self.schema.relation(collection.name(), field) {
            Some(relation) if relation.kind() == kind => Ok(relation),
            Some(relation) => Err(AppError::InvalidQuery(format!(
                "field '{field}' of '{}' is a {} relation, not {}",
                collection.name(),
                relation.kind().as_str(),
                kind.as_str()
            ))),
            None => Err(AppError::InvalidQuery(format!(
                "field '{field}' of '{}' is not a relation",
                collection.name()
            ))),
        }
    }

    fn descend(&self, depth: usize) -> AppResult<usize> {
        let next = depth + 1;
        if next > self.config.max_relational_depth {
            return Err(AppError::InvalidQuery(format!(
                "query nests deeper than {} relations",
                self.config.max_relational_depth
            )));
        }
        Ok(next)
    }

    /// Looks up a field the caller asked to read. Invisible fields are `None`
    /// for regular callers.
    fn visible_field<'c>(
        &self,
        collection: &'c CollectionSchema,
        name: &str,
    ) -> AppResult<Option<&'c FieldDefinition>> {
        let grant = self.grant(collection.name())?;
        match collection.field(name) {
            Some(field) if grant.fields.allows(name) => Ok(Some(field)),
            None if self.is_admin() => Err(AppError::InvalidQuery(format!(
                "field '{name}' does not exist on '{}'",
                collection.name()
            ))),
            _ => Ok(None),
        }
    }

    /// Looks up a field referenced by a filter or sort.
    fn referenced_field<'c>(
        &self,
        collection: &'c CollectionSchema,
        name: &str,
        source: FilterSource,
    ) -> AppResult<&'c FieldDefinition> {
        let field = collection.field(name);
        if source == FilterSource::Permission {
            return field.ok_or_else(|| {
                AppError::InvalidQuery(format!(
                    "permission filter references unknown field '{name}' of '{}'",
                    collection.name()
                ))
            });
        }

        let grant = self.grant(collection.name())?;
        match field {
            Some(field) if grant.fields.allows(name) => Ok(field),
            None if self.is_admin() => Err(AppError::InvalidQuery(format!(
                "field '{name}' does not exist on '{}'",
                collection.name()
            ))),
            _ => Err(AppError::Forbidden(format!(
                "you don't have permission to access field '{name}' of '{}'",
                collection.name()
            ))),
        }
    }
}

fn collection_forbidden(collection: &str) -> AppError {
    AppError::Forbidden(format!(
        "you don't have permission to access collection '{collection}'"
    ))
}

fn column_kind(collection: &CollectionSchema, field: &FieldDefinition) -> AppResult<ColumnKind> {
    ColumnKind::for_field_type(field.field_type()).ok_or_else(|| {
        AppError::InvalidQuery(format!(
            "field '{}' of '{}' has no column",
            field.name(),
            collection.name()
        ))
    })
}
