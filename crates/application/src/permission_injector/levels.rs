use tessera_domain::{AnyToOneNode, FunctionNode, Limit, NestedNode};

use super::*;
use crate::query_plan::{PolymorphicBranch, RelationOutput, RelationStrategy};

enum PlannedOutput {
    Field(PlannedField),
    Relation(PlannedRelation),
}

impl PlannedOutput {
    fn output_key(&self) -> &str {
        match self {
            Self::Field(field) => field.output_key(),
            Self::Relation(relation) => &relation.output_key,
        }
    }
}

/// How a level is fetched, which decides whether sort applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelShape {
    Listed,
    Single,
}

impl LevelAuthorizer<'_> {
    pub(super) fn root(&self, tree: &QueryTree) -> AppResult<PlannedLevel> {
        let collection = self.collection(&tree.collection)?;
        self.require_readable(collection.name())?;
        self.level(collection, &tree.children, &tree.query, 0, LevelShape::Listed)
    }

    fn level(
        &self,
        collection: &CollectionSchema,
        children: &[QueryNode],
        query: &NodeQuery,
        depth: usize,
        shape: LevelShape,
    ) -> AppResult<PlannedLevel> {
        let grant = self.grant(collection.name())?;
        let primary_key = collection.primary_key_field()?;

        let mut outputs = Vec::with_capacity(children.len());
        let mut taken = BTreeSet::new();
        let mut wildcard = false;
        for child in children {
            if matches!(child, QueryNode::Field(node) if node.name == "*") {
                wildcard = true;
                continue;
            }
            let Some(output) = self.plan_child(collection, child, depth)? else {
                continue;
            };
            if !taken.insert(output.output_key().to_owned()) {
                return Err(AppError::InvalidQuery(format!(
                    "output key '{}' is requested twice on '{}'",
                    output.output_key(),
                    collection.name()
                )));
            }
            outputs.push(output);
        }

        if wildcard {
            for field in collection.fields() {
                if !field.field_type().has_column() || taken.contains(field.name()) {
                    continue;
                }
                if let Some(output) =
                    self.plan_primitive(collection, field.name(), field.name().to_owned())?
                {
                    taken.insert(output.output_key().to_owned());
                    outputs.push(output);
                }
            }
        }

        let mut fields = Vec::new();
        let mut relations = Vec::new();
        for output in outputs {
            match output {
                PlannedOutput::Field(field) => fields.push(field),
                PlannedOutput::Relation(relation) => relations.push(relation),
            }
        }

        let mut filters = Vec::new();
        if let Some(permission) = &grant.filter {
            filters.push(self.bind_filter(collection, permission, depth, FilterSource::Permission)?);
        }
        if let Some(filter) = &query.filter {
            filters.push(self.bind_caller_filter(collection, filter, depth)?);
        }
        if let Some(term) = query.search.as_deref().map(str::trim).filter(|term| !term.is_empty()) {
            filters.push(self.search_filter(collection, term, depth)?);
        }

        let sort = match shape {
            LevelShape::Listed => self.bind_sort(collection, &query.sort, depth)?,
            LevelShape::Single => Vec::new(),
        };

        let limit = self.config.effective_limit(query.limit);
        Ok(PlannedLevel {
            collection: collection.name().to_owned(),
            primary_key: primary_key.name().to_owned(),
            primary_key_kind: column_kind(collection, primary_key)?,
            fields,
            relations,
            filter: BoundFilter::all_of(filters),
            sort,
            limit,
            offset: skipped_rows(query, limit)?,
            access: self.level_access(collection, depth)?,
        })
    }

    /// Level that only exposes related primary keys, every readable one.
    fn key_level(&self, collection: &CollectionSchema, depth: usize) -> AppResult<PlannedLevel> {
        let grant = self.grant(collection.name())?;
        let primary_key = collection.primary_key_field()?;
        let filter = match &grant.filter {
            Some(permission) => Some(self.bind_filter(
                collection,
                permission,
                depth,
                FilterSource::Permission,
            )?),
            None => None,
        };

        Ok(PlannedLevel {
            collection: collection.name().to_owned(),
            primary_key: primary_key.name().to_owned(),
            primary_key_kind: column_kind(collection, primary_key)?,
            fields: Vec::new(),
            relations: Vec::new(),
            filter,
            sort: Vec::new(),
            limit: self.config.effective_limit(Some(Limit::Unlimited)),
            offset: 0,
            access: LevelAccess::unrestricted(),
        })
    }

    fn level_access(&self, collection: &CollectionSchema, depth: usize) -> AppResult<LevelAccess> {
        let grant = self.grant(collection.name())?;
        let cases = grant
            .cases
            .iter()
            .map(|(filter, fields)| {
                Ok(AccessCase {
                    filter: self.bind_filter(collection, filter, depth, FilterSource::Permission)?,
                    fields: fields.clone(),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(LevelAccess {
            always: grant.always.clone(),
            cases,
        })
    }

    fn plan_child(
        &self,
        collection: &CollectionSchema,
        child: &QueryNode,
        depth: usize,
    ) -> AppResult<Option<PlannedOutput>> {
        match child {
            QueryNode::Field(node) => {
                self.plan_primitive(collection, &node.name, child.output_key())
            }
            QueryNode::Function(node) => self.plan_function(collection, node, child.output_key()),
            QueryNode::ManyToOne(node) => {
                self.plan_many_to_one(collection, node, child.output_key(), depth)
            }
            QueryNode::OneToMany(node) => {
                self.plan_one_to_many(collection, node, child.output_key(), depth)
            }
            QueryNode::AnyToOne(node) => {
                self.plan_any_to_one(collection, node, child.output_key(), depth)
            }
        }
    }

    fn plan_primitive(
        &self,
        collection: &CollectionSchema,
        name: &str,
        output_key: String,
    ) -> AppResult<Option<PlannedOutput>> {
        let Some(field) = self.visible_field(collection, name)? else {
            return Ok(None);
        };

        match self.schema.relation(collection.name(), name) {
            Some(relation) if relation.kind() == RelationKind::ManyToOne => {
                let related = self.related_collection(relation)?;
                if !self.is_admin() && !related.is_system() {
                    return Ok(Some(PlannedOutput::Relation(PlannedRelation {
                        output_key,
                        field: name.to_owned(),
                        output: RelationOutput::Keys,
                        strategy: RelationStrategy::Joined {
                            foreign_key: name.to_owned(),
                            level: Box::new(self.key_level(related, 0)?),
                        },
                    })));
                }
            }
            Some(relation) if relation.kind() == RelationKind::OneToMany => {
                let related = self.related_collection(relation)?;
                let (foreign_key, foreign_key_kind) = self.inverse_key(relation, related)?;
                return Ok(Some(PlannedOutput::Relation(PlannedRelation {
                    output_key,
                    field: name.to_owned(),
                    output: RelationOutput::Keys,
                    strategy: RelationStrategy::Deferred {
                        foreign_key,
                        foreign_key_kind,
                        level: Box::new(self.key_level(related, 0)?),
                    },
                })));
            }
            _ => {}
        }

        if !field.field_type().has_column() {
            return Ok(None);
        }

        Ok(Some(PlannedOutput::Field(PlannedField::Column {
            output_key,
            field: name.to_owned(),
            kind: column_kind(collection, field)?,
            concealed: field.is_concealed(),
        })))
    }

    fn plan_function(
        &self,
        collection: &CollectionSchema,
        node: &FunctionNode,
        output_key: String,
    ) -> AppResult<Option<PlannedOutput>> {
        let Some(field) = self.visible_field(collection, &node.field)? else {
            return Ok(None);
        };
        if !field.field_type().is_temporal() {
            return Err(AppError::InvalidQuery(format!(
                "function '{}' needs a date or datetime field, '{}' is {}",
                node.function.as_str(),
                node.field,
                field.field_type().as_str()
            )));
        }

        Ok(Some(PlannedOutput::Field(PlannedField::Function {
            output_key,
            function: node.function,
            field: node.field.clone(),
        })))
    }

    fn plan_many_to_one(
        &self,
        collection: &CollectionSchema,
        node: &NestedNode,
        output_key: String,
        depth: usize,
    ) -> AppResult<Option<PlannedOutput>> {
        if self.visible_field(collection, &node.field)?.is_none() {
            return Ok(None);
        }
        let relation = self.relation_of(collection, &node.field, RelationKind::ManyToOne)?;
        let depth = self.descend(depth)?;
        let related = self.related_collection(relation)?;
        self.require_readable(related.name())?;

        let level = self.level(related, &node.children, &node.query, depth, LevelShape::Single)?;
        Ok(Some(PlannedOutput::Relation(PlannedRelation {
            output_key,
            field: node.field.clone(),
            output: RelationOutput::Nested,
            strategy: RelationStrategy::Joined {
                foreign_key: node.field.clone(),
                level: Box::new(level),
            },
        })))
    }

    fn plan_one_to_many(
        &self,
        collection: &CollectionSchema,
        node: &NestedNode,
        output_key: String,
        depth: usize,
    ) -> AppResult<Option<PlannedOutput>> {
        if self.visible_field(collection, &node.field)?.is_none() {
            return Ok(None);
        }
        let relation = self.relation_of(collection, &node.field, RelationKind::OneToMany)?;
        let depth = self.descend(depth)?;
        let related = self.related_collection(relation)?;
        self.require_readable(related.name())?;
        let (foreign_key, foreign_key_kind) = self.inverse_key(relation, related)?;

        let level = self.level(related, &node.children, &node.query, depth, LevelShape::Listed)?;
        Ok(Some(PlannedOutput::Relation(PlannedRelation {
            output_key,
            field: node.field.clone(),
            output: RelationOutput::Nested,
            strategy: RelationStrategy::Deferred {
                foreign_key,
                foreign_key_kind,
                level: Box::new(level),
            },
        })))
    }

    fn plan_any_to_one(
        &self,
        collection: &CollectionSchema,
        node: &AnyToOneNode,
        output_key: String,
        depth: usize,
    ) -> AppResult<Option<PlannedOutput>> {
        if self.visible_field(collection, &node.field)?.is_none() {
            return Ok(None);
        }
        let relation = self.relation_of(collection, &node.field, RelationKind::AnyToOne)?;
        let collection_field = relation.collection_field().ok_or_else(|| {
            AppError::Internal(format!(
                "any-to-one '{}.{}' has no collection field",
                collection.name(),
                node.field
            ))
        })?;
        let depth = self.descend(depth)?;

        let mut branches = Vec::with_capacity(node.branches.len());
        for (target, branch) in &node.branches {
            if !relation.allowed_collections().iter().any(|allowed| allowed == target) {
                return Err(AppError::InvalidQuery(format!(
                    "collection '{target}' is not allowed on any-to-one '{}.{}'",
                    collection.name(),
                    node.field
                )));
            }
            let related = self.collection(target)?;
            self.require_readable(related.name())?;
            branches.push(PolymorphicBranch {
                collection: target.clone(),
                level: self.level(
                    related,
                    &branch.children,
                    &branch.query,
                    depth,
                    LevelShape::Single,
                )?,
            });
        }

        Ok(Some(PlannedOutput::Relation(PlannedRelation {
            output_key,
            field: node.field.clone(),
            output: RelationOutput::Nested,
            strategy: RelationStrategy::Polymorphic {
                foreign_key: node.field.clone(),
                collection_field: collection_field.to_owned(),
                branches,
            },
        })))
    }

    pub(super) fn inverse_key(
        &self,
        relation: &Relation,
        related: &CollectionSchema,
    ) -> AppResult<(String, ColumnKind)> {
        let foreign_key = relation
            .related_field()
            .and_then(|name| related.field(name))
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "one-to-many '{}.{}' has no foreign key",
                    relation.collection(),
                    relation.field()
                ))
            })?;
        Ok((
            foreign_key.name().to_owned(),
            column_kind(related, foreign_key)?,
        ))
    }
}

/// Rows skipped before a level's page: the offset plus whole pages of `limit`.
fn skipped_rows(query: &NodeQuery, limit: Option<u64>) -> AppResult<u64> {
    let page = match query.page {
        None => return Ok(query.offset),
        Some(0) => {
            return Err(AppError::InvalidQuery(
                "page numbers start at 1".to_owned(),
            ));
        }
        Some(page) => page,
    };
    let Some(limit) = limit else {
        return Ok(query.offset);
    };
    Ok(query
        .offset
        .saturating_add(limit.saturating_mul(page - 1)))
}
