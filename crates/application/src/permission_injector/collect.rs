use super::*;

/// Returns every collection whose read permissions planning may consult:
/// the root, nested relation targets, targets of relation fields that may be
/// requested as primitives, and collections reached by caller filters.
pub(super) fn referenced_collections(schema: &SchemaOverview, tree: &QueryTree) -> BTreeSet<String> {
    let mut collections = BTreeSet::new();
    visit_level(
        schema,
        &tree.collection,
        &tree.children,
        &tree.query,
        &mut collections,
    );
    collections
}

fn visit_level(
    schema: &SchemaOverview,
    collection: &str,
    children: &[QueryNode],
    query: &NodeQuery,
    collections: &mut BTreeSet<String>,
) {
    insert_with_targets(schema, collection, collections);

    if let Some(filter) = &query.filter {
        visit_filter(schema, collection, filter, collections);
    }

    for child in children {
        match child {
            QueryNode::Field(_) | QueryNode::Function(_) => {}
            QueryNode::ManyToOne(node) | QueryNode::OneToMany(node) => {
                let related = schema
                    .relation(collection, &node.field)
                    .and_then(Relation::related_collection);
                if let Some(related) = related {
                    visit_level(schema, related, &node.children, &node.query, collections);
                }
            }
            QueryNode::AnyToOne(node) => {
                for (target, branch) in &node.branches {
                    visit_level(schema, target, &branch.children, &branch.query, collections);
                }
            }
        }
    }
}

fn visit_filter(
    schema: &SchemaOverview,
    collection: &str,
    filter: &Filter,
    collections: &mut BTreeSet<String>,
) {
    match filter {
        Filter::And(children) | Filter::Or(children) => {
            for child in children {
                visit_filter(schema, collection, child, collections);
            }
        }
        Filter::Never | Filter::Condition(_) => {}
        Filter::Related(related) => {
            let target = related.collection.as_deref().or_else(|| {
                schema
                    .relation(collection, &related.field)
                    .and_then(Relation::related_collection)
            });
            if let Some(target) = target {
                insert_with_targets(schema, target, collections);
                visit_filter(schema, target, &related.filter, collections);
            }
        }
    }
}

/// Inserts `collection` and the targets of its relations, whose keys may be
/// requested, sorted or filtered on.
fn insert_with_targets(schema: &SchemaOverview, collection: &str, collections: &mut BTreeSet<String>) {
    collections.insert(collection.to_owned());
    for relation in schema
        .relations()
        .iter()
        .filter(|relation| relation.collection() == collection)
    {
        if let Some(related) = relation.related_collection() {
            collections.insert(related.to_owned());
        }
    }
}
