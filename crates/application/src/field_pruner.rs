use tracing::debug;

use crate::query_plan::{PlannedLevel, RelationStrategy};
use crate::query_runner::{FetchedRecord, RelationValue};

/// Deletes fields a row's satisfied rules do not grant, across the whole tree.
///
/// Levels without access cases are left untouched; their allow-list was
/// already applied when the fields were planned.
pub fn prune_records(level: &PlannedLevel, records: &mut [FetchedRecord]) {
    for record in records {
        prune_record(level, record);
    }
}

fn prune_record(level: &PlannedLevel, record: &mut FetchedRecord) {
    if !level.access.cases.is_empty() {
        let visible = level.access.visible_fields(&record.flags);
        let before = record.values.len() + record.relations.len();
        let granted = |output_key: &str| {
            level
                .source_field(output_key)
                .is_some_and(|field| visible.allows(field))
        };
        record.values.retain(|output_key, _| granted(output_key));
        record.relations.retain(|output_key, _| granted(output_key));

        let removed = before - record.values.len() - record.relations.len();
        if removed > 0 {
            debug!(
                collection = %level.collection,
                removed,
                "pruned fields outside the row's satisfied rules"
            );
        }
    }

    for relation in &level.relations {
        let Some(value) = record.relations.get_mut(&relation.output_key) else {
            continue;
        };
        match (&relation.strategy, value) {
            (RelationStrategy::Joined { level: child, .. }, RelationValue::One(Some(related))) => {
                prune_record(child, related);
            }
            (RelationStrategy::Deferred { level: child, .. }, RelationValue::Many(children)) => {
                prune_records(child, children);
            }
            (
                RelationStrategy::Polymorphic { branches, .. },
                RelationValue::Branch {
                    collection,
                    record: Some(related),
                },
            ) => {
                if let Some(branch) = branches
                    .iter()
                    .find(|branch| branch.collection == *collection)
                {
                    prune_record(&branch.level, related);
                }
            }
            _ => {}
        }
    }
}
