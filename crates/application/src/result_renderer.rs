use serde_json::{Map, Value};
use tessera_core::{AppError, AppResult};

use crate::query_plan::{PlannedLevel, PlannedRelation, RelationOutput, RelationStrategy};
use crate::query_runner::{FetchedRecord, RelationValue};

/// Turns fetched records into output rows.
///
/// Only keys that survived pruning are emitted: scalar fields first, then
/// relations, each in request order. Relations requested as plain fields
/// render as keys, nested requests render as objects. A fetched value that
/// does not fit its planned relation is an internal error.
pub fn render_records(level: &PlannedLevel, records: Vec<FetchedRecord>) -> AppResult<Vec<Value>> {
    records
        .into_iter()
        .map(|record| render_record(level, record).map(Value::Object))
        .collect()
}

fn render_record(level: &PlannedLevel, mut record: FetchedRecord) -> AppResult<Map<String, Value>> {
    let mut row = record.values;
    for relation in &level.relations {
        let Some(value) = record.relations.remove(&relation.output_key) else {
            continue;
        };
        row.insert(relation.output_key.clone(), render_relation(relation, value)?);
    }
    Ok(row)
}

fn render_relation(relation: &PlannedRelation, value: RelationValue) -> AppResult<Value> {
    let rendered = match (relation.output, value, &relation.strategy) {
        (_, RelationValue::Raw(raw), RelationStrategy::Polymorphic { .. }) => raw,
        (RelationOutput::Keys, RelationValue::One(record), RelationStrategy::Joined { .. })
        | (
            RelationOutput::Keys,
            RelationValue::Branch { record, .. },
            RelationStrategy::Polymorphic { .. },
        ) => record.map_or(Value::Null, |record| record.key),
        (RelationOutput::Keys, RelationValue::Many(records), RelationStrategy::Deferred { .. }) => {
            Value::Array(records.into_iter().map(|record| record.key).collect())
        }
        (RelationOutput::Nested, RelationValue::One(record), RelationStrategy::Joined { level, .. }) => {
            nested(level, record)?
        }
        (
            RelationOutput::Nested,
            RelationValue::Branch { collection, record },
            RelationStrategy::Polymorphic { branches, .. },
        ) => {
            let branch = branches
                .iter()
                .find(|branch| branch.collection == collection)
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "relation '{}' fetched a row of unrequested collection '{collection}'",
                        relation.output_key
                    ))
                })?;
            nested(&branch.level, record)?
        }
        (
            RelationOutput::Nested,
            RelationValue::Many(records),
            RelationStrategy::Deferred { level, .. },
        ) => Value::Array(render_records(level, records)?),
        _ => {
            return Err(AppError::Internal(format!(
                "fetched value of relation '{}' does not match its plan",
                relation.output_key
            )));
        }
    };
    Ok(rendered)
}

fn nested(level: &PlannedLevel, record: Option<Box<FetchedRecord>>) -> AppResult<Value> {
    match record {
        Some(record) => Ok(Value::Object(render_record(level, *record)?)),
        None => Ok(Value::Null),
    }
}
