use std::collections::{BTreeMap, HashMap, HashSet};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Map, Value};
use tessera_core::{AppError, AppResult};
use tracing::debug;

use crate::query_plan::{PlannedLevel, RelationStrategy};
use crate::sql_compiler::{InlineShape, PARENT_COLUMN, RecordLayout, SqlCompiler};
use crate::{
    CancellationSignal, ColumnKind, CompiledStatement, DriverRow, EngineConfig, SqlDialect,
    StatementExecutor,
};

/// Replacement for non-null values of concealed fields.
pub const CONCEALED_VALUE: &str = "**********";

/// Row of one level as read from the database, before pruning.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    /// Primary key.
    pub key: Value,
    /// Output fields by output key.
    pub values: Map<String, Value>,
    /// Access case flags, in case order.
    pub flags: Vec<bool>,
    /// Related records by output key.
    pub relations: BTreeMap<String, RelationValue>,
}

/// Related records attached to a fetched record.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationValue {
    /// Many-to-one target, `None` when absent or not readable.
    One(Option<Box<FetchedRecord>>),
    /// One-to-many rows.
    Many(Vec<FetchedRecord>),
    /// Any-to-one target in a requested collection.
    Branch {
        /// Target collection.
        collection: String,
        /// Target row, `None` when absent or not readable.
        record: Option<Box<FetchedRecord>>,
    },
    /// Any-to-one key pointing into a collection that was not requested.
    Raw(Value),
}

/// Executes a planned tree: one statement for the root and its joined
/// relations, then one statement per deferred relation and batch of parents.
pub struct QueryRunner<'a> {
    executor: &'a dyn StatementExecutor,
    compiler: SqlCompiler<'a>,
    config: &'a EngineConfig,
    signal: &'a CancellationSignal,
}

impl<'a> QueryRunner<'a> {
    /// Creates a runner bound to one executor.
    #[must_use]
    pub fn new(
        executor: &'a dyn StatementExecutor,
        dialect: &'a dyn SqlDialect,
        config: &'a EngineConfig,
        signal: &'a CancellationSignal,
    ) -> Self {
        Self {
            executor,
            compiler: SqlCompiler::new(dialect),
            config,
            signal,
        }
    }

    /// Fetches the root level and every relation below it.
    pub async fn run(&self, level: &PlannedLevel) -> AppResult<Vec<FetchedRecord>> {
        self.ensure_active()?;
        let compiled = self.compiler.compile_root(level)?;
        let rows = self.execute(&compiled.statement).await?;

        let mut records = rows
            .iter()
            .filter_map(|row| extract_record(row, &compiled.layout))
            .collect::<Vec<_>>();
        self.attach_deferred(level, records.iter_mut().collect())
            .await?;
        Ok(records)
    }

    /// Attaches deferred relations of `level` to `records` and descends
    /// into joined relations.
    ///
    /// Deferred siblings and the levels below joined relations are fetched
    /// concurrently. Every fetch is awaited before the first error is
    /// returned.
    fn attach_deferred<'f, 'r>(
        &'f self,
        level: &'f PlannedLevel,
        mut records: Vec<&'r mut FetchedRecord>,
    ) -> BoxFuture<'r, AppResult<()>>
    where
        'f: 'r,
    {
        async move {
            if records.is_empty() {
                return Ok(());
            }

            let mut seen = HashSet::new();
            let keys = records
                .iter()
                .map(|record| &record.key)
                .filter(|key| seen.insert(key_string(key)))
                .cloned()
                .collect::<Vec<_>>();

            let mut nested = nested_levels(level);
            for record in &mut records {
                for (output_key, value) in &mut record.relations {
                    let (branch, related) = match value {
                        RelationValue::One(Some(related)) => (None, related),
                        RelationValue::Branch {
                            collection,
                            record: Some(related),
                        } => (Some(collection.as_str()), related),
                        _ => continue,
                    };
                    if let Some(target) = nested.iter_mut().find(|target| {
                        target.output_key == output_key.as_str() && target.branch == branch
                    }) {
                        target.records.push(&mut **related);
                    }
                }
            }

            let mut work: Vec<
                BoxFuture<'_, AppResult<Option<(&str, HashMap<String, Vec<FetchedRecord>>)>>>,
            > = Vec::new();
            for relation in &level.relations {
                if let RelationStrategy::Deferred {
                    foreign_key,
                    foreign_key_kind,
                    level: child,
                } = &relation.strategy
                {
                    let output_key = relation.output_key.as_str();
                    work.push(
                        self.fetch_children(child, foreign_key, *foreign_key_kind, &keys)
                            .map(move |fetched| fetched.map(|grouped| Some((output_key, grouped))))
                            .boxed(),
                    );
                }
            }
            for target in nested {
                work.push(
                    self.attach_deferred(target.level, target.records)
                        .map(|attached| attached.map(|()| None))
                        .boxed(),
                );
            }

            let mut fetched = Vec::new();
            for result in join_all(work).await {
                if let Some(children) = result? {
                    fetched.push(children);
                }
            }

            for (output_key, grouped) in fetched {
                for record in &mut records {
                    let children = grouped
                        .get(&key_string(&record.key))
                        .cloned()
                        .unwrap_or_default();
                    record
                        .relations
                        .insert(output_key.to_owned(), RelationValue::Many(children));
                }
            }

            Ok(())
        }
        .boxed()
    }

    /// Fetches one deferred level for `parent_keys`, grouped by parent key.
    async fn fetch_children(
        &self,
        level: &PlannedLevel,
        foreign_key: &str,
        foreign_key_kind: ColumnKind,
        parent_keys: &[Value],
    ) -> AppResult<HashMap<String, Vec<FetchedRecord>>> {
        let mut fetched = Vec::new();
        for batch in parent_keys.chunks(self.config.relational_batch_size.max(1)) {
            self.ensure_active()?;
            let compiled =
                self.compiler
                    .compile_children(level, foreign_key, foreign_key_kind, batch)?;
            let rows = self.execute(&compiled.statement).await?;
            for row in &rows {
                let Some(record) = extract_record(row, &compiled.layout) else {
                    continue;
                };
                let parent = row.get(PARENT_COLUMN).map(key_string).unwrap_or_default();
                fetched.push((parent, record));
            }
        }

        self.attach_deferred(
            level,
            fetched.iter_mut().map(|(_, record)| record).collect(),
        )
        .await?;

        let mut grouped: HashMap<String, Vec<FetchedRecord>> = HashMap::new();
        for (parent, record) in fetched {
            grouped.entry(parent).or_default().push(record);
        }
        Ok(grouped)
    }

    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        debug!(
            sql = %statement.sql,
            params = statement.params.len(),
            "executing statement"
        );
        self.executor.execute(statement).await
    }

    fn ensure_active(&self) -> AppResult<()> {
        if self.signal.is_cancelled() {
            return Err(AppError::Cancelled(
                "request was cancelled before all relations were fetched".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Level below a joined relation or polymorphic branch, with the parent
/// records' related rows it applies to.
struct NestedLevel<'l, 'r> {
    output_key: &'l str,
    branch: Option<&'l str>,
    level: &'l PlannedLevel,
    records: Vec<&'r mut FetchedRecord>,
}

fn nested_levels<'l, 'r>(level: &'l PlannedLevel) -> Vec<NestedLevel<'l, 'r>> {
    let mut nested = Vec::new();
    for relation in &level.relations {
        match &relation.strategy {
            RelationStrategy::Joined { level: child, .. } => nested.push(NestedLevel {
                output_key: &relation.output_key,
                branch: None,
                level: child,
                records: Vec::new(),
            }),
            RelationStrategy::Polymorphic { branches, .. } => {
                nested.extend(branches.iter().map(|branch| NestedLevel {
                    output_key: &relation.output_key,
                    branch: Some(branch.collection.as_str()),
                    level: &branch.level,
                    records: Vec::new(),
                }));
            }
            RelationStrategy::Deferred { .. } => {}
        }
    }
    nested
}

/// Rebuilds one record from a row; a null primary key means no record.
fn extract_record(row: &DriverRow, layout: &RecordLayout) -> Option<FetchedRecord> {
    let key = row.get(&layout.key).cloned().unwrap_or(Value::Null);
    if key.is_null() {
        return None;
    }

    let mut values = Map::new();
    for column in &layout.values {
        let value = row.get(&column.column).cloned().unwrap_or(Value::Null);
        let value = if column.concealed && !value.is_null() {
            Value::String(CONCEALED_VALUE.to_owned())
        } else {
            value
        };
        values.insert(column.output_key.clone(), value);
    }

    let flags = layout
        .flags
        .iter()
        .map(|flag| row.get(flag).and_then(Value::as_bool).unwrap_or(false))
        .collect();

    let mut relations = BTreeMap::new();
    for inline in &layout.inline {
        let value = match &inline.shape {
            InlineShape::Joined(related) => {
                RelationValue::One(extract_record(row, related).map(Box::new))
            }
            InlineShape::Polymorphic {
                key,
                collection,
                branches,
            } => {
                let target = row.get(collection).and_then(Value::as_str);
                match branches.iter().find(|(name, _)| Some(name.as_str()) == target) {
                    Some((name, related)) => RelationValue::Branch {
                        collection: name.clone(),
                        record: extract_record(row, related).map(Box::new),
                    },
                    None => RelationValue::Raw(row.get(key).cloned().unwrap_or(Value::Null)),
                }
            }
        };
        relations.insert(inline.output_key.clone(), value);
    }

    Some(FetchedRecord {
        key,
        values,
        flags,
        relations,
    })
}

/// Canonical text of a key, shared by parent keys and foreign keys.
fn key_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests;
