use std::sync::Arc;

use serde_json::{Value, json};
use tessera_core::{AppError, AppResult};
use tessera_domain::FilterOperator;

use super::{CONCEALED_VALUE, FetchedRecord, QueryRunner, RelationValue};
use crate::query_plan::{
    BoundFilter, BoundValue, PlannedField, PlannedLevel, PlannedRelation, PolymorphicBranch,
    RelationOutput, RelationStrategy,
};
use crate::test_support::{NumberedDialect, ScriptedDriver, planned_level};
use crate::{
    CancellationHandle, CancellationSignal, ColumnKind, CompiledStatement, EngineConfig,
    SqlValue, cancellation_pair,
};

fn is_children(statement: &CompiledStatement) -> bool {
    statement.sql.contains("ROW_NUMBER()")
}

/// Integer parent keys bound ahead of the window bounds.
fn parent_keys(statement: &CompiledStatement) -> Vec<i64> {
    let keys = &statement.params[..statement.params.len() - 2];
    keys.iter()
        .filter_map(|param| match param {
            SqlValue::Integer(key) => Some(*key),
            _ => None,
        })
        .collect()
}

async fn run(
    executor: &ScriptedDriver,
    level: &PlannedLevel,
    config: &EngineConfig,
    signal: &CancellationSignal,
) -> AppResult<Vec<FetchedRecord>> {
    QueryRunner::new(executor, &NumberedDialect, config, signal)
        .run(level)
        .await
}

fn deferred(output_key: &str, level: PlannedLevel) -> PlannedRelation {
    PlannedRelation {
        output_key: output_key.to_owned(),
        field: "articles".to_owned(),
        output: RelationOutput::Nested,
        strategy: RelationStrategy::Deferred {
            foreign_key: "author".to_owned(),
            foreign_key_kind: ColumnKind::Integer,
            level: Box::new(level),
        },
    }
}

fn authors_with_articles() -> PlannedLevel {
    let mut authors = planned_level("authors", &[("name", ColumnKind::Text)]);
    authors.relations.push(deferred(
        "articles",
        planned_level("articles", &[("title", ColumnKind::Text)]),
    ));
    authors
}

const ARTICLES: [(i64, &str, i64); 3] = [(100, "First", 1), (101, "Second", 1), (102, "Third", 3)];

fn article_rows(statement: &CompiledStatement) -> Vec<Vec<Value>> {
    let keys = parent_keys(statement);
    ARTICLES
        .iter()
        .filter(|(_, _, author)| keys.contains(author))
        .map(|(id, title, author)| vec![json!(id), json!(title), json!(author)])
        .collect()
}

fn author_rows() -> Vec<Vec<Value>> {
    vec![
        vec![json!(1), json!("Ada")],
        vec![json!(2), json!("Grace")],
        vec![json!(3), json!("Edsger")],
    ]
}

fn many(record: &FetchedRecord, output_key: &str) -> Vec<Value> {
    match record.relations.get(output_key) {
        Some(RelationValue::Many(children)) => {
            children.iter().map(|child| child.key.clone()).collect()
        }
        other => panic!("expected a one-to-many value, got {other:?}"),
    }
}

#[tokio::test]
async fn joined_rows_become_nested_records() {
    let mut root = planned_level("articles", &[("title", ColumnKind::Text)]);
    root.fields.push(PlannedField::Column {
        output_key: "token".to_owned(),
        field: "token".to_owned(),
        kind: ColumnKind::Text,
        concealed: true,
    });
    root.relations.push(PlannedRelation {
        output_key: "author".to_owned(),
        field: "author".to_owned(),
        output: RelationOutput::Nested,
        strategy: RelationStrategy::Joined {
            foreign_key: "author".to_owned(),
            level: Box::new(planned_level("authors", &[("name", ColumnKind::Text)])),
        },
    });
    let executor = ScriptedDriver::new(|_| {
        Ok(vec![
            vec![json!(1), json!("First"), json!("s3cret"), json!(10), json!("Ada")],
            vec![json!(2), json!("Second"), Value::Null, Value::Null, Value::Null],
        ])
    });

    let records = run(
        &executor,
        &root,
        &EngineConfig::default(),
        &CancellationSignal::never(),
    )
    .await
    .unwrap_or_else(|_| unreachable!());

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].values.get("token"), Some(&json!(CONCEALED_VALUE)));
    assert_eq!(records[1].values.get("token"), Some(&Value::Null));
    let Some(RelationValue::One(Some(author))) = records[0].relations.get("author") else {
        panic!("expected a joined author");
    };
    assert_eq!(author.key, json!(10));
    assert_eq!(author.values.get("name"), Some(&json!("Ada")));
    assert_eq!(
        records[1].relations.get("author"),
        Some(&RelationValue::One(None))
    );
}

#[tokio::test]
async fn deferred_children_are_grouped_and_batched() {
    let executor = ScriptedDriver::new(|statement| {
        if is_children(statement) {
            Ok(article_rows(statement))
        } else {
            Ok(author_rows())
        }
    });
    let config = EngineConfig {
        relational_batch_size: 2,
        ..EngineConfig::default()
    };

    let records = run(
        &executor,
        &authors_with_articles(),
        &config,
        &CancellationSignal::never(),
    )
    .await
    .unwrap_or_else(|_| unreachable!());

    assert_eq!(many(&records[0], "articles"), vec![json!(100), json!(101)]);
    assert!(many(&records[1], "articles").is_empty());
    assert_eq!(many(&records[2], "articles"), vec![json!(102)]);
    assert_eq!(executor.executed().await.len(), 3);
}

#[tokio::test]
async fn statement_count_grows_with_levels_not_rows() {
    let mut root = authors_with_articles();
    let RelationStrategy::Deferred { level, .. } = &mut root.relations[0].strategy else {
        unreachable!();
    };
    level.relations.push(PlannedRelation {
        output_key: "author".to_owned(),
        field: "author".to_owned(),
        output: RelationOutput::Nested,
        strategy: RelationStrategy::Joined {
            foreign_key: "author".to_owned(),
            level: Box::new(planned_level("authors", &[("name", ColumnKind::Text)])),
        },
    });
    let executor = ScriptedDriver::new(|statement| {
        if is_children(statement) {
            Ok(article_rows(statement)
                .into_iter()
                .map(|mut row| {
                    let parent = row.pop().unwrap_or(Value::Null);
                    row.extend([parent.clone(), json!("Ada"), parent]);
                    row
                })
                .collect())
        } else {
            Ok(author_rows())
        }
    });

    let records = run(
        &executor,
        &root,
        &EngineConfig::default(),
        &CancellationSignal::never(),
    )
    .await
    .unwrap_or_else(|_| unreachable!());

    assert_eq!(records.len(), 3);
    assert_eq!(executor.executed().await.len(), 2);
}

#[tokio::test]
async fn cancelled_requests_stop_before_the_next_statement() {
    let executor = ScriptedDriver::new(|_| Ok(author_rows()));
    let (handle, signal) = cancellation_pair();
    handle.cancel();

    let result = run(
        &executor,
        &authors_with_articles(),
        &EngineConfig::default(),
        &signal,
    )
    .await;
    assert!(matches!(result, Err(AppError::Cancelled(_))));
    assert!(executor.executed().await.is_empty());
}

#[tokio::test]
async fn cancellation_after_the_root_skips_deferred_levels() {
    let (handle, signal) = cancellation_pair();
    let handle: Arc<CancellationHandle> = Arc::new(handle);
    let cancel = Arc::clone(&handle);
    let executor = ScriptedDriver::new(move |statement| {
        if is_children(statement) {
            return Ok(article_rows(statement));
        }
        cancel.cancel();
        Ok(author_rows())
    });

    let result = run(
        &executor,
        &authors_with_articles(),
        &EngineConfig::default(),
        &signal,
    )
    .await;
    assert!(matches!(result, Err(AppError::Cancelled(_))));
    assert_eq!(executor.executed().await.len(), 1);
}

#[tokio::test]
async fn sibling_fetches_finish_before_the_error_surfaces() {
    let mut root = authors_with_articles();
    let mut drafts = planned_level("articles", &[("title", ColumnKind::Text)]);
    drafts.filter = Some(BoundFilter::Compare {
        field: "status".to_owned(),
        kind: ColumnKind::Text,
        operator: FilterOperator::Eq,
        value: BoundValue::Literal(json!("draft")),
    });
    root.relations.insert(0, deferred("drafts", drafts));
    let executor = ScriptedDriver::new(|statement| {
        if !is_children(statement) {
            return Ok(author_rows());
        }
        if statement.sql.contains("\"status\"") {
            return Err(AppError::Execution {
                code: Some("57014".to_owned()),
                message: "canceling statement due to statement timeout".to_owned(),
            });
        }
        Ok(article_rows(statement))
    });

    let result = run(
        &executor,
        &root,
        &EngineConfig::default(),
        &CancellationSignal::never(),
    )
    .await;
    assert!(matches!(
        result,
        Err(AppError::Execution { code: Some(ref code), .. }) if code == "57014"
    ));
    assert_eq!(executor.executed().await.len(), 3);
}

#[tokio::test]
async fn any_to_one_targets_outside_requested_branches_stay_raw() {
    let mut root = planned_level("notes", &[]);
    root.relations.push(PlannedRelation {
        output_key: "item".to_owned(),
        field: "item".to_owned(),
        output: RelationOutput::Nested,
        strategy: RelationStrategy::Polymorphic {
            foreign_key: "item".to_owned(),
            collection_field: "collection".to_owned(),
            branches: vec![PolymorphicBranch {
                collection: "articles".to_owned(),
                level: planned_level("articles", &[("title", ColumnKind::Text)]),
            }],
        },
    });
    let executor = ScriptedDriver::new(|_| {
        Ok(vec![
            vec![json!(1), json!("100"), json!("articles"), json!(100), json!("First")],
            vec![json!(2), json!("7"), json!("authors"), Value::Null, Value::Null],
        ])
    });

    let records = run(
        &executor,
        &root,
        &EngineConfig::default(),
        &CancellationSignal::never(),
    )
    .await
    .unwrap_or_else(|_| unreachable!());

    let Some(RelationValue::Branch {
        collection,
        record: Some(article),
    }) = records[0].relations.get("item")
    else {
        panic!("expected an article branch");
    };
    assert_eq!(collection, "articles");
    assert_eq!(article.values.get("title"), Some(&json!("First")));
    assert_eq!(
        records[1].relations.get("item"),
        Some(&RelationValue::Raw(json!("7")))
    );
}

#[tokio::test]
async fn levels_below_joined_relations_run_alongside_deferred_siblings() {
    let mut root = planned_level("articles", &[("title", ColumnKind::Text)]);
    root.relations.push(PlannedRelation {
        output_key: "author".to_owned(),
        field: "author".to_owned(),
        output: RelationOutput::Nested,
        strategy: RelationStrategy::Joined {
            foreign_key: "author".to_owned(),
            level: Box::new(authors_with_articles()),
        },
    });
    let mut drafts = planned_level("articles", &[("title", ColumnKind::Text)]);
    drafts.filter = Some(BoundFilter::Compare {
        field: "status".to_owned(),
        kind: ColumnKind::Text,
        operator: FilterOperator::Eq,
        value: BoundValue::Literal(json!("draft")),
    });
    root.relations.push(deferred("drafts", drafts));
    let executor = ScriptedDriver::new(|statement| {
        if !is_children(statement) {
            return Ok(vec![vec![json!(100), json!("First"), json!(1), json!("Ada")]]);
        }
        if statement.sql.contains("\"status\"") {
            return Err(AppError::Execution {
                code: None,
                message: "relation is locked".to_owned(),
            });
        }
        Ok(article_rows(statement))
    });

    let result = run(
        &executor,
        &root,
        &EngineConfig::default(),
        &CancellationSignal::never(),
    )
    .await;

    assert!(matches!(result, Err(AppError::Execution { .. })));
    let executed = executor.executed().await;
    assert_eq!(executed.len(), 3);
    assert!(
        executed
            .iter()
            .any(|sql| sql.contains("ROW_NUMBER()") && !sql.contains("\"status\""))
    );
}
