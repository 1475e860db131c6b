use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tessera_application::{
    ColumnKind, CompiledStatement, OutputColumn, RelationalDriver, SqlValue, StatementExecutor,
};
use tessera_core::AppError;

use super::SqliteRelationalDriver;

async fn test_pool() -> SqlitePool {
    let pool = match SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
    {
        Ok(pool) => pool,
        Err(error) => panic!("failed to open in-memory sqlite database: {error}"),
    };

    let setup = sqlx::query(
        r#"
        CREATE TABLE samples (
            id INTEGER PRIMARY KEY,
            label TEXT,
            score REAL,
            active BOOLEAN,
            payload TEXT
        )
        "#,
    )
    .execute(&pool)
    .await;
    assert!(setup.is_ok());

    let insert = sqlx::query(
        r#"
        INSERT INTO samples (id, label, score, active, payload)
        VALUES (1, 'first', 1.5, 1, '{"tags":["a"]}'), (2, NULL, NULL, 0, NULL)
        "#,
    )
    .execute(&pool)
    .await;
    assert!(insert.is_ok());

    pool
}

fn column(name: &str, kind: ColumnKind) -> OutputColumn {
    OutputColumn {
        name: name.to_owned(),
        kind,
    }
}

fn sample_statement(sql: &str, params: Vec<SqlValue>) -> CompiledStatement {
    CompiledStatement {
        sql: sql.to_owned(),
        params,
        columns: vec![
            column("c0", ColumnKind::Integer),
            column("c1", ColumnKind::Text),
            column("c2", ColumnKind::Float),
            column("c3", ColumnKind::Boolean),
            column("c4", ColumnKind::Json),
            column("c5", ColumnKind::Flag),
        ],
    }
}

const SELECT_SAMPLES: &str = r#"SELECT "id" AS "c0", "label" AS "c1", "score" AS "c2", "active" AS "c3", "payload" AS "c4", CASE WHEN "id" = ?2 THEN 1 ELSE 0 END AS "c5" FROM "samples" WHERE "id" >= ?1 ORDER BY "id" ASC"#;

#[tokio::test]
async fn rows_decode_by_declared_kind() {
    let driver = SqliteRelationalDriver::new(test_pool().await);
    let statement = sample_statement(SELECT_SAMPLES, vec![SqlValue::Integer(1), SqlValue::Integer(2)]);

    let rows = driver
        .execute(&statement)
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(rows.len(), 2);
    assert_eq!(
        serde_json::Value::Object(rows[0].clone()),
        json!({
            "c0": 1,
            "c1": "first",
            "c2": 1.5,
            "c3": true,
            "c4": {"tags": ["a"]},
            "c5": false
        })
    );
    assert_eq!(
        serde_json::Value::Object(rows[1].clone()),
        json!({
            "c0": 2,
            "c1": null,
            "c2": null,
            "c3": false,
            "c4": null,
            "c5": true
        })
    );
}

#[tokio::test]
async fn driver_errors_keep_the_database_message() {
    let driver = SqliteRelationalDriver::new(test_pool().await);
    let statement = CompiledStatement {
        sql: r#"SELECT "id" AS "c0" FROM "missing""#.to_owned(),
        params: Vec::new(),
        columns: vec![column("c0", ColumnKind::Integer)],
    };

    let result = driver.execute(&statement).await;

    let Err(AppError::Execution { message, .. }) = result else {
        panic!("expected an execution error");
    };
    assert!(message.contains("no such table"));
}

#[tokio::test]
async fn transactions_read_through_one_connection() {
    let driver = SqliteRelationalDriver::new(test_pool().await);
    let statement = sample_statement(SELECT_SAMPLES, vec![SqlValue::Integer(2), SqlValue::Integer(2)]);

    let transaction = driver
        .begin_transaction()
        .await
        .unwrap_or_else(|_| unreachable!());
    let rows = transaction
        .execute(&statement)
        .await
        .unwrap_or_else(|_| unreachable!());
    assert_eq!(rows.len(), 1);
    assert!(transaction.commit().await.is_ok());

    let transaction = driver
        .begin_transaction()
        .await
        .unwrap_or_else(|_| unreachable!());
    assert!(transaction.rollback().await.is_ok());
    assert!(driver.execute(&statement).await.is_ok());
}
