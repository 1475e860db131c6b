use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tessera_application::{
    CompiledStatement, DriverRow, RelationalDriver, RelationalTransaction, SqlDialect, SqlValue,
    StatementExecutor,
};
use tessera_core::{AppError, AppResult};
use tokio::sync::Mutex;

use crate::driver_errors::execution_error;

mod decode;
mod dialect;

pub use dialect::SqliteDialect;

/// SQLite-backed relational driver.
#[derive(Clone)]
pub struct SqliteRelationalDriver {
    pool: SqlitePool,
}

impl SqliteRelationalDriver {
    /// Creates a driver with the provided connection pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatementExecutor for SqliteRelationalDriver {
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        let rows = bind_statement(statement)
            .fetch_all(&self.pool)
            .await
            .map_err(execution_error)?;
        decode_rows(&rows, statement)
    }
}

#[async_trait]
impl RelationalDriver for SqliteRelationalDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        &SqliteDialect
    }

    async fn begin_transaction(&self) -> AppResult<Box<dyn RelationalTransaction>> {
        let transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!("failed to begin transaction: {error}"))
        })?;
        Ok(Box::new(SqliteRelationalTransaction {
            transaction: Mutex::new(transaction),
        }))
    }
}

/// Read transaction; SQLite readers see one snapshot until commit.
struct SqliteRelationalTransaction {
    transaction: Mutex<Transaction<'static, Sqlite>>,
}

#[async_trait]
impl StatementExecutor for SqliteRelationalTransaction {
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        let mut transaction = self.transaction.lock().await;
        let rows = bind_statement(statement)
            .fetch_all(&mut **transaction)
            .await
            .map_err(execution_error)?;
        decode_rows(&rows, statement)
    }
}

#[async_trait]
impl RelationalTransaction for SqliteRelationalTransaction {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.transaction
            .into_inner()
            .commit()
            .await
            .map_err(|error| AppError::Internal(format!("failed to commit transaction: {error}")))
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.transaction
            .into_inner()
            .rollback()
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to roll back transaction: {error}"))
            })
    }
}

fn bind_statement(statement: &CompiledStatement) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), |query, param| match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(flag) => query.bind(*flag),
            SqlValue::Integer(integer) => query.bind(*integer),
            SqlValue::Float(float) => query.bind(*float),
            SqlValue::Text(text) => query.bind(text.as_str()),
            SqlValue::Json(document) => query.bind(document.to_string()),
        })
}

fn decode_rows(rows: &[SqliteRow], statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
    rows.iter()
        .map(|row| decode::decode_row(row, &statement.columns))
        .collect()
}

#[cfg(test)]
mod tests;
