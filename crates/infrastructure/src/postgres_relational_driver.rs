use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use tessera_application::{
    CompiledStatement, DriverRow, RelationalDriver, RelationalTransaction, SqlDialect, SqlValue,
    StatementExecutor,
};
use tessera_core::{AppError, AppResult};
use tokio::sync::Mutex;
use tracing::debug;

use crate::driver_errors::execution_error;

mod decode;
mod dialect;

pub use dialect::PostgresDialect;

/// PostgreSQL-backed relational driver.
#[derive(Clone)]
pub struct PostgresRelationalDriver {
    pool: PgPool,
}

impl PostgresRelationalDriver {
    /// Creates a driver with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatementExecutor for PostgresRelationalDriver {
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        let rows = bind_statement(statement)
            .fetch_all(&self.pool)
            .await
            .map_err(execution_error)?;
        decode_rows(&rows, statement)
    }
}

#[async_trait]
impl RelationalDriver for PostgresRelationalDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        &PostgresDialect
    }

    /// Opens a read-only repeatable read transaction so every statement of
    /// a request sees the same snapshot.
    async fn begin_transaction(&self) -> AppResult<Box<dyn RelationalTransaction>> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!("failed to begin transaction: {error}"))
        })?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *transaction)
            .await
            .map_err(execution_error)?;
        debug!("opened snapshot transaction");

        Ok(Box::new(PostgresRelationalTransaction {
            transaction: Mutex::new(transaction),
        }))
    }
}

struct PostgresRelationalTransaction {
    transaction: Mutex<Transaction<'static, Postgres>>,
}

#[async_trait]
impl StatementExecutor for PostgresRelationalTransaction {
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
impl RelationalTransaction for PostgresRelationalTransaction {
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

fn bind_statement(statement: &CompiledStatement) -> Query<'_, Postgres, PgArguments> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), |query, param| match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(flag) => query.bind(*flag),
            SqlValue::Integer(integer) => query.bind(*integer),
            SqlValue::Float(float) => query.bind(*float),
            SqlValue::Text(text) => query.bind(text.as_str()),
            SqlValue::Json(document) => query.bind(document.clone()),
        })
}

fn decode_rows(rows: &[PgRow], statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
    rows.iter()
        .map(|row| decode::decode_row(row, &statement.columns))
        .collect()
}
