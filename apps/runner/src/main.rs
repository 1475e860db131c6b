//! Tessera read request runner.

#![forbid(unsafe_code)]

mod runner_config;
mod runner_request;

use std::io::{self, Read};
use std::sync::Arc;

use runner_config::RunnerConfig;
use runner_request::{RunnerRequest, RunnerResponse};
use tessera_application::{PermissionCatalog, QueryEngine, cancellation_pair};
use tessera_core::AppError;
use tessera_infrastructure::{
    PostgresPermissionRepository, PostgresRelationalDriver, StaticSchemaProvider,
};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = RunnerConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(config.database_url.as_str())
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    if config.migrate_only {
        info!("database migrations applied successfully");
        return Ok(());
    }

    let engine = build_engine(pool, &config)?;
    let request = read_request()?;

    let (cancellation, signal) = cancellation_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling read request");
            cancellation.cancel();
        }
    });

    let result = engine
        .run_query_with_cancellation(&request.query, &request.accountability, &signal)
        .await?;
    let output = serde_json::to_string(&RunnerResponse { data: result.items })
        .map_err(|error| AppError::Internal(format!("failed to encode result: {error}")))?;
    println!("{output}");

    Ok(())
}

fn build_engine(pool: PgPool, config: &RunnerConfig) -> Result<QueryEngine, AppError> {
    let Some(schema_path) = config.schema_path.as_deref() else {
        return Err(AppError::Validation("SCHEMA_PATH is required".to_owned()));
    };
    let document = std::fs::read_to_string(schema_path).map_err(|error| {
        AppError::Validation(format!("failed to read schema snapshot '{schema_path}': {error}"))
    })?;
    let schema_provider = StaticSchemaProvider::from_json(document.as_str())?;

    let repository = Arc::new(PostgresPermissionRepository::new(pool.clone()));
    let catalog = PermissionCatalog::new(repository)
        .with_user_collection(config.engine.user_collection.as_str());
    let driver = PostgresRelationalDriver::new(pool);

    Ok(QueryEngine::new(
        Arc::new(catalog),
        Arc::new(schema_provider),
        Arc::new(driver),
        config.engine.clone(),
    ))
}

fn read_request() -> Result<RunnerRequest, AppError> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|error| AppError::Internal(format!("failed to read request: {error}")))?;
    RunnerRequest::parse(input.as_str())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}
