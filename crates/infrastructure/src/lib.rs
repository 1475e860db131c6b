//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod driver_errors;
mod in_memory_permission_repository;
mod postgres_permission_repository;
mod postgres_relational_driver;
mod sqlite_relational_driver;
mod static_schema_provider;

#[cfg(test)]
mod query_engine_scenarios;

pub use in_memory_permission_repository::{InMemoryPermissionRepository, PolicyAttachment};
pub use postgres_permission_repository::PostgresPermissionRepository;
pub use postgres_relational_driver::{PostgresDialect, PostgresRelationalDriver};
pub use sqlite_relational_driver::{SqliteDialect, SqliteRelationalDriver};
pub use static_schema_provider::StaticSchemaProvider;
