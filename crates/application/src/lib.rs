//! Application services and ports of the permission-aware read path.

#![forbid(unsafe_code)]

mod cancellation;
mod driver_ports;
mod dynamic_variables;
mod engine_config;
mod field_pruner;
mod permission_catalog;
mod permission_injector;
mod permission_merger;
mod permission_ports;
pub mod query_plan;
mod query_engine;
mod query_runner;
mod result_renderer;
mod schema_ports;
mod sql_compiler;

#[cfg(test)]
mod test_support;

pub use cancellation::{CancellationHandle, CancellationSignal, cancellation_pair};
pub use driver_ports::{
    ColumnKind, CompiledStatement, DriverRow, OutputColumn, RelationalDriver,
    RelationalTransaction, SqlDialect, SqlValue, StatementExecutor,
};
pub use dynamic_variables::{DynamicVariableContext, DynamicVariableResolver};
pub use engine_config::EngineConfig;
pub use field_pruner::prune_records;
pub use permission_catalog::PermissionCatalog;
pub use permission_injector::PermissionInjector;
pub use permission_merger::{MergeStrategy, MergedPermission, merge_permissions};
pub use permission_ports::PermissionRepository;
pub use query_engine::{NestedResult, QueryEngine};
pub use query_runner::{CONCEALED_VALUE, FetchedRecord, QueryRunner, RelationValue};
pub use result_renderer::render_records;
pub use schema_ports::SchemaProvider;
pub use sql_compiler::{
    CompiledLevel, InlineLayout, InlineShape, PARENT_COLUMN, RecordLayout, SqlCompiler,
    ValueColumn,
};
