use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tessera_core::AppResult;
use tessera_domain::{FieldFunction, FieldType};

/// Bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Float(f64),
    /// Text.
    Text(String),
    /// JSON document.
    Json(Value),
}

/// Decoding hint for an output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Character data.
    Text,
    /// Integer.
    Integer,
    /// Float.
    Float,
    /// Boolean.
    Boolean,
    /// UUID rendered as text.
    Uuid,
    /// Date rendered as `YYYY-MM-DD`.
    Date,
    /// Timestamp rendered as RFC 3339.
    DateTime,
    /// JSON document.
    Json,
    /// Rule match flag (`1`/`0`) decoded as boolean.
    Flag,
}

impl ColumnKind {
    /// Maps a schema type to its column kind; alias fields have none.
    #[must_use]
    pub fn for_field_type(field_type: FieldType) -> Option<Self> {
        match field_type {
            FieldType::String | FieldType::Text => Some(Self::Text),
            FieldType::Integer | FieldType::BigInteger => Some(Self::Integer),
            FieldType::Float => Some(Self::Float),
            FieldType::Boolean => Some(Self::Boolean),
            FieldType::Uuid => Some(Self::Uuid),
            FieldType::Date => Some(Self::Date),
            FieldType::DateTime => Some(Self::DateTime),
            FieldType::Json => Some(Self::Json),
            FieldType::Alias => None,
        }
    }
}

/// Named output column of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    /// Column alias in the result set.
    pub name: String,
    /// Decoding hint.
    pub kind: ColumnKind,
}

/// Parameterized statement handed to the relational driver.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    /// SQL text with dialect placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlValue>,
    /// Columns the driver must decode.
    pub columns: Vec<OutputColumn>,
}

/// Decoded row keyed by output column alias.
pub type DriverRow = Map<String, Value>;

/// Dialect-specific SQL rendering.
pub trait SqlDialect: Send + Sync + Debug {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Quotes an identifier.
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Renders the placeholder for the 1-based parameter `position`.
    fn placeholder(&self, position: usize, kind: Option<ColumnKind>) -> String;

    /// Wraps a selected column so the driver can decode it as `kind`.
    fn select_column(&self, expression: &str, _kind: ColumnKind) -> String {
        expression.to_owned()
    }

    /// Renders a date-part extraction as an integer expression.
    fn date_part(&self, function: FieldFunction, expression: &str) -> String;

    /// Renders a case-insensitive `LIKE` against an already escaped pattern.
    fn case_insensitive_like(&self, expression: &str, placeholder: &str) -> String {
        format!("LOWER({expression}) LIKE LOWER({placeholder}) ESCAPE '\\'")
    }

    /// Renders a cast to text.
    fn cast_to_text(&self, expression: &str) -> String {
        format!("CAST({expression} AS TEXT)")
    }
}

/// Executes compiled statements.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Runs a statement and returns decoded rows.
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>>;
}

/// Transaction scope of a relational driver.
#[async_trait]
pub trait RelationalTransaction: StatementExecutor {
    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> AppResult<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

/// Relational database access used by the query engine.
#[async_trait]
pub trait RelationalDriver: StatementExecutor {
    /// Returns the dialect chosen when the driver was constructed.
    fn dialect(&self) -> &dyn SqlDialect;

    /// Opens a transaction for snapshot-consistent reads.
    async fn begin_transaction(&self) -> AppResult<Box<dyn RelationalTransaction>>;
}
