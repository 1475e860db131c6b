use tessera_application::{ColumnKind, SqlDialect};
use tessera_domain::FieldFunction;

/// SQLite rendering: `?N` placeholders and `strftime` date parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, position: usize, _kind: Option<ColumnKind>) -> String {
        format!("?{position}")
    }

    fn date_part(&self, function: FieldFunction, expression: &str) -> String {
        let format = match function {
            FieldFunction::Year => "%Y",
            FieldFunction::Month => "%m",
            FieldFunction::Week => "%W",
            FieldFunction::Day => "%d",
            FieldFunction::Weekday => "%w",
            FieldFunction::Hour => "%H",
            FieldFunction::Minute => "%M",
            FieldFunction::Second => "%S",
        };
        format!("CAST(strftime('{format}', {expression}) AS INTEGER)")
    }
}
