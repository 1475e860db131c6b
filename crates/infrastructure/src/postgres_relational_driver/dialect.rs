use tessera_application::{ColumnKind, SqlDialect};
use tessera_domain::FieldFunction;

/// PostgreSQL rendering: typed `$N` placeholders, `EXTRACT` date parts and
/// `ILIKE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, position: usize, kind: Option<ColumnKind>) -> String {
        match kind {
            Some(ColumnKind::Uuid) => format!("${position}::uuid"),
            Some(ColumnKind::Date) => format!("${position}::date"),
            Some(ColumnKind::DateTime) => format!("${position}::timestamptz"),
            Some(ColumnKind::Json) => format!("${position}::jsonb"),
            _ => format!("${position}"),
        }
    }

    /// Normalizes selected columns to the types the decoder reads.
    fn select_column(&self, expression: &str, kind: ColumnKind) -> String {
        match kind {
            ColumnKind::Integer | ColumnKind::Flag => format!("CAST({expression} AS BIGINT)"),
            ColumnKind::Float => format!("CAST({expression} AS DOUBLE PRECISION)"),
            ColumnKind::Text => format!("CAST({expression} AS TEXT)"),
            ColumnKind::Uuid => format!("CAST({expression} AS UUID)"),
            ColumnKind::Date => format!("CAST({expression} AS DATE)"),
            ColumnKind::DateTime => format!("CAST({expression} AS TIMESTAMPTZ)"),
            ColumnKind::Json => format!("CAST({expression} AS JSONB)"),
            ColumnKind::Boolean => expression.to_owned(),
        }
    }

    fn date_part(&self, function: FieldFunction, expression: &str) -> String {
        let part = match function {
            FieldFunction::Year => "YEAR",
            FieldFunction::Month => "MONTH",
            FieldFunction::Week => "WEEK",
            FieldFunction::Day => "DAY",
            FieldFunction::Weekday => "DOW",
            FieldFunction::Hour => "HOUR",
            FieldFunction::Minute => "MINUTE",
            FieldFunction::Second => "SECOND",
        };
        format!("CAST(EXTRACT({part} FROM {expression}) AS INTEGER)")
    }

    fn case_insensitive_like(&self, expression: &str, placeholder: &str) -> String {
        format!("{expression} ILIKE {placeholder} ESCAPE '\\'")
    }
}

#[cfg(test)]
mod tests {
    use tessera_application::{ColumnKind, SqlDialect};
    use tessera_domain::FieldFunction;

    use super::PostgresDialect;

    #[test]
    fn placeholders_carry_casts_for_non_text_kinds() {
        assert_eq!(PostgresDialect.placeholder(1, Some(ColumnKind::Uuid)), "$1::uuid");
        assert_eq!(
            PostgresDialect.placeholder(2, Some(ColumnKind::DateTime)),
            "$2::timestamptz"
        );
        assert_eq!(PostgresDialect.placeholder(3, Some(ColumnKind::Text)), "$3");
        assert_eq!(PostgresDialect.placeholder(4, None), "$4");
    }

    #[test]
    fn weekday_uses_day_of_week() {
        assert_eq!(
            PostgresDialect.date_part(FieldFunction::Weekday, "\"t0\".\"created_at\""),
            "CAST(EXTRACT(DOW FROM \"t0\".\"created_at\") AS INTEGER)"
        );
    }
}
