use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{Number, Value};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tessera_application::{ColumnKind, DriverRow, OutputColumn};
use tessera_core::AppResult;
use uuid::Uuid;

use crate::driver_errors::decode_error;

/// Decodes one row; selected columns were cast to the kind's wire type.
pub(super) fn decode_row(row: &PgRow, columns: &[OutputColumn]) -> AppResult<DriverRow> {
    let mut decoded = DriverRow::new();
    for column in columns {
        let value = decode_value(row, column)?;
        decoded.insert(column.name.clone(), value);
    }
    Ok(decoded)
}

fn decode_value(row: &PgRow, column: &OutputColumn) -> AppResult<Value> {
    let name = column.name.as_str();
    let map = |error| decode_error(name, error);
    let value = match column.kind {
        ColumnKind::Integer => row
            .try_get::<Option<i64>, _>(name)
            .map_err(map)?
            .map(Value::from),
        ColumnKind::Flag => Some(Value::Bool(
            row.try_get::<Option<i64>, _>(name)
                .map_err(map)?
                .is_some_and(|flag| flag != 0),
        )),
        ColumnKind::Float => row
            .try_get::<Option<f64>, _>(name)
            .map_err(map)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        ColumnKind::Boolean => row
            .try_get::<Option<bool>, _>(name)
            .map_err(map)?
            .map(Value::Bool),
        ColumnKind::Text => row
            .try_get::<Option<String>, _>(name)
            .map_err(map)?
            .map(Value::String),
        ColumnKind::Uuid => row
            .try_get::<Option<Uuid>, _>(name)
            .map_err(map)?
            .map(|uuid| Value::String(uuid.to_string())),
        ColumnKind::Date => row
            .try_get::<Option<NaiveDate>, _>(name)
            .map_err(map)?
            .map(|date| Value::String(date.format("%Y-%m-%d").to_string())),
        ColumnKind::DateTime => row
            .try_get::<Option<DateTime<Utc>>, _>(name)
            .map_err(map)?
            .map(|timestamp| {
                Value::String(timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }),
        ColumnKind::Json => row.try_get::<Option<Value>, _>(name).map_err(map)?,
    };
    Ok(value.unwrap_or(Value::Null))
}
