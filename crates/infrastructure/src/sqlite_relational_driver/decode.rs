use serde_json::{Number, Value};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tessera_application::{ColumnKind, DriverRow, OutputColumn};
use tessera_core::AppResult;

use crate::driver_errors::decode_error;

/// Decodes one row by declared column kind.
///
/// SQLite stores values loosely, so decoding relies on SQLite's own
/// conversions instead of the declared column affinity.
pub(super) fn decode_row(row: &SqliteRow, columns: &[OutputColumn]) -> AppResult<DriverRow> {
    let mut decoded = DriverRow::new();
    for column in columns {
        let value = decode_value(row, column)?;
        decoded.insert(column.name.clone(), value);
    }
    Ok(decoded)
}

fn decode_value(row: &SqliteRow, column: &OutputColumn) -> AppResult<Value> {
    let name = column.name.as_str();
    let map = |error| decode_error(name, error);
    let value = match column.kind {
        ColumnKind::Integer => row
            .try_get_unchecked::<Option<i64>, _>(name)
            .map_err(map)?
            .map(Value::from),
        ColumnKind::Float => row
            .try_get_unchecked::<Option<f64>, _>(name)
            .map_err(map)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        ColumnKind::Boolean => row
            .try_get_unchecked::<Option<bool>, _>(name)
            .map_err(map)?
            .map(Value::Bool),
        ColumnKind::Flag => Some(Value::Bool(
            row.try_get_unchecked::<Option<i64>, _>(name)
                .map_err(map)?
                .is_some_and(|flag| flag != 0),
        )),
        ColumnKind::Json => row
            .try_get_unchecked::<Option<String>, _>(name)
            .map_err(map)?
            .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text))),
        ColumnKind::Text | ColumnKind::Uuid | ColumnKind::Date | ColumnKind::DateTime => row
            .try_get_unchecked::<Option<String>, _>(name)
            .map_err(map)?
            .map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}
