use tessera_core::AppError;

/// Maps a failed statement to an execution error, keeping the database code
/// and message untouched.
pub(crate) fn execution_error(error: sqlx::Error) -> AppError {
    match error {
        sqlx::Error::Database(database_error) => AppError::Execution {
            code: database_error.code().map(|code| code.into_owned()),
            message: database_error.message().to_owned(),
        },
        other => AppError::Execution {
            code: None,
            message: other.to_string(),
        },
    }
}

/// Maps a column that could not be decoded as its declared kind.
pub(crate) fn decode_error(column: &str, error: sqlx::Error) -> AppError {
    AppError::Internal(format!("failed to decode column '{column}': {error}"))
}
