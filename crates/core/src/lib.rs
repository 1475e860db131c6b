//! Shared primitives for all Rust crates in Tessera.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across Tessera crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for NonEmptyString {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

/// Transport-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed configuration or schema input.
    Validation,
    /// Query references something invalid or misuses an operator.
    InvalidQuery,
    /// Caller lacks access.
    Forbidden,
    /// Relational driver failure.
    Execution,
    /// Caller went away before the result was assembled.
    Cancelled,
    /// Broken invariant.
    Internal,
}

impl ErrorKind {
    /// Returns stable storage/transport value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::InvalidQuery => "invalid_query",
            Self::Forbidden => "forbidden",
            Self::Execution => "execution",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant in configuration or schema data.
    #[error("validation error: {0}")]
    Validation(String),

    /// Query tree or filter cannot be compiled.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Caller is blocked by authorization policy.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Relational driver rejected or failed a statement.
    #[error("execution error: {message}")]
    Execution {
        /// Driver-specific error code, such as a SQLSTATE.
        code: Option<String>,
        /// Driver message, unmodified.
        message: String,
    },

    /// Request was cancelled before the result was complete.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the category used by transports to pick a status code.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
