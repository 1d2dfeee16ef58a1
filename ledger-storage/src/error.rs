//! Error types for the storage engine
//!
//! Backend failures are classified into a small taxonomy so callers can react
//! without knowing PostgreSQL error codes. Payloads are strings so one failure
//! can be handed to every waiter of a write batch.

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Point lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or referential constraint rejected the write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Backend ran out of connections or another capacity limit
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Namespace exists but its migrations have not run
    #[error("Store not initialized: {0}")]
    StoreNotInitialized(String),

    /// Malformed cursor or filter
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A migration unit failed; the whole run was rolled back
    #[error("Migration {version} failed: {message}")]
    Migration {
        /// Version of the failing unit
        version: u64,
        /// Handler error
        message: String,
    },

    /// Write worker is gone
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Domain validation failure
    #[error(transparent)]
    Ledger(#[from] ledger_core::Error),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Flat classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::ConstraintViolation`]
    ConstraintViolation,
    /// See [`Error::ResourceExhausted`]
    ResourceExhausted,
    /// See [`Error::StoreNotInitialized`]
    StoreNotInitialized,
    /// Caller supplied something invalid
    Validation,
    /// Everything else
    Internal,
}

impl ErrorKind {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::StoreNotInitialized => "store_not_initialized",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::StoreNotInitialized(_) => ErrorKind::StoreNotInitialized,
            Error::InvalidQuery(_) | Error::Ledger(_) => ErrorKind::Validation,
            Error::Migration { .. }
            | Error::Concurrency(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Backend(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error is [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// PostgreSQL SQLSTATE codes the taxonomy cares about
mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const TOO_MANY_CONNECTIONS: &str = "53300";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const INVALID_SCHEMA_NAME: &str = "3F000";
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                Error::ResourceExhausted("timed out acquiring a connection".to_string())
            }
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some(sqlstate::UNIQUE_VIOLATION) | Some(sqlstate::FOREIGN_KEY_VIOLATION) => {
                        Error::ConstraintViolation(message)
                    }
                    Some(sqlstate::TOO_MANY_CONNECTIONS) => Error::ResourceExhausted(message),
                    Some(sqlstate::UNDEFINED_TABLE) | Some(sqlstate::INVALID_SCHEMA_NAME) => {
                        Error::StoreNotInitialized(message)
                    }
                    _ => Error::Backend(message),
                }
            }
            _ => Error::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Backend(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Backend(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_pool_timeout_maps_to_resource_exhausted() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_domain_errors_are_validation() {
        let err: Error = ledger_core::Error::InvalidAddress("a::b".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Invalid address: a::b");
    }

    #[test]
    fn test_errors_are_shareable() {
        let err = Error::ConstraintViolation("duplicate reference".to_string());
        let copies: Vec<Error> = (0..3).map(|_| err.clone()).collect();
        assert!(copies.iter().all(|e| e == &err));
    }
}
