//! Error types for the ledger domain model

use thiserror::Error;

/// Result type for domain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Domain errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Account address does not follow the `segment(:segment)*` grammar
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Asset code is malformed
    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    /// Amount could not be parsed or went negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Transaction failed validation
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Log entry is malformed
    #[error("Invalid log: {0}")]
    InvalidLog(String),

    /// Hash chain does not verify at the given log id
    #[error("Hash chain broken at log {id}")]
    ChainBroken {
        /// First log whose hash does not match its recomputation
        id: u64,
    },

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
