//! Round store error types

use thiserror::Error;

/// Round store error type
#[derive(Error, Debug)]
pub enum DbError {
    /// RocksDB error
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Round not found
    #[error("Round {0} not found")]
    RoundNotFound(u64),

    /// Cursor advance out of sequence
    #[error("Cursor violation: {0}")]
    CursorViolation(String),

    /// Key already written or out of append order
    #[error("Append violation: {0}")]
    AppendViolation(String),

    /// Invalid stored data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Other error
    #[error("Store error: {0}")]
    Other(String),
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(err: bincode::error::EncodeError) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(err: bincode::error::DecodeError) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type for store operations
pub type DbResult<T> = Result<T, DbError>;
