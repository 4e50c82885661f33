//! Error types for the core crate

use thiserror::Error;

/// Core consensus data errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid pubkey: {0}")]
    InvalidPubkey(String),

    #[error("Invalid round: {0}")]
    InvalidRound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<bincode::error::EncodeError> for CoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CoreError::Deserialization(err.to_string())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
