//! Consensus error types
//!
//! Every variant except `CollaboratorUnavailable` is a hard rejection: the
//! proposing transaction fails atomically and no state changes. Collaborator
//! failures degrade to safe defaults inside the orchestrator instead.

use thiserror::Error;

/// Consensus error type
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    /// Malformed input: wrong number deltas, duplicate orders, missing fields
    #[error("Structural error: {0}")]
    Structural(String),

    /// Slot violation, premature round termination, stale timestamp
    #[error("Timing error: {0}")]
    Timing(String),

    /// Sender is not a recognized miner, or miner set does not match the
    /// election authority
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// A commitment failed its hash check or a share piece is not bound to
    /// its encrypted counterpart
    #[error("Cryptographic mismatch: {0}")]
    CryptographicMismatch(String),

    /// A value left its permitted range: regressing LIB height, implausible
    /// self-report, mining interval outside configured bounds
    #[error("Bounds error: {0}")]
    Bounds(String),

    /// An external collaborator failed; callers fall back to safe defaults
    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage failure underneath the engine
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<dpos_db::DbError> for ConsensusError {
    fn from(err: dpos_db::DbError) -> Self {
        ConsensusError::Store(err.to_string())
    }
}

impl From<dpos_core::CoreError> for ConsensusError {
    fn from(err: dpos_core::CoreError) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
