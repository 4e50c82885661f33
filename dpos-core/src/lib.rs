//! Core consensus data structures
//!
//! This crate provides the fundamental building blocks for the DPoS round
//! engine:
//! - Basic types (Hash, Pubkey, RoundNumber, etc.)
//! - Round and MinerSlot structures
//! - Consensus header payloads
//! - Canonical hashing

pub mod error;
pub mod header;
pub mod round;
pub mod types;

// Re-export commonly used types
pub use error::*;
pub use header::*;
pub use round::*;
pub use types::*;
