//! Round persistence layer
//!
//! This crate provides durable storage for round snapshots keyed by round
//! number, plus the two singleton cursors (current round number, current term
//! number) whose strict +1 ordering is enforced at this boundary.

pub mod backend;
pub mod error;
pub mod store;

pub use backend::{MemoryBackend, RocksBackend, RoundBackend};
pub use error::{DbError, DbResult};
pub use store::RoundStore;
