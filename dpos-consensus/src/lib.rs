//! DPoS round consensus engine
//!
//! This crate drives rounds and terms over the stored snapshots:
//! time-slot arithmetic, round generation, secret-share bookkeeping,
//! irreversible-height aggregation, transition validation and the
//! orchestrator tying them together.

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod generator;
pub mod lib_height;
pub mod orchestrator;
pub mod secret;
pub mod validation;

pub use collaborators::{
    ElectionService, MinerReplacement, RecordingTreasury, StaticElection, StaticTermConfig,
    TermConfigService, TreasuryService,
};
pub use config::ConsensusConfig;
pub use error::{ConsensusError, ConsensusResult};
pub use lib_height::LibPosition;
pub use orchestrator::{ConsensusCommand, ConsensusOrchestrator};
pub use validation::{TransitionValidator, ValidationContext};
