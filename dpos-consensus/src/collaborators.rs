//! External collaborator seams
//!
//! The engine consumes three collaborators. None of them may halt consensus:
//! election and term-config failures degrade to the current miner list and
//! the configured defaults, and the treasury call is fire-and-forget.

use crate::{ConsensusError, ConsensusResult};
use dpos_core::{Pubkey, TermNumber};
use std::collections::BTreeMap;

/// A miner substitution the election authority requests at a round boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerReplacement {
    /// Miner to remove
    pub out_pubkey: Pubkey,
    /// Miner to install in its place
    pub in_pubkey: Pubkey,
}

/// Election authority: the source of truth for the next term's miner set
pub trait ElectionService: Send + Sync {
    /// The ranked winners of the current election; empty means "no election
    /// data yet"
    fn get_victories(&self) -> ConsensusResult<Vec<Pubkey>>;

    /// An evil-miner substitution for the current list, if any
    fn get_miner_replacement(
        &self,
        current_list: &[Pubkey],
    ) -> ConsensusResult<Option<MinerReplacement>>;
}

/// Read-only term configuration inputs
pub trait TermConfigService: Send + Sync {
    /// Term length in seconds
    fn period_seconds(&self) -> ConsensusResult<u64>;

    /// Interval at which the miner count may grow, in seconds
    fn miner_increase_interval_seconds(&self) -> ConsensusResult<u64>;

    /// Hard cap on the miner set size
    fn maximum_miners_count(&self) -> ConsensusResult<usize>;
}

/// Treasury notification at term boundaries
pub trait TreasuryService: Send + Sync {
    /// Release the previous term's rewards given per-miner block counts.
    /// Failures are logged by the caller and never block the transition.
    fn release(
        &self,
        term_number: TermNumber,
        mined_blocks: &BTreeMap<Pubkey, u64>,
    ) -> ConsensusResult<()>;
}

impl<T: ElectionService + ?Sized> ElectionService for std::sync::Arc<T> {
    fn get_victories(&self) -> ConsensusResult<Vec<Pubkey>> {
        (**self).get_victories()
    }

    fn get_miner_replacement(
        &self,
        current_list: &[Pubkey],
    ) -> ConsensusResult<Option<MinerReplacement>> {
        (**self).get_miner_replacement(current_list)
    }
}

impl<T: TreasuryService + ?Sized> TreasuryService for std::sync::Arc<T> {
    fn release(
        &self,
        term_number: TermNumber,
        mined_blocks: &BTreeMap<Pubkey, u64>,
    ) -> ConsensusResult<()> {
        (**self).release(term_number, mined_blocks)
    }
}

/// Static election double for tests and single-node tooling
#[derive(Debug, Default, Clone)]
pub struct StaticElection {
    pub victories: Vec<Pubkey>,
    pub replacement: Option<MinerReplacement>,
    pub unavailable: bool,
}

impl StaticElection {
    /// Election that always returns the given winners
    pub fn with_victories(victories: Vec<Pubkey>) -> Self {
        Self {
            victories,
            replacement: None,
            unavailable: false,
        }
    }
}

impl ElectionService for StaticElection {
    fn get_victories(&self) -> ConsensusResult<Vec<Pubkey>> {
        if self.unavailable {
            return Err(ConsensusError::CollaboratorUnavailable(
                "election service down".to_string(),
            ));
        }
        Ok(self.victories.clone())
    }

    fn get_miner_replacement(
        &self,
        _current_list: &[Pubkey],
    ) -> ConsensusResult<Option<MinerReplacement>> {
        if self.unavailable {
            return Err(ConsensusError::CollaboratorUnavailable(
                "election service down".to_string(),
            ));
        }
        Ok(self.replacement.clone())
    }
}

/// Term configuration double backed by fixed values
#[derive(Debug, Clone)]
pub struct StaticTermConfig {
    pub period_seconds: u64,
    pub miner_increase_interval_seconds: u64,
    pub maximum_miners_count: usize,
}

impl Default for StaticTermConfig {
    fn default() -> Self {
        Self {
            period_seconds: 604_800,
            miner_increase_interval_seconds: 31_536_000,
            maximum_miners_count: 17,
        }
    }
}

impl TermConfigService for StaticTermConfig {
    fn period_seconds(&self) -> ConsensusResult<u64> {
        Ok(self.period_seconds)
    }

    fn miner_increase_interval_seconds(&self) -> ConsensusResult<u64> {
        Ok(self.miner_increase_interval_seconds)
    }

    fn maximum_miners_count(&self) -> ConsensusResult<usize> {
        Ok(self.maximum_miners_count)
    }
}

/// Treasury double that records release calls
#[derive(Debug, Default)]
pub struct RecordingTreasury {
    releases: std::sync::Mutex<Vec<TermNumber>>,
    pub fail: bool,
}

impl RecordingTreasury {
    /// Terms for which release was called
    pub fn released_terms(&self) -> Vec<TermNumber> {
        self.releases.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TreasuryService for RecordingTreasury {
    fn release(
        &self,
        term_number: TermNumber,
        _mined_blocks: &BTreeMap<Pubkey, u64>,
    ) -> ConsensusResult<()> {
        if self.fail {
            return Err(ConsensusError::CollaboratorUnavailable(
                "treasury down".to_string(),
            ));
        }
        if let Ok(mut releases) = self.releases.lock() {
            releases.push(term_number);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_election() {
        let winners = vec![Pubkey::new([1u8; 32]), Pubkey::new([2u8; 32])];
        let election = StaticElection::with_victories(winners.clone());
        assert_eq!(election.get_victories().unwrap(), winners);

        let down = StaticElection {
            unavailable: true,
            ..Default::default()
        };
        assert!(matches!(
            down.get_victories(),
            Err(ConsensusError::CollaboratorUnavailable(_))
        ));
    }

    #[test]
    fn test_recording_treasury() {
        let treasury = RecordingTreasury::default();
        treasury.release(3, &BTreeMap::new()).unwrap();
        assert_eq!(treasury.released_terms(), vec![3]);
    }
}
