//! Last-irreversible-block aggregation
//!
//! Miners self-report the height they consider irreversible; the aggregate is
//! a Byzantine-tolerant order statistic over those reports. The LIB only
//! advances when at least `2n/3 + 1` miners have reported a non-zero height,
//! and the selected value is the one at least a third of the reporters sit at
//! or above, so up to a third of dishonest reporters cannot drag it around —
//! provided each individual report has already passed the bounds checks
//! below.

use crate::{ConsensusConfig, ConsensusError, ConsensusResult};
use dpos_core::{BlockHeight, Round, RoundNumber};
use tracing::debug;

/// The agreement threshold for a miner set of the given size
pub fn consent_count(miner_count: usize) -> usize {
    miner_count * 2 / 3 + 1
}

/// A committed LIB position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LibPosition {
    pub height: BlockHeight,
    pub round_number: RoundNumber,
}

/// Validate one miner's self-reported irreversible height against the
/// pre-transition stored value and the actual chain height.
///
/// The comparison baseline must come from the stored round as it was before
/// this transition touched it; comparing against an already-mutated copy
/// makes the regression check vacuous.
pub fn validate_report(
    stored_height: BlockHeight,
    reported_height: BlockHeight,
    chain_height: BlockHeight,
    config: &ConsensusConfig,
) -> ConsensusResult<()> {
    if reported_height < stored_height {
        return Err(ConsensusError::Bounds(format!(
            "implied irreversible height regressed from {stored_height} to {reported_height}"
        )));
    }
    if reported_height == 0 {
        // Unset is allowed only while nothing was ever reported; the
        // regression check above already rejected 0 after a real report
        return Ok(());
    }
    if reported_height > chain_height {
        return Err(ConsensusError::Bounds(format!(
            "implied irreversible height {reported_height} exceeds chain height {chain_height}"
        )));
    }
    let floor = chain_height.saturating_sub(config.lib_report_window);
    if reported_height < floor {
        return Err(ConsensusError::Bounds(format!(
            "implied irreversible height {reported_height} implausibly far behind chain height \
             {chain_height} (window {})",
            config.lib_report_window
        )));
    }
    Ok(())
}

/// Aggregate the round's reports into a LIB position. Returns the previous
/// position unchanged when fewer than the consent count of miners have
/// reported, or when the candidate would regress.
pub fn aggregate(round: &Round, previous: LibPosition) -> LibPosition {
    let required = consent_count(round.miner_count());
    let mut reports: Vec<BlockHeight> = round
        .miners
        .values()
        .map(|s| s.implied_irreversible_block_height)
        .filter(|h| *h > 0)
        .collect();

    if reports.len() < required {
        debug!(
            reporting = reports.len(),
            required, "insufficient reports, LIB unchanged"
        );
        return previous;
    }

    reports.sort_unstable();
    // The height at least one third of reporters are at or above
    let candidate = reports[(reports.len() - 1) / 3];

    if candidate <= previous.height {
        return previous;
    }
    LibPosition {
        height: candidate,
        round_number: round.round_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpos_core::{MinerSlot, Pubkey};

    fn round_with_reports(reports: &[BlockHeight]) -> Round {
        let mut round = Round::new(10, 2);
        for (i, height) in reports.iter().enumerate() {
            let pubkey = Pubkey::new([i as u8 + 1; 32]);
            let mut slot = MinerSlot::new(pubkey, i as u32 + 1, 1_000_000);
            slot.implied_irreversible_block_height = *height;
            round.miners.insert(pubkey, slot);
        }
        round
    }

    #[test]
    fn test_consent_count() {
        assert_eq!(consent_count(3), 3);
        assert_eq!(consent_count(4), 3);
        assert_eq!(consent_count(7), 5);
        assert_eq!(consent_count(17), 12);
    }

    #[test]
    fn test_aggregate_advances_with_quorum() {
        // 7 miners, all reporting
        let round = round_with_reports(&[100, 101, 102, 103, 104, 105, 106]);
        let lib = aggregate(&round, LibPosition::default());
        // Sorted index (7-1)/3 = 2
        assert_eq!(lib.height, 102);
        assert_eq!(lib.round_number, 10);
    }

    #[test]
    fn test_aggregate_holds_below_quorum() {
        // 7 miners, consent is 5, only 4 non-zero reports
        let round = round_with_reports(&[0, 0, 0, 1000, 1000, 1000, 1000]);
        let previous = LibPosition {
            height: 500,
            round_number: 8,
        };
        assert_eq!(aggregate(&round, previous), previous);
    }

    #[test]
    fn test_aggregate_minority_cannot_collapse_lib() {
        // 3 low-ball reports against 4 honest ones: quorum of 5 reached,
        // selected index (7-1)/3 = 2 still lands on a dishonest value, but
        // the regression guard keeps the previous LIB
        let round = round_with_reports(&[1, 1, 1, 1000, 1000, 1000, 1000]);
        let previous = LibPosition {
            height: 900,
            round_number: 9,
        };
        assert_eq!(aggregate(&round, previous), previous);
    }

    #[test]
    fn test_validate_report_regression() {
        let config = ConsensusConfig::default();
        assert!(validate_report(100, 99, 1000, &config).is_err());
        // Zero after a real report is a regression, not an exemption
        assert!(validate_report(100, 0, 1000, &config).is_err());
        // Zero while still unset is fine
        assert!(validate_report(0, 0, 1000, &config).is_ok());
        assert!(validate_report(100, 100, 1000, &config).is_ok());
    }

    #[test]
    fn test_validate_report_window() {
        let config = ConsensusConfig::default();
        // Leading the chain is rejected
        assert!(validate_report(0, 2000, 1000, &config).is_err());
        // Implausibly stale is rejected (window 1024)
        assert!(validate_report(0, 10, 5000, &config).is_err());
        // Inside the window passes
        assert!(validate_report(0, 4500, 5000, &config).is_ok());
    }
}
