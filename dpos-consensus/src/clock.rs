//! Pure time-slot arithmetic over rounds
//!
//! Everything here is a pure function of a round and the configuration; no
//! clocks are read. The observed mining interval of a round is derived from
//! the schedule itself (the delta between the first two slots) and must stay
//! within the configured tolerance band, so a proposer can neither stall the
//! chain with a huge interval nor livelock it with a near-zero one.

use crate::{ConsensusConfig, ConsensusError, ConsensusResult};
use dpos_core::{DurationMs, Pubkey, Round, Timestamp};

/// The mining interval encoded in a round's schedule, in milliseconds.
///
/// Derived from the delta between the miners of order 1 and order 2; a
/// single-miner round uses the configured base interval. Intervals outside
/// the configured tolerance band are rejected.
pub fn mining_interval(round: &Round, config: &ConsensusConfig) -> ConsensusResult<DurationMs> {
    if round.miner_count() <= 1 {
        return Ok(config.mining_interval_ms);
    }

    let first = round
        .slot_by_order(1)
        .ok_or_else(|| ConsensusError::Structural("round has no order-1 miner".to_string()))?;
    let second = round
        .slot_by_order(2)
        .ok_or_else(|| ConsensusError::Structural("round has no order-2 miner".to_string()))?;

    let interval = second
        .expected_mining_time
        .checked_sub(first.expected_mining_time)
        .ok_or_else(|| {
            ConsensusError::Structural("mining times are not increasing with order".to_string())
        })?;

    check_interval_bounds(interval, config)?;
    Ok(interval)
}

fn check_interval_bounds(interval: DurationMs, config: &ConsensusConfig) -> ConsensusResult<()> {
    if interval < config.min_interval_ms() || interval > config.max_interval_ms() {
        return Err(ConsensusError::Bounds(format!(
            "mining interval {interval}ms outside [{}, {}]ms",
            config.min_interval_ms(),
            config.max_interval_ms()
        )));
    }
    Ok(())
}

/// The timestamp the round's first slot opens at
pub fn round_start_time(round: &Round) -> ConsensusResult<Timestamp> {
    round
        .first_slot()
        .map(|s| s.expected_mining_time)
        .ok_or_else(|| ConsensusError::Structural("round has no order-1 miner".to_string()))
}

/// The timestamp after which the round may be terminated: the last miner's
/// slot plus one extra-block interval
pub fn expected_end_time(round: &Round, config: &ConsensusConfig) -> ConsensusResult<Timestamp> {
    let last = round
        .last_slot()
        .ok_or_else(|| ConsensusError::Structural("round has no miners".to_string()))?;
    let interval = mining_interval(round, config)?;
    Ok(last.expected_mining_time + interval)
}

/// Total wall-clock span of the round including the extra-block slot
pub fn round_duration(round: &Round, config: &ConsensusConfig) -> ConsensusResult<DurationMs> {
    let start = round_start_time(round)?;
    let end = expected_end_time(round, config)?;
    end.checked_sub(start)
        .ok_or_else(|| ConsensusError::Structural("round ends before it starts".to_string()))
}

/// Validate that every neighbouring pair of slots differs by an interval
/// within the tolerance band. Single-miner rounds trivially pass.
pub fn check_time_slots(round: &Round, config: &ConsensusConfig) -> ConsensusResult<()> {
    let slots = round.slots_in_order();
    if slots.len() <= 1 {
        return Ok(());
    }

    for pair in slots.windows(2) {
        let delta = pair[1]
            .expected_mining_time
            .checked_sub(pair[0].expected_mining_time)
            .ok_or_else(|| {
                ConsensusError::Timing(format!(
                    "slot {} is not after slot {}",
                    pair[1].order, pair[0].order
                ))
            })?;
        check_interval_bounds(delta, config).map_err(|_| {
            ConsensusError::Bounds(format!(
                "interval between orders {} and {} is {delta}ms, outside [{}, {}]ms",
                pair[0].order,
                pair[1].order,
                config.min_interval_ms(),
                config.max_interval_ms()
            ))
        })?;
    }
    Ok(())
}

/// The timestamp a miner's slot opens at
pub fn arranged_mining_time(round: &Round, pubkey: &Pubkey) -> ConsensusResult<Timestamp> {
    round
        .slot(pubkey)
        .map(|s| s.expected_mining_time)
        .ok_or_else(|| ConsensusError::Authorization(format!("{pubkey} is not a miner")))
}

/// Whether `now` falls inside the miner's assigned slot window
pub fn in_time_slot(
    round: &Round,
    pubkey: &Pubkey,
    now: Timestamp,
    config: &ConsensusConfig,
) -> ConsensusResult<bool> {
    let slot = round
        .slot(pubkey)
        .ok_or_else(|| ConsensusError::Authorization(format!("{pubkey} is not a miner")))?;
    let open = slot.expected_mining_time;
    let close = open + config.slot_limit_ms();
    Ok(now >= open && now < close)
}

/// Whether the miner's slot has already closed at `now`
pub fn time_slot_passed(
    round: &Round,
    pubkey: &Pubkey,
    now: Timestamp,
    config: &ConsensusConfig,
) -> ConsensusResult<bool> {
    let slot = round
        .slot(pubkey)
        .ok_or_else(|| ConsensusError::Authorization(format!("{pubkey} is not a miner")))?;
    Ok(now >= slot.expected_mining_time + config.slot_limit_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpos_core::MinerSlot;

    fn test_pubkey(n: u8) -> Pubkey {
        Pubkey::new([n; 32])
    }

    fn round_with_intervals(start: Timestamp, intervals: &[u64]) -> Round {
        let mut round = Round::new(1, 1);
        let mut t = start;
        for (i, gap) in std::iter::once(&0u64).chain(intervals.iter()).enumerate() {
            t += gap;
            let pubkey = test_pubkey(i as u8 + 1);
            round
                .miners
                .insert(pubkey, MinerSlot::new(pubkey, i as u32 + 1, t));
        }
        round
    }

    #[test]
    fn test_mining_interval_from_schedule() {
        let config = ConsensusConfig::default();
        let round = round_with_intervals(1_000_000, &[4000, 4000, 4000]);
        assert_eq!(mining_interval(&round, &config).unwrap(), 4000);
    }

    #[test]
    fn test_single_miner_uses_base_interval() {
        let config = ConsensusConfig::default();
        let round = round_with_intervals(1_000_000, &[]);
        assert_eq!(mining_interval(&round, &config).unwrap(), 4000);
        assert!(check_time_slots(&round, &config).is_ok());
    }

    #[test]
    fn test_interval_outside_band_rejected() {
        let config = ConsensusConfig::default();

        // Near-zero interval: livelock attempt
        let round = round_with_intervals(1_000_000, &[1, 1]);
        assert!(matches!(
            mining_interval(&round, &config),
            Err(ConsensusError::Bounds(_))
        ));

        // Double interval: slowdown attempt, also outside the 10% band
        let round = round_with_intervals(1_000_000, &[8000, 8000]);
        assert!(matches!(
            mining_interval(&round, &config),
            Err(ConsensusError::Bounds(_))
        ));
    }

    #[test]
    fn test_check_time_slots_catches_single_bad_gap() {
        let config = ConsensusConfig::default();

        // One interval at 3x while the others are fine
        let round = round_with_intervals(1_000_000, &[4000, 12_000, 4000]);
        assert!(matches!(
            check_time_slots(&round, &config),
            Err(ConsensusError::Bounds(_))
        ));

        // Within 10% tolerance passes
        let round = round_with_intervals(1_000_000, &[4000, 4200, 3800]);
        assert!(check_time_slots(&round, &config).is_ok());
    }

    #[test]
    fn test_expected_end_time() {
        let config = ConsensusConfig::default();
        let round = round_with_intervals(1_000_000, &[4000, 4000, 4000, 4000]);
        // Last slot at start + 4*4000, plus the extra-block interval
        assert_eq!(
            expected_end_time(&round, &config).unwrap(),
            1_000_000 + 5 * 4000
        );
        assert_eq!(round_duration(&round, &config).unwrap(), 5 * 4000);
    }

    #[test]
    fn test_slot_windows() {
        let config = ConsensusConfig::default();
        let round = round_with_intervals(1_000_000, &[4000, 4000]);
        let second = test_pubkey(2);

        assert!(!in_time_slot(&round, &second, 1_000_000, &config).unwrap());
        assert!(in_time_slot(&round, &second, 1_004_000, &config).unwrap());
        assert!(in_time_slot(&round, &second, 1_007_999, &config).unwrap());
        assert!(!in_time_slot(&round, &second, 1_008_000, &config).unwrap());
        assert!(time_slot_passed(&round, &second, 1_008_000, &config).unwrap());
    }
}
