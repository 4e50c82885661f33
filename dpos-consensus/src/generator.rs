//! Round generation
//!
//! Produces the round N+1 snapshot from round N: miners who produced a block
//! keep the next-round order they were assigned, miners who missed their slot
//! are slotted into the remaining orders deterministically and have their
//! missed-slot counter bumped. Term boundaries swap in the elected miner list
//! and reset the per-term counters.

use crate::{clock, ConsensusConfig, ConsensusError, ConsensusResult};
use dpos_core::{MinerSlot, Pubkey, Round, TermNumber, Timestamp};
use std::collections::BTreeSet;
use tracing::debug;

/// Derive the next round's extra-block-producer order from the current
/// round's order-1 miner signature, modulo miner count. Verifiable by any
/// validator holding the same round snapshot.
pub fn next_extra_block_producer_order(current: &Round) -> u32 {
    let count = current.miner_count() as u64;
    if count == 0 {
        return 1;
    }
    let signature = current.first_slot().and_then(|s| s.signature);
    match signature {
        Some(sig) => {
            let bytes = sig.as_bytes();
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            (u64::from_le_bytes(raw) % count) as u32 + 1
        }
        None => 1,
    }
}

fn blockchain_age_seconds(block_time: Timestamp, genesis_time: Timestamp) -> u64 {
    block_time.saturating_sub(genesis_time) / 1000
}

/// Generate the genesis round from an initial miner list. Orders are assigned
/// in ascending pubkey order.
pub fn generate_genesis_round(
    miners: &[Pubkey],
    genesis_time: Timestamp,
    config: &ConsensusConfig,
) -> ConsensusResult<Round> {
    if miners.is_empty() {
        return Err(ConsensusError::Structural(
            "cannot generate a round without miners".to_string(),
        ));
    }
    let unique: BTreeSet<&Pubkey> = miners.iter().collect();
    if unique.len() != miners.len() {
        return Err(ConsensusError::Structural(
            "duplicate pubkeys in miner list".to_string(),
        ));
    }

    let mut round = Round::new(1, 1);
    for (i, pubkey) in unique.into_iter().enumerate() {
        let order = i as u32 + 1;
        let expected = genesis_time + config.mining_interval_ms * order as u64;
        round.miners.insert(*pubkey, MinerSlot::new(*pubkey, order, expected));
    }
    round.check_structure()?;
    Ok(round)
}

/// Generate round N+1 within the same term
pub fn generate_next_round(
    current: &Round,
    block_time: Timestamp,
    genesis_time: Timestamp,
    config: &ConsensusConfig,
) -> ConsensusResult<Round> {
    current.check_structure().map_err(|e| {
        ConsensusError::Structural(format!("cannot extend a malformed round: {e}"))
    })?;

    let miner_count = current.miner_count() as u32;
    let mut next = Round::new(current.round_number + 1, current.term_number);
    next.blockchain_age = blockchain_age_seconds(block_time, genesis_time);
    next.confirmed_irreversible_block_height = current.confirmed_irreversible_block_height;
    next.confirmed_irreversible_block_round_number =
        current.confirmed_irreversible_block_round_number;
    next.extra_block_producer_order = next_extra_block_producer_order(current);

    // Miners that produced a block carry the order they earned
    let mut taken: BTreeSet<u32> = BTreeSet::new();
    for slot in current.miners.values() {
        if !slot.is_mined() {
            continue;
        }
        let order = slot.final_order_of_next_round;
        if order == 0 || order > miner_count || !taken.insert(order) {
            return Err(ConsensusError::Structural(format!(
                "invalid next-round order {order} for miner {}",
                slot.pubkey
            )));
        }
    }

    let mut free_orders: Vec<u32> = (1..=miner_count).filter(|o| !taken.contains(o)).collect();
    free_orders.reverse(); // pop() yields ascending

    for slot in current.miners.values() {
        let (order, missed_bump) = if slot.is_mined() {
            (slot.final_order_of_next_round, 0)
        } else {
            let order = free_orders.pop().ok_or_else(|| {
                ConsensusError::Structural("ran out of free orders".to_string())
            })?;
            (order, 1)
        };

        let expected = block_time + config.mining_interval_ms * order as u64;
        let mut new_slot = MinerSlot::new(slot.pubkey, order, expected);
        new_slot.produced_blocks = slot.produced_blocks;
        new_slot.missed_time_slots = slot.missed_time_slots + missed_bump;
        next.miners.insert(slot.pubkey, new_slot);
    }

    next.check_structure()?;
    clock::check_time_slots(&next, config)?;
    debug!(
        round = next.round_number,
        term = next.term_number,
        "generated next round"
    );
    Ok(next)
}

/// Generate the first round of a new term from the elected miner list.
/// Per-term counters reset; orders are assigned in ascending pubkey order.
pub fn generate_first_round_of_term(
    current: &Round,
    new_miners: &[Pubkey],
    block_time: Timestamp,
    genesis_time: Timestamp,
    new_term: TermNumber,
    config: &ConsensusConfig,
) -> ConsensusResult<Round> {
    if new_miners.is_empty() {
        return Err(ConsensusError::Structural(
            "cannot start a term without miners".to_string(),
        ));
    }
    if new_miners.len() > config.maximum_miners_count {
        return Err(ConsensusError::Structural(format!(
            "miner list of {} exceeds maximum {}",
            new_miners.len(),
            config.maximum_miners_count
        )));
    }
    let unique: BTreeSet<&Pubkey> = new_miners.iter().collect();
    if unique.len() != new_miners.len() {
        return Err(ConsensusError::Structural(
            "duplicate pubkeys in miner list".to_string(),
        ));
    }

    let current_set: BTreeSet<&Pubkey> = current.miners.keys().collect();
    let mut round = Round::new(current.round_number + 1, new_term);
    round.blockchain_age = blockchain_age_seconds(block_time, genesis_time);
    round.confirmed_irreversible_block_height = current.confirmed_irreversible_block_height;
    round.confirmed_irreversible_block_round_number =
        current.confirmed_irreversible_block_round_number;
    round.is_miner_list_just_changed = unique != current_set;
    round.extra_block_producer_order = 1;

    for (i, pubkey) in unique.into_iter().enumerate() {
        let order = i as u32 + 1;
        let expected = block_time + config.mining_interval_ms * order as u64;
        round.miners.insert(*pubkey, MinerSlot::new(*pubkey, order, expected));
    }

    round.check_structure()?;
    debug!(
        round = round.round_number,
        term = round.term_number,
        miner_list_changed = round.is_miner_list_just_changed,
        "generated first round of term"
    );
    Ok(round)
}

/// Swap one miner for another at a round boundary, keeping the outgoing
/// miner's order and schedule. Used for evil-miner replacement.
pub fn apply_miner_replacement(
    round: &mut Round,
    out_pubkey: &Pubkey,
    in_pubkey: Pubkey,
) -> ConsensusResult<()> {
    if round.contains_miner(&in_pubkey) {
        return Err(ConsensusError::Structural(format!(
            "replacement miner {in_pubkey} already in the round"
        )));
    }
    let old = round.miners.remove(out_pubkey).ok_or_else(|| {
        ConsensusError::Structural(format!("miner {out_pubkey} not in the round"))
    })?;
    let mut slot = MinerSlot::new(in_pubkey, old.order, old.expected_mining_time);
    slot.final_order_of_next_round = old.final_order_of_next_round;
    round.miners.insert(in_pubkey, slot);
    round.is_miner_list_just_changed = true;
    Ok(())
}
