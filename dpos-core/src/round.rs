//! Round and miner-slot data structures
//!
//! A `Round` is the authoritative snapshot of one consensus round: the ordered
//! miner schedule, each miner's cryptographic commitments, and the last
//! irreversible block position derived so far.

use crate::{BlockHeight, CoreError, CoreResult, Hash, Pubkey, RoundNumber, TermNumber, Timestamp};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

/// Per-miner state within a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct MinerSlot {
    /// Miner public key
    pub pubkey: Pubkey,
    /// Mining sequence position, 1..=N, unique within the round
    pub order: u32,
    /// Timestamp this miner is expected to produce its block
    pub expected_mining_time: Timestamp,
    /// Timestamp the miner actually produced a block, if it did
    pub actual_mining_time: Option<Timestamp>,
    /// Total blocks produced by this miner in the current term
    pub produced_blocks: u64,
    /// Total slots this miner missed in the current term
    pub missed_time_slots: u64,
    /// Tiny blocks produced inside the current slot
    pub produced_tiny_blocks: u64,
    /// Published commitment: hash of this round's in-value
    pub out_value: Option<Hash>,
    /// The secret behind `out_value`, revealed in the next round
    pub in_value: Option<Hash>,
    /// The previous round's in-value, proving last round's commitment
    pub previous_in_value: Option<Hash>,
    /// Signature chaining this miner's randomness into the round
    pub signature: Option<Hash>,
    /// Self-reported irreversible block height
    pub implied_irreversible_block_height: BlockHeight,
    /// Encrypted secret-share pieces, keyed by the contributing miner
    pub encrypted_pieces: BTreeMap<Pubkey, Vec<u8>>,
    /// Decrypted secret-share pieces, keyed by the contributing miner
    pub decrypted_pieces: BTreeMap<Pubkey, Vec<u8>>,
    /// Commitments binding each decrypted piece to its encrypted counterpart,
    /// keyed by the contributing miner
    pub piece_commitments: BTreeMap<Pubkey, Hash>,
    /// Order assigned for the next round; 0 means unassigned (miner did not
    /// produce a block this round)
    pub final_order_of_next_round: u32,
}

impl MinerSlot {
    /// Create an empty slot for a miner at the given order
    pub fn new(pubkey: Pubkey, order: u32, expected_mining_time: Timestamp) -> Self {
        Self {
            pubkey,
            order,
            expected_mining_time,
            actual_mining_time: None,
            produced_blocks: 0,
            missed_time_slots: 0,
            produced_tiny_blocks: 0,
            out_value: None,
            in_value: None,
            previous_in_value: None,
            signature: None,
            implied_irreversible_block_height: 0,
            encrypted_pieces: BTreeMap::new(),
            decrypted_pieces: BTreeMap::new(),
            piece_commitments: BTreeMap::new(),
            final_order_of_next_round: 0,
        }
    }

    /// Whether this miner produced a block in this round
    pub fn is_mined(&self) -> bool {
        self.out_value.is_some()
    }
}

/// The authoritative snapshot of one consensus round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Round {
    /// Monotonically increasing round number, strictly previous + 1
    pub round_number: RoundNumber,
    /// Election term this round belongs to; changes only on a term transition
    pub term_number: TermNumber,
    /// Seconds since genesis at the time this round was created
    pub blockchain_age: u64,
    /// Last computed irreversible block height
    pub confirmed_irreversible_block_height: BlockHeight,
    /// Round number in which the irreversible height was computed
    pub confirmed_irreversible_block_round_number: RoundNumber,
    /// Set when the miner list was replaced at this round boundary; affects
    /// which fields participate in the canonical hash
    pub is_miner_list_just_changed: bool,
    /// Order of the miner expected to terminate this round
    pub extra_block_producer_order: u32,
    /// Miner schedule, keyed by pubkey
    pub miners: BTreeMap<Pubkey, MinerSlot>,
}

impl Round {
    /// Create an empty round shell
    pub fn new(round_number: RoundNumber, term_number: TermNumber) -> Self {
        Self {
            round_number,
            term_number,
            blockchain_age: 0,
            confirmed_irreversible_block_height: 0,
            confirmed_irreversible_block_round_number: 0,
            is_miner_list_just_changed: false,
            extra_block_producer_order: 1,
            miners: BTreeMap::new(),
        }
    }

    /// Number of miners in this round
    pub fn miner_count(&self) -> usize {
        self.miners.len()
    }

    /// Get a miner's slot
    pub fn slot(&self, pubkey: &Pubkey) -> Option<&MinerSlot> {
        self.miners.get(pubkey)
    }

    /// Get a miner's slot mutably
    pub fn slot_mut(&mut self, pubkey: &Pubkey) -> Option<&mut MinerSlot> {
        self.miners.get_mut(pubkey)
    }

    /// Get the slot at a given mining order
    pub fn slot_by_order(&self, order: u32) -> Option<&MinerSlot> {
        self.miners.values().find(|s| s.order == order)
    }

    /// Whether a pubkey belongs to this round's miner set
    pub fn contains_miner(&self, pubkey: &Pubkey) -> bool {
        self.miners.contains_key(pubkey)
    }

    /// Slots sorted by mining order
    pub fn slots_in_order(&self) -> Vec<&MinerSlot> {
        let mut slots: Vec<&MinerSlot> = self.miners.values().collect();
        slots.sort_by_key(|s| s.order);
        slots
    }

    /// Miner pubkeys in mining order
    pub fn miner_list(&self) -> Vec<Pubkey> {
        self.slots_in_order().iter().map(|s| s.pubkey).collect()
    }

    /// The slot with order 1
    pub fn first_slot(&self) -> Option<&MinerSlot> {
        self.slot_by_order(1)
    }

    /// The slot with the highest order
    pub fn last_slot(&self) -> Option<&MinerSlot> {
        self.slots_in_order().last().copied()
    }

    /// Round identifier used to match incremental updates against the round
    /// they were generated for; derived from the full expected schedule
    pub fn round_id(&self) -> u64 {
        self.miners
            .values()
            .fold(0u64, |acc, s| acc.wrapping_add(s.expected_mining_time))
    }

    /// Check structural integrity: orders must be exactly 1..=N with no
    /// duplicates and each slot's pubkey must match its key
    pub fn check_structure(&self) -> CoreResult<()> {
        if self.miners.is_empty() {
            return Err(CoreError::InvalidRound("round has no miners".to_string()));
        }
        let mut orders: Vec<u32> = Vec::with_capacity(self.miners.len());
        for (pubkey, slot) in &self.miners {
            if pubkey != &slot.pubkey {
                return Err(CoreError::InvalidRound(format!(
                    "slot pubkey mismatch for {pubkey}"
                )));
            }
            orders.push(slot.order);
        }
        orders.sort_unstable();
        for (i, order) in orders.iter().enumerate() {
            if *order != (i + 1) as u32 {
                return Err(CoreError::InvalidRound(format!(
                    "miner orders are not 1..={}, found {order} at position {i}",
                    self.miners.len()
                )));
            }
        }
        Ok(())
    }

    /// Strip the fields that do not participate in round identity: share
    /// pieces always, and previous in-values when the miner list just changed
    /// (a fresh miner set has no previous round to prove against).
    fn checkable(&self, include_previous_in_values: bool) -> Round {
        let mut round = self.clone();
        for slot in round.miners.values_mut() {
            slot.encrypted_pieces.clear();
            slot.decrypted_pieces.clear();
            slot.piece_commitments.clear();
            if !include_previous_in_values {
                slot.previous_in_value = None;
            }
        }
        round
    }

    /// Canonical hash of this round
    pub fn hash(&self) -> CoreResult<Hash> {
        let checkable = self.checkable(!self.is_miner_list_just_changed);
        let encoded = bincode::encode_to_vec(&checkable, bincode::config::standard())?;
        let hash_bytes = Keccak256::digest(&encoded);
        Ok(Hash::from_slice(hash_bytes.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pubkey(n: u8) -> Pubkey {
        Pubkey::new([n; 32])
    }

    fn test_round(miner_count: u8) -> Round {
        let mut round = Round::new(1, 1);
        for i in 0..miner_count {
            let pubkey = test_pubkey(i + 1);
            round.miners.insert(
                pubkey,
                MinerSlot::new(pubkey, (i + 1) as u32, 1_000_000 + (i as u64 + 1) * 4000),
            );
        }
        round
    }

    #[test]
    fn test_slots_in_order() {
        let round = test_round(3);
        let orders: Vec<u32> = round.slots_in_order().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn test_structure_check() {
        let round = test_round(5);
        assert!(round.check_structure().is_ok());

        let empty = Round::new(1, 1);
        assert!(empty.check_structure().is_err());

        let mut dup = test_round(3);
        dup.slot_mut(&test_pubkey(2)).unwrap().order = 1;
        assert!(dup.check_structure().is_err());
    }

    #[test]
    fn test_round_hash_ignores_pieces() {
        let mut round = test_round(3);
        let before = round.hash().unwrap();
        round
            .slot_mut(&test_pubkey(1))
            .unwrap()
            .encrypted_pieces
            .insert(test_pubkey(2), vec![1, 2, 3]);
        assert_eq!(round.hash().unwrap(), before);
    }

    #[test]
    fn test_round_hash_sensitive_to_values() {
        let mut round = test_round(3);
        let before = round.hash().unwrap();
        round.slot_mut(&test_pubkey(1)).unwrap().out_value = Some(Hash::new([9u8; 32]));
        assert_ne!(round.hash().unwrap(), before);
    }

    #[test]
    fn test_miner_list_change_excludes_previous_in_values() {
        let mut round = test_round(3);
        round.is_miner_list_just_changed = true;
        let before = round.hash().unwrap();
        round.slot_mut(&test_pubkey(1)).unwrap().previous_in_value = Some(Hash::new([7u8; 32]));
        assert_eq!(round.hash().unwrap(), before);
    }

    #[test]
    fn test_round_id_changes_with_schedule() {
        let a = test_round(3);
        let mut b = test_round(3);
        b.slot_mut(&test_pubkey(1)).unwrap().expected_mining_time += 1;
        assert_ne!(a.round_id(), b.round_id());
    }
}
