//! Consensus header: the candidate change a miner attaches to a block
//!
//! Every consensus-affecting transaction carries one of four payloads. The
//! behaviour set is a closed sum type so the validation pipeline must handle
//! every case exhaustively.

use crate::{BlockHeight, Hash, Pubkey, Round, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The four consensus behaviours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusBehaviour {
    /// Publish out-value/signature and reveal last round's in-value
    UpdateValue,
    /// Produce an additional block inside the current slot
    TinyBlock,
    /// Terminate the round and propose the next one
    NextRound,
    /// Terminate the term: new miner set, counters reset
    NextTerm,
}

impl fmt::Display for ConsensusBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusBehaviour::UpdateValue => "UpdateValue",
            ConsensusBehaviour::TinyBlock => "TinyBlock",
            ConsensusBehaviour::NextRound => "NextRound",
            ConsensusBehaviour::NextTerm => "NextTerm",
        };
        write!(f, "{name}")
    }
}

/// Payload of an `UpdateValue` transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpdateValueInput {
    /// Identifier of the round this update was generated for
    pub round_id: u64,
    /// Commitment to this round's in-value
    pub out_value: Option<Hash>,
    /// Signature chaining previous-round randomness
    pub signature: Option<Hash>,
    /// Reveal of the previous round's in-value
    pub previous_in_value: Option<Hash>,
    /// When the block was actually produced
    pub actual_mining_time: Timestamp,
    /// The order this miner claims for itself in the next round
    pub supplied_order_of_next_round: u32,
    /// Self-reported irreversible block height
    pub implied_irreversible_block_height: BlockHeight,
    /// Encrypted share pieces this miner deals out, keyed by recipient
    pub encrypted_pieces: BTreeMap<Pubkey, Vec<u8>>,
    /// Commitments to the plaintext shares behind `encrypted_pieces`,
    /// keyed by recipient
    pub piece_commitments: BTreeMap<Pubkey, Hash>,
    /// Decrypted pieces of other miners' shares, keyed by the dealing miner
    pub decrypted_pieces: BTreeMap<Pubkey, Vec<u8>>,
    /// Previous in-values this miner reconstructed for absent miners
    pub miners_previous_in_values: BTreeMap<Pubkey, Hash>,
}

/// Payload of a `TinyBlock` transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TinyBlockInput {
    /// Identifier of the round this update was generated for
    pub round_id: u64,
    /// When the block was actually produced
    pub actual_mining_time: Timestamp,
    /// Blocks produced so far in this slot, including this one
    pub produced_blocks: u64,
}

/// Behaviour-tagged consensus payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPayload {
    UpdateValue(UpdateValueInput),
    TinyBlock(TinyBlockInput),
    NextRound(Round),
    NextTerm(Round),
}

impl ConsensusPayload {
    /// The behaviour this payload encodes
    pub fn behaviour(&self) -> ConsensusBehaviour {
        match self {
            ConsensusPayload::UpdateValue(_) => ConsensusBehaviour::UpdateValue,
            ConsensusPayload::TinyBlock(_) => ConsensusBehaviour::TinyBlock,
            ConsensusPayload::NextRound(_) => ConsensusBehaviour::NextRound,
            ConsensusPayload::NextTerm(_) => ConsensusBehaviour::NextTerm,
        }
    }

    /// The proposed round, for round-creating payloads
    pub fn proposed_round(&self) -> Option<&Round> {
        match self {
            ConsensusPayload::NextRound(round) | ConsensusPayload::NextTerm(round) => Some(round),
            _ => None,
        }
    }
}

/// The candidate consensus change attached to a block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusHeader {
    /// The miner proposing this change
    pub sender: Pubkey,
    /// Timestamp of the proposing block
    pub block_time: Timestamp,
    /// Height of the proposing block
    pub block_height: BlockHeight,
    /// The proposed change
    pub payload: ConsensusPayload,
    /// The canonical hash the sender claims the committed round will have;
    /// checked after execution
    pub declared_round_hash: Hash,
}

impl ConsensusHeader {
    /// The behaviour this header proposes
    pub fn behaviour(&self) -> ConsensusBehaviour {
        self.payload.behaviour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_behaviour() {
        let payload = ConsensusPayload::UpdateValue(UpdateValueInput::default());
        assert_eq!(payload.behaviour(), ConsensusBehaviour::UpdateValue);

        let payload = ConsensusPayload::NextRound(Round::new(2, 1));
        assert_eq!(payload.behaviour(), ConsensusBehaviour::NextRound);
        assert!(payload.proposed_round().is_some());

        let payload = ConsensusPayload::TinyBlock(TinyBlockInput::default());
        assert!(payload.proposed_round().is_none());
    }

    #[test]
    fn test_behaviour_display() {
        assert_eq!(ConsensusBehaviour::NextTerm.to_string(), "NextTerm");
    }
}
