//! The validation pipeline gating every consensus-affecting transaction
//!
//! Every proposed header is checked against an immutable snapshot of the
//! pre-transition state (`ValidationContext`); nothing here mutates. The
//! pipeline per behaviour is assembled by an exhaustive match over the closed
//! behaviour enum, so a new behaviour cannot compile without declaring its
//! checks. First failure wins.

use crate::collaborators::MinerReplacement;
use crate::{clock, generator, lib_height, secret, ConsensusConfig, ConsensusError, ConsensusResult};
use dpos_core::{
    BlockHeight, ConsensusHeader, ConsensusPayload, Hash, Pubkey, Round, TermNumber, Timestamp,
    TinyBlockInput, UpdateValueInput,
};
use tracing::debug;

/// Immutable pre-transition state a header is validated against
pub struct ValidationContext<'a> {
    /// The stored current round, untouched by the candidate change
    pub base_round: &'a Round,
    /// The stored previous round, when one exists
    pub previous_round: Option<&'a Round>,
    /// The stored term cursor
    pub current_term_number: TermNumber,
    /// Actual chain height at validation time
    pub chain_height: BlockHeight,
    /// The miner set the election authority expects for the next term;
    /// only consulted for `NextTerm`
    pub expected_term_miners: Option<Vec<Pubkey>>,
    /// An evil-miner substitution the election authority sanctioned for the
    /// upcoming round; only consulted for `NextRound`
    pub expected_replacement: Option<MinerReplacement>,
    /// When the current term ends; only consulted for `NextTerm`
    pub term_expiry: Option<Timestamp>,
    /// Engine configuration
    pub config: &'a ConsensusConfig,
}

/// Stateless validator over a context snapshot
pub struct TransitionValidator;

impl TransitionValidator {
    /// Run the full pre-execution pipeline for a header
    pub fn validate_before_execution(
        ctx: &ValidationContext<'_>,
        header: &ConsensusHeader,
    ) -> ConsensusResult<()> {
        Self::check_mining_permission(ctx, &header.sender)?;

        match &header.payload {
            ConsensusPayload::UpdateValue(input) => {
                Self::check_round_id(ctx, input.round_id)?;
                Self::check_time_slot(ctx, &header.sender, header.block_time)?;
                Self::check_update_value(ctx, &header.sender, input)?;
                Self::check_lib_report(ctx, &header.sender, input.implied_irreversible_block_height)?;
            }
            ConsensusPayload::TinyBlock(input) => {
                Self::check_round_id(ctx, input.round_id)?;
                Self::check_time_slot(ctx, &header.sender, header.block_time)?;
                Self::check_continuous_blocks(ctx, &header.sender, input)?;
            }
            ConsensusPayload::NextRound(proposed) => {
                Self::check_round_termination(ctx, header.block_time)?;
                Self::check_proposed_structure(ctx, proposed)?;
                Self::check_next_round_numbers(ctx, proposed)?;
                Self::check_in_value_nullity(proposed)?;
                Self::check_pristine_slots(proposed)?;
                Self::check_carried_counters(ctx, proposed)?;
                Self::check_miner_continuity(ctx, proposed)?;
                Self::check_next_round_mining_order(ctx, proposed)?;
                Self::check_lib_bounds(ctx, proposed)?;
            }
            ConsensusPayload::NextTerm(proposed) => {
                Self::check_round_termination(ctx, header.block_time)?;
                Self::check_term_expiry(ctx, header.block_time)?;
                Self::check_proposed_structure(ctx, proposed)?;
                Self::check_next_term_numbers(ctx, proposed)?;
                Self::check_in_value_nullity(proposed)?;
                Self::check_pristine_slots(proposed)?;
                Self::check_reset_counters(proposed)?;
                Self::check_lib_bounds(ctx, proposed)?;
                Self::check_miner_set_authority(ctx, proposed)?;
            }
        }

        debug!(
            behaviour = %header.behaviour(),
            sender = %header.sender,
            "header passed pre-execution validation"
        );
        Ok(())
    }

    /// Post-execution consistency: the committed round must hash to the value
    /// the header declared. Pure comparison, so re-validating an already
    /// committed round is idempotent.
    pub fn validate_after_execution(
        committed: &Round,
        header: &ConsensusHeader,
    ) -> ConsensusResult<()> {
        let actual = committed.hash()?;
        if actual != header.declared_round_hash {
            return Err(ConsensusError::Structural(format!(
                "committed round hash {actual} does not match declared {}",
                header.declared_round_hash
            )));
        }
        Ok(())
    }

    /// Sender must be in the current round's miner set, or the previous
    /// round's to tolerate a miner rotating out mid-term
    fn check_mining_permission(ctx: &ValidationContext<'_>, sender: &Pubkey) -> ConsensusResult<()> {
        if ctx.base_round.contains_miner(sender) {
            return Ok(());
        }
        if let Some(previous) = ctx.previous_round {
            if previous.contains_miner(sender) {
                return Ok(());
            }
        }
        Err(ConsensusError::Authorization(format!(
            "{sender} is not a miner of the current or previous round"
        )))
    }

    fn check_round_id(ctx: &ValidationContext<'_>, round_id: u64) -> ConsensusResult<()> {
        let expected = ctx.base_round.round_id();
        if round_id != expected {
            return Err(ConsensusError::Structural(format!(
                "update generated for round id {round_id}, current round id is {expected}"
            )));
        }
        Ok(())
    }

    fn check_time_slot(
        ctx: &ValidationContext<'_>,
        sender: &Pubkey,
        block_time: Timestamp,
    ) -> ConsensusResult<()> {
        if !clock::in_time_slot(ctx.base_round, sender, block_time, ctx.config)? {
            let slot = ctx.base_round.slot(sender);
            return Err(ConsensusError::Timing(format!(
                "block time {block_time} outside {sender}'s slot starting at {}",
                slot.map(|s| s.expected_mining_time).unwrap_or_default()
            )));
        }
        Ok(())
    }

    fn check_continuous_blocks(
        ctx: &ValidationContext<'_>,
        sender: &Pubkey,
        input: &TinyBlockInput,
    ) -> ConsensusResult<()> {
        let slot = ctx
            .base_round
            .slot(sender)
            .ok_or_else(|| ConsensusError::Authorization(format!("{sender} is not a miner")))?;
        if slot.produced_tiny_blocks >= ctx.config.tiny_blocks_limit {
            return Err(ConsensusError::Bounds(format!(
                "{sender} reached the tiny block limit of {}",
                ctx.config.tiny_blocks_limit
            )));
        }
        if input.produced_blocks > ctx.config.tiny_blocks_limit {
            return Err(ConsensusError::Bounds(format!(
                "claimed {} blocks in one slot, limit is {}",
                input.produced_blocks, ctx.config.tiny_blocks_limit
            )));
        }
        Ok(())
    }

    /// A round may only be terminated once every slot, including the
    /// extra-block slot, has elapsed
    fn check_round_termination(
        ctx: &ValidationContext<'_>,
        block_time: Timestamp,
    ) -> ConsensusResult<()> {
        let end = clock::expected_end_time(ctx.base_round, ctx.config)?;
        if block_time < end {
            return Err(ConsensusError::Timing(format!(
                "round {} may not terminate before {end}, block time is {block_time}",
                ctx.base_round.round_number
            )));
        }
        Ok(())
    }

    fn check_proposed_structure(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        proposed
            .check_structure()
            .map_err(|e| ConsensusError::Structural(e.to_string()))?;
        clock::check_time_slots(proposed, ctx.config)
    }

    fn check_next_round_numbers(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        if proposed.round_number != ctx.base_round.round_number + 1 {
            return Err(ConsensusError::Structural(format!(
                "next round number must be {}, got {}",
                ctx.base_round.round_number + 1,
                proposed.round_number
            )));
        }
        // Both the round chain and the term cursor must agree; the two can
        // silently diverge if only one is checked
        if proposed.term_number != ctx.base_round.term_number
            || proposed.term_number != ctx.current_term_number
        {
            return Err(ConsensusError::Structural(format!(
                "NextRound must keep term {}, got {}",
                ctx.current_term_number, proposed.term_number
            )));
        }
        Ok(())
    }

    fn check_next_term_numbers(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        if proposed.round_number != ctx.base_round.round_number + 1 {
            return Err(ConsensusError::Structural(format!(
                "next round number must be {}, got {}",
                ctx.base_round.round_number + 1,
                proposed.round_number
            )));
        }
        if proposed.term_number != ctx.current_term_number + 1 {
            return Err(ConsensusError::Structural(format!(
                "NextTerm must advance term to {}, got {}",
                ctx.current_term_number + 1,
                proposed.term_number
            )));
        }
        Ok(())
    }

    /// A freshly proposed round must not disclose any in-values
    fn check_in_value_nullity(proposed: &Round) -> ConsensusResult<()> {
        for slot in proposed.miners.values() {
            if slot.in_value.is_some() {
                return Err(ConsensusError::Structural(format!(
                    "proposed round prematurely discloses in-value of {}",
                    slot.pubkey
                )));
            }
        }
        Ok(())
    }

    /// A term may only end once its configured period has elapsed
    fn check_term_expiry(
        ctx: &ValidationContext<'_>,
        block_time: Timestamp,
    ) -> ConsensusResult<()> {
        let expiry = ctx.term_expiry.ok_or_else(|| {
            ConsensusError::Timing("no term expiry known for the term change".to_string())
        })?;
        if block_time < expiry {
            return Err(ConsensusError::Timing(format!(
                "term {} does not expire before {expiry}, block time is {block_time}",
                ctx.current_term_number
            )));
        }
        Ok(())
    }

    /// A proposed round carries only the schedule and term counters. Every
    /// per-slot consensus field starts empty; a proposer that pre-fills one
    /// is forging another miner's state.
    fn check_pristine_slots(proposed: &Round) -> ConsensusResult<()> {
        for slot in proposed.miners.values() {
            if slot.out_value.is_some()
                || slot.signature.is_some()
                || slot.previous_in_value.is_some()
                || slot.actual_mining_time.is_some()
            {
                return Err(ConsensusError::Structural(format!(
                    "proposed round pre-fills consensus fields of {}",
                    slot.pubkey
                )));
            }
            if slot.implied_irreversible_block_height != 0 {
                return Err(ConsensusError::Structural(format!(
                    "proposed round pre-seeds an irreversible height for {}",
                    slot.pubkey
                )));
            }
            if slot.produced_tiny_blocks != 0 || slot.final_order_of_next_round != 0 {
                return Err(ConsensusError::Structural(format!(
                    "proposed round pre-seeds slot progress for {}",
                    slot.pubkey
                )));
            }
            if !slot.encrypted_pieces.is_empty()
                || !slot.decrypted_pieces.is_empty()
                || !slot.piece_commitments.is_empty()
            {
                return Err(ConsensusError::Structural(format!(
                    "proposed round pre-fills share pieces of {}",
                    slot.pubkey
                )));
            }
        }
        Ok(())
    }

    /// NextRound carries the per-term counters forward exactly: produced
    /// blocks unchanged, missed slots bumped once for miners that did not
    /// mine. A replacement miner starts from zero.
    fn check_carried_counters(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        for slot in proposed.miners.values() {
            let Some(base_slot) = ctx.base_round.slot(&slot.pubkey) else {
                if slot.produced_blocks != 0 || slot.missed_time_slots != 0 {
                    return Err(ConsensusError::Structural(format!(
                        "incoming miner {} must start with zeroed counters",
                        slot.pubkey
                    )));
                }
                continue;
            };
            let expected_missed =
                base_slot.missed_time_slots + u64::from(!base_slot.is_mined());
            if slot.produced_blocks != base_slot.produced_blocks
                || slot.missed_time_slots != expected_missed
            {
                return Err(ConsensusError::Structural(format!(
                    "proposed round tampers with {}'s term counters",
                    slot.pubkey
                )));
            }
        }
        Ok(())
    }

    /// The first round of a term starts every counter from zero
    fn check_reset_counters(proposed: &Round) -> ConsensusResult<()> {
        for slot in proposed.miners.values() {
            if slot.produced_blocks != 0 || slot.missed_time_slots != 0 {
                return Err(ConsensusError::Structural(format!(
                    "first round of a term must reset {}'s counters",
                    slot.pubkey
                )));
            }
        }
        Ok(())
    }

    /// Within a term the miner set may only change by the single
    /// substitution the election authority sanctioned
    fn check_miner_continuity(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        let base: std::collections::BTreeSet<&Pubkey> = ctx.base_round.miners.keys().collect();
        let next: std::collections::BTreeSet<&Pubkey> = proposed.miners.keys().collect();
        if base == next {
            return Ok(());
        }
        if let Some(replacement) = &ctx.expected_replacement {
            let mut expected = base;
            expected.remove(&replacement.out_pubkey);
            expected.insert(&replacement.in_pubkey);
            if expected == next {
                return Ok(());
            }
        }
        Err(ConsensusError::Structural(
            "proposed round changes the miner set without an authorized replacement".to_string(),
        ))
    }

    /// The proposed extra-block producer and the mined miners' orders must
    /// match what the current round's signatures imply
    fn check_next_round_mining_order(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        let expected = generator::next_extra_block_producer_order(ctx.base_round);
        if proposed.extra_block_producer_order != expected {
            return Err(ConsensusError::Structural(format!(
                "extra block producer order must be {expected}, got {}",
                proposed.extra_block_producer_order
            )));
        }
        let replaced = ctx
            .expected_replacement
            .as_ref()
            .map(|r| r.out_pubkey);
        for slot in ctx.base_round.miners.values() {
            if !slot.is_mined() {
                continue;
            }
            if replaced == Some(slot.pubkey) {
                continue;
            }
            match proposed.slot(&slot.pubkey) {
                Some(next_slot) if next_slot.order == slot.final_order_of_next_round => {}
                Some(next_slot) => {
                    return Err(ConsensusError::Structural(format!(
                        "miner {} earned order {} but is proposed at {}",
                        slot.pubkey, slot.final_order_of_next_round, next_slot.order
                    )));
                }
                // Absent from the next round: legal only at term boundaries,
                // which do not run this check
                None => {
                    return Err(ConsensusError::Structural(format!(
                        "miner {} missing from the proposed round",
                        slot.pubkey
                    )));
                }
            }
        }
        Ok(())
    }

    /// LIB fields of a proposed round may never regress and must stay
    /// plausible against the chain height. Applies identically to NextRound
    /// and NextTerm; comparison is against the pre-transition stored round.
    fn check_lib_bounds(ctx: &ValidationContext<'_>, proposed: &Round) -> ConsensusResult<()> {
        let stored_height = ctx.base_round.confirmed_irreversible_block_height;
        let stored_round = ctx.base_round.confirmed_irreversible_block_round_number;

        if proposed.confirmed_irreversible_block_height < stored_height {
            return Err(ConsensusError::Bounds(format!(
                "confirmed irreversible height regressed from {stored_height} to {}",
                proposed.confirmed_irreversible_block_height
            )));
        }
        if proposed.confirmed_irreversible_block_height > ctx.chain_height {
            return Err(ConsensusError::Bounds(format!(
                "confirmed irreversible height {} exceeds chain height {}",
                proposed.confirmed_irreversible_block_height, ctx.chain_height
            )));
        }
        if proposed.confirmed_irreversible_block_round_number < stored_round {
            return Err(ConsensusError::Bounds(format!(
                "confirmed irreversible round regressed from {stored_round} to {}",
                proposed.confirmed_irreversible_block_round_number
            )));
        }
        if proposed.confirmed_irreversible_block_round_number > proposed.round_number {
            return Err(ConsensusError::Bounds(format!(
                "confirmed irreversible round {} is beyond the proposed round {}",
                proposed.confirmed_irreversible_block_round_number, proposed.round_number
            )));
        }
        Ok(())
    }

    /// One miner's LIB self-report inside an UpdateValue. Fresh rounds start
    /// each slot's report at zero, so the baseline also folds in the miner's
    /// report from the previous round to keep the value monotone across
    /// round boundaries.
    fn check_lib_report(
        ctx: &ValidationContext<'_>,
        sender: &Pubkey,
        reported: BlockHeight,
    ) -> ConsensusResult<()> {
        let stored = ctx
            .base_round
            .slot(sender)
            .map(|s| s.implied_irreversible_block_height)
            .unwrap_or(0);
        let carried = ctx
            .previous_round
            .and_then(|r| r.slot(sender))
            .map(|s| s.implied_irreversible_block_height)
            .unwrap_or(0);
        lib_height::validate_report(stored.max(carried), reported, ctx.chain_height, ctx.config)
    }

    /// NextTerm may only install the miner set the election authority
    /// reports, compared as unordered sets
    fn check_miner_set_authority(
        ctx: &ValidationContext<'_>,
        proposed: &Round,
    ) -> ConsensusResult<()> {
        let expected = ctx.expected_term_miners.as_ref().ok_or_else(|| {
            ConsensusError::Authorization(
                "no authoritative miner set available for the term change".to_string(),
            )
        })?;
        let mut expected_sorted: Vec<&Pubkey> = expected.iter().collect();
        expected_sorted.sort();
        expected_sorted.dedup();
        let proposed_set: Vec<&Pubkey> = proposed.miners.keys().collect();
        if expected_sorted != proposed_set {
            return Err(ConsensusError::Authorization(
                "proposed miner set does not match the election victories".to_string(),
            ));
        }
        Ok(())
    }

    /// Value consistency for UpdateValue: commitments present, reveals
    /// correct, first write wins
    fn check_update_value(
        ctx: &ValidationContext<'_>,
        sender: &Pubkey,
        input: &UpdateValueInput,
    ) -> ConsensusResult<()> {
        let out_value = input.out_value.ok_or_else(|| {
            ConsensusError::Structural("UpdateValue without an out-value".to_string())
        })?;
        if input.signature.is_none() {
            return Err(ConsensusError::Structural(
                "UpdateValue without a signature".to_string(),
            ));
        }

        let base_slot = ctx
            .base_round
            .slot(sender)
            .ok_or_else(|| ConsensusError::Authorization(format!("{sender} is not a miner")))?;

        // First write wins on the published commitment
        if let Some(existing) = base_slot.out_value {
            if existing != out_value {
                return Err(ConsensusError::Structural(format!(
                    "{sender} already committed an out-value this round"
                )));
            }
        }

        if input.supplied_order_of_next_round == 0
            || input.supplied_order_of_next_round > ctx.base_round.miner_count() as u32
        {
            return Err(ConsensusError::Structural(format!(
                "next-round order {} outside 1..={}",
                input.supplied_order_of_next_round,
                ctx.base_round.miner_count()
            )));
        }
        // An order another miner already earned this round would make the
        // round unterminable
        for slot in ctx.base_round.miners.values() {
            if slot.pubkey != *sender
                && slot.is_mined()
                && slot.final_order_of_next_round == input.supplied_order_of_next_round
            {
                return Err(ConsensusError::Structural(format!(
                    "next-round order {} already claimed by {}",
                    input.supplied_order_of_next_round, slot.pubkey
                )));
            }
        }

        // The reveal must prove last round's commitment of the same miner
        if let Some(previous_in_value) = input.previous_in_value {
            if let Some(existing) = base_slot.previous_in_value {
                if existing != previous_in_value {
                    return Err(ConsensusError::CryptographicMismatch(format!(
                        "{sender} attempted to overwrite its previous in-value"
                    )));
                }
            }
            if let Some(previous_round) = ctx.previous_round {
                if let Some(previous_out) = previous_round.slot(sender).and_then(|s| s.out_value) {
                    if secret::out_value_for(&previous_in_value) != previous_out {
                        return Err(ConsensusError::CryptographicMismatch(format!(
                            "previous in-value of {sender} does not hash to last round's out-value"
                        )));
                    }
                }
            }
        }

        // Reconstructed reveals for absent miners must also prove the
        // absent miner's own commitment
        for (miner, revealed) in &input.miners_previous_in_values {
            let previous_out = ctx
                .previous_round
                .and_then(|r| r.slot(miner))
                .and_then(|s| s.out_value);
            match previous_out {
                Some(out) if secret::out_value_for(revealed) == out => {}
                Some(_) => {
                    return Err(ConsensusError::CryptographicMismatch(format!(
                        "revealed in-value for {miner} does not hash to its out-value"
                    )));
                }
                None => {
                    return Err(ConsensusError::Structural(format!(
                        "revealed in-value for {miner} who never committed"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Convenience wrapper used by tests and external callers that only hold the
/// round pair
pub fn validate_header(
    ctx: &ValidationContext<'_>,
    header: &ConsensusHeader,
) -> ConsensusResult<()> {
    TransitionValidator::validate_before_execution(ctx, header)
}

/// Declared-hash helper for proposers
pub fn declared_hash_for(round: &Round) -> ConsensusResult<Hash> {
    Ok(round.hash()?)
}
