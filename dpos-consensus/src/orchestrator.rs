//! The consensus engine facade
//!
//! Ties the clock, generator, validator, secret-share bookkeeping and LIB
//! aggregation together over a round store. Every header goes through the
//! same path: validate against the stored pre-transition state, apply to an
//! in-memory staging copy, check the staged result against the declared
//! round hash, and only then write. A failure anywhere leaves the store
//! untouched.

use crate::collaborators::{ElectionService, TermConfigService, TreasuryService};
use crate::validation::{TransitionValidator, ValidationContext};
use crate::{clock, generator, lib_height, secret, ConsensusConfig, ConsensusError, ConsensusResult};
use dpos_core::{
    ConsensusBehaviour, ConsensusHeader, ConsensusPayload, Pubkey, Round, RoundNumber,
    TinyBlockInput, Timestamp, UpdateValueInput,
};
use dpos_db::RoundStore;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What a miner should do next, and when
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusCommand {
    pub behaviour: ConsensusBehaviour,
    /// The timestamp the action is scheduled for
    pub arranged_mining_time: Timestamp,
}

/// The engine: round state machine over a store plus external collaborators
pub struct ConsensusOrchestrator {
    config: ConsensusConfig,
    store: RoundStore,
    genesis_time: Timestamp,
    election: Box<dyn ElectionService>,
    term_config: Box<dyn TermConfigService>,
    treasury: Box<dyn TreasuryService>,
}

impl ConsensusOrchestrator {
    pub fn new(
        config: ConsensusConfig,
        store: RoundStore,
        genesis_time: Timestamp,
        election: Box<dyn ElectionService>,
        term_config: Box<dyn TermConfigService>,
        treasury: Box<dyn TreasuryService>,
    ) -> ConsensusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            genesis_time,
            election,
            term_config,
            treasury,
        })
    }

    /// Write the genesis round for the initial miner list. Round and term
    /// cursors move to 1; fails if the store already holds a round.
    pub fn initialize(&self, initial_miners: &[Pubkey]) -> ConsensusResult<()> {
        if self.store.current_round_number()? != 0 {
            return Err(ConsensusError::Structural(
                "store already holds consensus state".to_string(),
            ));
        }
        let genesis = generator::generate_genesis_round(
            initial_miners,
            self.genesis_time,
            &self.config,
        )?;
        self.store.put(&genesis)?;
        self.store.advance_round_number(1)?;
        self.store.advance_term_number(1)?;
        self.store.set_term_start_time(1, self.genesis_time)?;
        info!(miners = initial_miners.len(), "consensus initialized");
        Ok(())
    }

    /// The round the cursor points at
    pub fn current_round(&self) -> ConsensusResult<Round> {
        Ok(self.store.current_round()?)
    }

    /// The current round's miner list in mining order
    pub fn current_miner_list(&self) -> ConsensusResult<Vec<Pubkey>> {
        Ok(self.current_round()?.miner_list())
    }

    /// Fetch a historical round snapshot
    pub fn round(&self, number: RoundNumber) -> ConsensusResult<Option<Round>> {
        Ok(self.store.get(number)?)
    }

    /// The round as it will stand after applying this update. Proposers hash
    /// the result to fill `declared_round_hash`.
    pub fn stage_update_value(
        &self,
        sender: &Pubkey,
        input: &UpdateValueInput,
    ) -> ConsensusResult<Round> {
        let mut staged = self.current_round()?;
        self.apply_update_value(&mut staged, sender, input)?;
        Ok(staged)
    }

    /// The round as it will stand after this tiny block
    pub fn stage_tiny_block(
        &self,
        sender: &Pubkey,
        input: &TinyBlockInput,
    ) -> ConsensusResult<Round> {
        let mut staged = self.current_round()?;
        Self::apply_tiny_block(&mut staged, sender, input)?;
        Ok(staged)
    }

    /// Validate a header against stored state without applying it
    pub fn validate_before_execution(&self, header: &ConsensusHeader) -> ConsensusResult<()> {
        let base = self.current_round()?;
        let previous = self.previous_round(&base)?;
        let ctx = self.context(&base, previous.as_ref(), header)?;
        TransitionValidator::validate_before_execution(&ctx, header)
    }

    /// Post-execution consistency of the stored current round against the
    /// header that produced it. Pure comparison, safe to repeat.
    pub fn validate_after_execution(&self, header: &ConsensusHeader) -> ConsensusResult<()> {
        TransitionValidator::validate_after_execution(&self.current_round()?, header)
    }

    /// The continuous-block allowance for one slot
    pub fn maximum_blocks_count(&self) -> u64 {
        self.config.tiny_blocks_limit
    }

    /// Validate and apply a header, returning the committed round. State
    /// changes only if the staged result hashes to what the header declared.
    pub fn process(&self, header: &ConsensusHeader) -> ConsensusResult<Round> {
        let base = self.current_round()?;
        let previous = self.previous_round(&base)?;
        {
            let ctx = self.context(&base, previous.as_ref(), header)?;
            TransitionValidator::validate_before_execution(&ctx, header)?;
        }

        let committed = match &header.payload {
            ConsensusPayload::UpdateValue(input) => {
                let mut staged = base;
                self.apply_update_value(&mut staged, &header.sender, input)?;
                TransitionValidator::validate_after_execution(&staged, header)?;
                self.store.update(&staged)?;
                staged
            }
            ConsensusPayload::TinyBlock(input) => {
                let mut staged = base;
                Self::apply_tiny_block(&mut staged, &header.sender, input)?;
                TransitionValidator::validate_after_execution(&staged, header)?;
                self.store.update(&staged)?;
                staged
            }
            ConsensusPayload::NextRound(proposed) => {
                TransitionValidator::validate_after_execution(proposed, header)?;
                self.commit_reveals(base)?;
                self.store.put(proposed)?;
                self.store.advance_round_number(proposed.round_number)?;
                proposed.clone()
            }
            ConsensusPayload::NextTerm(proposed) => {
                TransitionValidator::validate_after_execution(proposed, header)?;
                let ending_term = base.term_number;
                let mined_blocks: BTreeMap<Pubkey, u64> = base
                    .miners
                    .values()
                    .map(|s| (s.pubkey, s.produced_blocks))
                    .collect();
                self.commit_reveals(base)?;
                self.store.put(proposed)?;
                self.store.advance_round_number(proposed.round_number)?;
                self.store.advance_term_number(proposed.term_number)?;
                self.store
                    .set_term_start_time(proposed.term_number, header.block_time)?;
                if let Err(e) = self.treasury.release(ending_term, &mined_blocks) {
                    warn!(term = ending_term, error = %e, "treasury release failed");
                }
                proposed.clone()
            }
        };

        debug!(
            behaviour = %header.behaviour(),
            sender = %header.sender,
            "header applied"
        );
        Ok(committed)
    }

    /// What should `pubkey` do at `now`? `None` while it is not this miner's
    /// turn to act.
    pub fn get_consensus_command(
        &self,
        pubkey: &Pubkey,
        now: Timestamp,
    ) -> ConsensusResult<Option<ConsensusCommand>> {
        let round = self.current_round()?;
        let slot = match round.slot(pubkey) {
            Some(slot) => slot,
            None => return Ok(None),
        };

        let end = clock::expected_end_time(&round, &self.config)?;
        if now >= end {
            let behaviour = if self.term_expired(round.term_number, now)? {
                ConsensusBehaviour::NextTerm
            } else {
                ConsensusBehaviour::NextRound
            };
            return Ok(Some(ConsensusCommand {
                behaviour,
                arranged_mining_time: now,
            }));
        }

        if clock::in_time_slot(&round, pubkey, now, &self.config)? {
            let behaviour = if slot.out_value.is_none() {
                ConsensusBehaviour::UpdateValue
            } else if slot.produced_tiny_blocks < self.config.tiny_blocks_limit {
                ConsensusBehaviour::TinyBlock
            } else {
                return Ok(None);
            };
            return Ok(Some(ConsensusCommand {
                behaviour,
                arranged_mining_time: clock::arranged_mining_time(&round, pubkey)?,
            }));
        }

        Ok(None)
    }

    /// Build the round N+1 proposal a miner would attach to a `NextRound`
    /// header, including any sanctioned miner replacement
    pub fn propose_next_round(&self, block_time: Timestamp) -> ConsensusResult<Round> {
        let current = self.current_round()?;
        let mut proposed =
            generator::generate_next_round(&current, block_time, self.genesis_time, &self.config)?;
        if let Some(replacement) = self.sanctioned_replacement(&current) {
            generator::apply_miner_replacement(
                &mut proposed,
                &replacement.out_pubkey,
                replacement.in_pubkey,
            )?;
        }
        Ok(proposed)
    }

    /// Build the first-round proposal of the next term from the election
    /// victories
    pub fn propose_next_term(&self, block_time: Timestamp) -> ConsensusResult<Round> {
        let current = self.current_round()?;
        let miners = self.elected_miners(&current);
        generator::generate_first_round_of_term(
            &current,
            &miners,
            block_time,
            self.genesis_time,
            self.store.current_term_number()? + 1,
            &self.config,
        )
    }

    fn previous_round(&self, base: &Round) -> ConsensusResult<Option<Round>> {
        if base.round_number <= 1 {
            return Ok(None);
        }
        Ok(self.store.get(base.round_number - 1)?)
    }

    fn context<'a>(
        &'a self,
        base: &'a Round,
        previous: Option<&'a Round>,
        header: &ConsensusHeader,
    ) -> ConsensusResult<ValidationContext<'a>> {
        let expected_term_miners = match header.behaviour() {
            ConsensusBehaviour::NextTerm => Some(self.elected_miners(base)),
            _ => None,
        };
        let expected_replacement = match header.behaviour() {
            ConsensusBehaviour::NextRound => self.sanctioned_replacement(base),
            _ => None,
        };
        let term_expiry = match header.behaviour() {
            ConsensusBehaviour::NextTerm => Some(self.term_expiry(base.term_number)?),
            _ => None,
        };
        Ok(ValidationContext {
            base_round: base,
            previous_round: previous,
            current_term_number: self.store.current_term_number()?,
            chain_height: header.block_height,
            expected_term_miners,
            expected_replacement,
            term_expiry,
            config: &self.config,
        })
    }

    /// The authoritative miner set for the next term. An unavailable or
    /// empty election degrades to keeping the current set.
    fn elected_miners(&self, current: &Round) -> Vec<Pubkey> {
        match self.election.get_victories() {
            Ok(victories) if !victories.is_empty() => {
                let cap = self.permitted_miner_count(current);
                victories.into_iter().take(cap).collect()
            }
            Ok(_) => current.miner_list(),
            Err(e) => {
                warn!(error = %e, "election unavailable, keeping current miners");
                current.miner_list()
            }
        }
    }

    /// How many miners the chain admits at this point in its life. The cap
    /// starts at the genesis set size and grows by two per configured
    /// interval, up to the hard maximum.
    fn permitted_miner_count(&self, current: &Round) -> usize {
        let initial = match self.store.get(1) {
            Ok(Some(genesis)) => genesis.miner_count(),
            _ => current.miner_count(),
        };
        let max = self
            .term_config
            .maximum_miners_count()
            .unwrap_or(self.config.maximum_miners_count);
        let interval = self
            .term_config
            .miner_increase_interval_seconds()
            .unwrap_or(self.config.miner_increase_interval_seconds);
        if interval == 0 {
            return max;
        }
        let grown = initial + 2 * (current.blockchain_age / interval) as usize;
        grown.min(max)
    }

    fn sanctioned_replacement(
        &self,
        current: &Round,
    ) -> Option<crate::collaborators::MinerReplacement> {
        match self.election.get_miner_replacement(&current.miner_list()) {
            Ok(replacement) => replacement,
            Err(e) => {
                warn!(error = %e, "election unavailable, no replacement applied");
                None
            }
        }
    }

    fn term_expiry(&self, term: u64) -> ConsensusResult<Timestamp> {
        let start = self
            .store
            .term_start_time(term)?
            .unwrap_or(self.genesis_time);
        let period_seconds = self
            .term_config
            .period_seconds()
            .unwrap_or(self.config.period_seconds);
        Ok(start + period_seconds * 1000)
    }

    fn term_expired(&self, term: u64, now: Timestamp) -> ConsensusResult<bool> {
        Ok(now >= self.term_expiry(term)?)
    }

    /// Merge an `UpdateValue` into the staged round field by field. Every
    /// commitment field is first-write-wins; validation already rejected
    /// conflicting rewrites.
    fn apply_update_value(
        &self,
        staged: &mut Round,
        sender: &Pubkey,
        input: &UpdateValueInput,
    ) -> ConsensusResult<()> {
        {
            let slot = staged
                .slot_mut(sender)
                .ok_or_else(|| ConsensusError::Authorization(format!("{sender} is not a miner")))?;
            if slot.out_value.is_none() {
                slot.out_value = input.out_value;
            }
            if slot.signature.is_none() {
                slot.signature = input.signature;
            }
            if slot.previous_in_value.is_none() {
                slot.previous_in_value = input.previous_in_value;
            }
            slot.actual_mining_time = Some(input.actual_mining_time);
            slot.produced_blocks += 1;
            slot.final_order_of_next_round = input.supplied_order_of_next_round;
            slot.implied_irreversible_block_height = input.implied_irreversible_block_height;
        }

        for (recipient, piece) in &input.encrypted_pieces {
            let commitment = input.piece_commitments.get(recipient).ok_or_else(|| {
                ConsensusError::Structural(format!(
                    "encrypted piece for {recipient} carries no commitment"
                ))
            })?;
            secret::record_encrypted_piece(staged, sender, recipient, piece.clone(), *commitment)?;
        }
        for (dealer, piece) in &input.decrypted_pieces {
            secret::record_decrypted_piece(staged, dealer, sender, piece.clone())?;
        }
        // Reconstructed reveals for absent miners; bindings were checked in
        // validation
        for (miner, revealed) in &input.miners_previous_in_values {
            if let Some(slot) = staged.slot_mut(miner) {
                if slot.previous_in_value.is_none() {
                    slot.previous_in_value = Some(*revealed);
                }
            }
        }

        let previous = lib_height::LibPosition {
            height: staged.confirmed_irreversible_block_height,
            round_number: staged.confirmed_irreversible_block_round_number,
        };
        let lib = lib_height::aggregate(staged, previous);
        if lib != previous {
            info!(height = lib.height, round = lib.round_number, "LIB advanced");
        }
        staged.confirmed_irreversible_block_height = lib.height;
        staged.confirmed_irreversible_block_round_number = lib.round_number;
        Ok(())
    }

    fn apply_tiny_block(
        staged: &mut Round,
        sender: &Pubkey,
        input: &TinyBlockInput,
    ) -> ConsensusResult<()> {
        let slot = staged
            .slot_mut(sender)
            .ok_or_else(|| ConsensusError::Authorization(format!("{sender} is not a miner")))?;
        slot.actual_mining_time = Some(input.actual_mining_time);
        slot.produced_blocks += 1;
        slot.produced_tiny_blocks += 1;
        Ok(())
    }

    /// Before a round closes, reconstruct in-values for miners that
    /// committed but never revealed. A failed reconstruction is discarded;
    /// the round closes without that reveal.
    fn commit_reveals(&self, mut ending: Round) -> ConsensusResult<()> {
        let threshold = lib_height::consent_count(ending.miner_count());
        let pending: Vec<Pubkey> = ending
            .miners
            .values()
            .filter(|s| s.out_value.is_some() && s.in_value.is_none())
            .map(|s| s.pubkey)
            .collect();

        let mut changed = false;
        for miner in pending {
            match secret::reveal(&ending, &miner, threshold) {
                Ok(Some(in_value)) => {
                    if let Some(slot) = ending.slot_mut(&miner) {
                        slot.in_value = Some(in_value);
                        changed = true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(miner = %miner, error = %e, "discarding failed reveal");
                }
            }
        }

        if changed {
            self.store.update(&ending)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordingTreasury, StaticElection, StaticTermConfig};
    use dpos_core::Hash;
    use dpos_db::MemoryBackend;

    fn test_pubkey(n: u8) -> Pubkey {
        Pubkey::new([n; 32])
    }

    fn miners(count: u8) -> Vec<Pubkey> {
        (1..=count).map(test_pubkey).collect()
    }

    fn orchestrator(initial: &[Pubkey]) -> ConsensusOrchestrator {
        let store = RoundStore::new(Box::new(MemoryBackend::new()));
        let engine = ConsensusOrchestrator::new(
            ConsensusConfig::default(),
            store,
            1_000_000,
            Box::new(StaticElection::default()),
            Box::new(StaticTermConfig::default()),
            Box::new(RecordingTreasury::default()),
        )
        .unwrap();
        engine.initialize(initial).unwrap();
        engine
    }

    fn update_value_header(engine: &ConsensusOrchestrator, order: u32) -> ConsensusHeader {
        let round = engine.current_round().unwrap();
        let slot = round.slot_by_order(order).unwrap();
        let sender = slot.pubkey;
        let block_time = slot.expected_mining_time;

        let mut staged = round.clone();
        {
            let s = staged.slot_mut(&sender).unwrap();
            s.out_value = Some(Hash::new([order as u8; 32]));
            s.signature = Some(Hash::new([order as u8 + 50; 32]));
            s.actual_mining_time = Some(block_time);
            s.produced_blocks += 1;
            s.final_order_of_next_round = order;
            s.implied_irreversible_block_height = 0;
        }

        ConsensusHeader {
            sender,
            block_time,
            block_height: 100,
            payload: ConsensusPayload::UpdateValue(UpdateValueInput {
                round_id: round.round_id(),
                out_value: Some(Hash::new([order as u8; 32])),
                signature: Some(Hash::new([order as u8 + 50; 32])),
                supplied_order_of_next_round: order,
                actual_mining_time: block_time,
                implied_irreversible_block_height: 0,
                ..Default::default()
            }),
            declared_round_hash: staged.hash().unwrap(),
        }
    }

    #[test]
    fn test_initialize_writes_genesis() {
        let engine = orchestrator(&miners(3));
        let round = engine.current_round().unwrap();
        assert_eq!(round.round_number, 1);
        assert_eq!(round.term_number, 1);
        assert_eq!(engine.current_miner_list().unwrap().len(), 3);

        // A second initialize must fail
        assert!(engine.initialize(&miners(3)).is_err());
    }

    #[test]
    fn test_update_value_is_applied() {
        let engine = orchestrator(&miners(3));
        let header = update_value_header(&engine, 1);
        engine.process(&header).unwrap();

        let round = engine.current_round().unwrap();
        let slot = round.slot(&header.sender).unwrap();
        assert!(slot.out_value.is_some());
        assert_eq!(slot.produced_blocks, 1);
    }

    #[test]
    fn test_mismatched_declared_hash_rejected() {
        let engine = orchestrator(&miners(3));
        let mut header = update_value_header(&engine, 1);
        header.declared_round_hash = Hash::new([0xAB; 32]);

        assert!(matches!(
            engine.process(&header),
            Err(ConsensusError::Structural(_))
        ));
        // Nothing was written
        let round = engine.current_round().unwrap();
        assert!(round.slot(&header.sender).unwrap().out_value.is_none());
    }

    #[test]
    fn test_next_round_advances_cursor() {
        let engine = orchestrator(&miners(3));
        for order in 1..=3 {
            engine.process(&update_value_header(&engine, order)).unwrap();
        }

        let base = engine.current_round().unwrap();
        let end = clock::expected_end_time(&base, &ConsensusConfig::default()).unwrap();
        let proposed = engine.propose_next_round(end).unwrap();
        let header = ConsensusHeader {
            sender: base.miner_list()[0],
            block_time: end,
            block_height: 100,
            declared_round_hash: proposed.hash().unwrap(),
            payload: ConsensusPayload::NextRound(proposed),
        };
        engine.process(&header).unwrap();

        let round = engine.current_round().unwrap();
        assert_eq!(round.round_number, 2);
        assert_eq!(round.term_number, 1);
    }

    #[test]
    fn test_command_state_machine() {
        let engine = orchestrator(&miners(3));
        let round = engine.current_round().unwrap();
        let first = round.slot_by_order(1).unwrap().pubkey;
        let open = round.slot_by_order(1).unwrap().expected_mining_time;

        // In slot, nothing committed yet
        let command = engine.get_consensus_command(&first, open).unwrap().unwrap();
        assert_eq!(command.behaviour, ConsensusBehaviour::UpdateValue);

        // After committing, the same slot yields tiny blocks
        engine.process(&update_value_header(&engine, 1)).unwrap();
        let command = engine.get_consensus_command(&first, open).unwrap().unwrap();
        assert_eq!(command.behaviour, ConsensusBehaviour::TinyBlock);

        // Before the slot opens there is nothing to do
        assert!(engine
            .get_consensus_command(&first, open - 1000)
            .unwrap()
            .is_none());

        // Past the round end the term is still young, so NextRound
        let end = clock::expected_end_time(&round, &ConsensusConfig::default()).unwrap();
        let command = engine.get_consensus_command(&first, end).unwrap().unwrap();
        assert_eq!(command.behaviour, ConsensusBehaviour::NextRound);

        // A week later the term is over
        let command = engine
            .get_consensus_command(&first, end + 604_800_000)
            .unwrap()
            .unwrap();
        assert_eq!(command.behaviour, ConsensusBehaviour::NextTerm);

        // Strangers get no command
        assert!(engine
            .get_consensus_command(&test_pubkey(99), open)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_secret_reveal_committed_at_round_close() {
        let engine = orchestrator(&miners(4));
        let round = engine.current_round().unwrap();
        let dealer = round.slot_by_order(1).unwrap().pubkey;
        let in_value = secret::reduce_in_value(&Hash::new([7u8; 32]));
        let recipients: Vec<Pubkey> = round
            .miner_list()
            .into_iter()
            .filter(|p| *p != dealer)
            .collect();
        let threshold = lib_height::consent_count(round.miner_count());
        let (encrypted, commitments) = secret::deal(&in_value, &recipients, threshold).unwrap();

        // The dealer commits its out-value and deals encrypted pieces
        let dealer_slot_time = round.slot(&dealer).unwrap().expected_mining_time;
        let input = UpdateValueInput {
            round_id: round.round_id(),
            out_value: Some(secret::out_value_for(&in_value)),
            signature: Some(Hash::new([9u8; 32])),
            supplied_order_of_next_round: round.slot(&dealer).unwrap().order,
            actual_mining_time: dealer_slot_time,
            encrypted_pieces: encrypted.clone(),
            piece_commitments: commitments,
            ..Default::default()
        };
        let staged = engine.stage_update_value(&dealer, &input).unwrap();
        engine
            .process(&ConsensusHeader {
                sender: dealer,
                block_time: dealer_slot_time,
                block_height: 100,
                payload: ConsensusPayload::UpdateValue(input),
                declared_round_hash: staged.hash().unwrap(),
            })
            .unwrap();

        // Each recipient publishes the decrypted piece in its own slot
        for recipient in &recipients {
            let current = engine.current_round().unwrap();
            let slot = current.slot(recipient).unwrap();
            let slot_time = slot.expected_mining_time;
            let input = UpdateValueInput {
                round_id: current.round_id(),
                out_value: Some(Hash::new([slot.order as u8 + 20; 32])),
                signature: Some(Hash::new([slot.order as u8 + 40; 32])),
                supplied_order_of_next_round: slot.order,
                actual_mining_time: slot_time,
                decrypted_pieces: BTreeMap::from([(dealer, encrypted[recipient].clone())]),
                ..Default::default()
            };
            let staged = engine.stage_update_value(recipient, &input).unwrap();
            engine
                .process(&ConsensusHeader {
                    sender: *recipient,
                    block_time: slot_time,
                    block_height: 100,
                    payload: ConsensusPayload::UpdateValue(input),
                    declared_round_hash: staged.hash().unwrap(),
                })
                .unwrap();
        }

        // Closing the round reconstructs the dealer's in-value into the
        // round 1 snapshot
        let base = engine.current_round().unwrap();
        let end = clock::expected_end_time(&base, &ConsensusConfig::default()).unwrap();
        let proposed = engine.propose_next_round(end).unwrap();
        engine
            .process(&ConsensusHeader {
                sender: dealer,
                block_time: end,
                block_height: 100,
                declared_round_hash: proposed.hash().unwrap(),
                payload: ConsensusPayload::NextRound(proposed),
            })
            .unwrap();

        let closed = engine.round(1).unwrap().unwrap();
        assert_eq!(closed.slot(&dealer).unwrap().in_value, Some(in_value));
        assert_eq!(engine.current_round().unwrap().round_number, 2);
    }

    #[test]
    fn test_next_term_transition_releases_treasury() {
        use std::sync::Arc;

        let treasury = Arc::new(RecordingTreasury::default());
        let election =
            StaticElection::with_victories(vec![test_pubkey(1), test_pubkey(5), test_pubkey(6)]);
        let engine = ConsensusOrchestrator::new(
            ConsensusConfig::default(),
            RoundStore::new(Box::new(MemoryBackend::new())),
            1_000_000,
            Box::new(election),
            Box::new(StaticTermConfig::default()),
            Box::new(Arc::clone(&treasury)),
        )
        .unwrap();
        engine.initialize(&miners(3)).unwrap();

        // The default term runs a week from genesis
        let expiry = 1_000_000 + 604_800_000;
        let proposed = engine.propose_next_term(expiry).unwrap();
        engine
            .process(&ConsensusHeader {
                sender: test_pubkey(1),
                block_time: expiry,
                block_height: 100,
                declared_round_hash: proposed.hash().unwrap(),
                payload: ConsensusPayload::NextTerm(proposed),
            })
            .unwrap();

        let round = engine.current_round().unwrap();
        assert_eq!(round.round_number, 2);
        assert_eq!(round.term_number, 2);
        assert!(round.is_miner_list_just_changed);
        assert_eq!(round.miner_list(), vec![test_pubkey(1), test_pubkey(5), test_pubkey(6)]);
        assert_eq!(treasury.released_terms(), vec![1]);
    }

    #[test]
    fn test_premature_next_term_rejected() {
        let engine = orchestrator(&miners(3));
        let base = engine.current_round().unwrap();
        let end = clock::expected_end_time(&base, &ConsensusConfig::default()).unwrap();

        // The round is over but the term has a week left
        let proposed = engine.propose_next_term(end).unwrap();
        let header = ConsensusHeader {
            sender: base.miner_list()[0],
            block_time: end,
            block_height: 100,
            declared_round_hash: proposed.hash().unwrap(),
            payload: ConsensusPayload::NextTerm(proposed),
        };
        assert!(matches!(
            engine.process(&header),
            Err(ConsensusError::Timing(_))
        ));
        assert_eq!(engine.current_round().unwrap().term_number, 1);
    }

    #[test]
    fn test_miner_cap_grows_with_chain_age() {
        let election = StaticElection::with_victories((1..=7).map(test_pubkey).collect());
        let term_config = StaticTermConfig {
            miner_increase_interval_seconds: 100,
            ..Default::default()
        };
        let engine = ConsensusOrchestrator::new(
            ConsensusConfig::default(),
            RoundStore::new(Box::new(MemoryBackend::new())),
            1_000_000,
            Box::new(election),
            Box::new(term_config),
            Box::new(RecordingTreasury::default()),
        )
        .unwrap();
        engine.initialize(&miners(3)).unwrap();

        // At genesis age the cap is the genesis set size
        let proposed = engine.propose_next_term(1_000_000 + 604_800_000).unwrap();
        assert_eq!(proposed.miner_count(), 3);

        // 250 seconds in, two growth intervals have passed
        let next = engine.propose_next_round(1_250_000).unwrap();
        engine
            .process(&ConsensusHeader {
                sender: test_pubkey(1),
                block_time: 1_250_000,
                block_height: 100,
                declared_round_hash: next.hash().unwrap(),
                payload: ConsensusPayload::NextRound(next),
            })
            .unwrap();
        let proposed = engine.propose_next_term(1_000_000 + 604_800_000).unwrap();
        assert_eq!(proposed.miner_count(), 7);
    }

    #[test]
    fn test_tiny_block_increments_counters() {
        let engine = orchestrator(&miners(3));
        engine.process(&update_value_header(&engine, 1)).unwrap();

        let round = engine.current_round().unwrap();
        let sender = round.slot_by_order(1).unwrap().pubkey;
        let slot_time = round.slot_by_order(1).unwrap().expected_mining_time;
        let input = TinyBlockInput {
            round_id: round.round_id(),
            actual_mining_time: slot_time + 500,
            produced_blocks: 2,
        };
        let staged = engine.stage_tiny_block(&sender, &input).unwrap();
        engine
            .process(&ConsensusHeader {
                sender,
                block_time: slot_time + 500,
                block_height: 101,
                payload: ConsensusPayload::TinyBlock(input),
                declared_round_hash: staged.hash().unwrap(),
            })
            .unwrap();

        let slot = engine.current_round().unwrap().slot(&sender).cloned().unwrap();
        assert_eq!(slot.produced_tiny_blocks, 1);
        assert_eq!(slot.produced_blocks, 2);
    }

    #[test]
    fn test_stranger_header_rejected() {
        let engine = orchestrator(&miners(3));
        let mut header = update_value_header(&engine, 1);
        header.sender = test_pubkey(99);
        assert!(matches!(
            engine.process(&header),
            Err(ConsensusError::Authorization(_))
        ));
    }
}
