//! Keyed persistence of round snapshots
//!
//! The store keeps one record per round number plus two singleton cursors:
//! the current round number and the current term number. Both cursors only
//! ever advance by exactly one; round history is append-only. Semantic
//! validation of a transition happens in the consensus crate before anything
//! reaches the store, but the store still refuses out-of-sequence writes so
//! that no caller can bypass the ordering guarantee.

use crate::backend::RoundBackend;
use crate::{DbError, DbResult};
use dpos_core::{Round, RoundNumber, TermNumber};
use tracing::debug;

const CURRENT_ROUND_KEY: &[u8] = b"cursor:round";
const CURRENT_TERM_KEY: &[u8] = b"cursor:term";

fn round_key(number: RoundNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.extend_from_slice(b"r:");
    key.extend_from_slice(&number.to_be_bytes());
    key
}

fn term_start_key(term: TermNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(19);
    key.extend_from_slice(b"term_start:");
    key.extend_from_slice(&term.to_be_bytes());
    key
}

/// Durable round storage with singleton round/term cursors
pub struct RoundStore {
    backend: Box<dyn RoundBackend>,
}

impl RoundStore {
    /// Create a store over the given backend
    pub fn new(backend: Box<dyn RoundBackend>) -> Self {
        Self { backend }
    }

    fn get_cursor(&self, key: &[u8]) -> DbResult<u64> {
        match self.backend.get(key)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| DbError::InvalidData("cursor is not 8 bytes".to_string()))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    fn set_cursor(&self, key: &[u8], value: u64) -> DbResult<()> {
        self.backend.put(key, &value.to_be_bytes())
    }

    /// Current round number; 0 before genesis
    pub fn current_round_number(&self) -> DbResult<RoundNumber> {
        self.get_cursor(CURRENT_ROUND_KEY)
    }

    /// Current term number; 0 before genesis
    pub fn current_term_number(&self) -> DbResult<TermNumber> {
        self.get_cursor(CURRENT_TERM_KEY)
    }

    /// Fetch a round snapshot by number
    pub fn get(&self, number: RoundNumber) -> DbResult<Option<Round>> {
        match self.backend.get(&round_key(number))? {
            Some(bytes) => {
                let (round, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                Ok(Some(round))
            }
            None => Ok(None),
        }
    }

    /// Fetch the round the cursor points at
    pub fn current_round(&self) -> DbResult<Round> {
        let number = self.current_round_number()?;
        self.get(number)?.ok_or(DbError::RoundNotFound(number))
    }

    /// Append a new round. The round number must be the next unused key and
    /// its term number must match the stored term (or the stored term plus
    /// one, when a term transition is committing in the same transaction).
    pub fn put(&self, round: &Round) -> DbResult<()> {
        let current = self.current_round_number()?;
        if round.round_number != current + 1 {
            return Err(DbError::AppendViolation(format!(
                "round {} is not the next key after {current}",
                round.round_number
            )));
        }
        if self.backend.exists(&round_key(round.round_number))? {
            return Err(DbError::AppendViolation(format!(
                "round {} already written",
                round.round_number
            )));
        }
        let current_term = self.current_term_number()?;
        if round.term_number != current_term && round.term_number != current_term + 1 {
            return Err(DbError::AppendViolation(format!(
                "round {} carries term {} but stored term is {current_term}",
                round.round_number, round.term_number
            )));
        }
        let encoded = bincode::encode_to_vec(round, bincode::config::standard())?;
        self.backend.put(&round_key(round.round_number), &encoded)?;
        debug!(round = round.round_number, term = round.term_number, "round appended");
        Ok(())
    }

    /// Overwrite an existing round record, used by in-round updates that
    /// mutate the current round field by field
    pub fn update(&self, round: &Round) -> DbResult<()> {
        if !self.backend.exists(&round_key(round.round_number))? {
            return Err(DbError::RoundNotFound(round.round_number));
        }
        let encoded = bincode::encode_to_vec(round, bincode::config::standard())?;
        self.backend.put(&round_key(round.round_number), &encoded)?;
        debug!(round = round.round_number, "round updated");
        Ok(())
    }

    /// Advance the round cursor; `n` must be exactly current + 1
    /// (1 at genesis)
    pub fn advance_round_number(&self, n: RoundNumber) -> DbResult<()> {
        let current = self.current_round_number()?;
        if n != current + 1 {
            return Err(DbError::CursorViolation(format!(
                "round cursor {current} cannot advance to {n}"
            )));
        }
        self.set_cursor(CURRENT_ROUND_KEY, n)
    }

    /// Advance the term cursor; `n` must be exactly current + 1
    /// (1 at genesis). Called on every term-changing transition; advancing
    /// the round cursor is never a substitute.
    pub fn advance_term_number(&self, n: TermNumber) -> DbResult<()> {
        let current = self.current_term_number()?;
        if n != current + 1 {
            return Err(DbError::CursorViolation(format!(
                "term cursor {current} cannot advance to {n}"
            )));
        }
        self.set_cursor(CURRENT_TERM_KEY, n)
    }

    /// Record the timestamp at which a term began. Write-once per term.
    pub fn set_term_start_time(&self, term: TermNumber, timestamp: u64) -> DbResult<()> {
        let key = term_start_key(term);
        if self.backend.exists(&key)? {
            return Err(DbError::AppendViolation(format!(
                "start time of term {term} already recorded"
            )));
        }
        self.backend.put(&key, &timestamp.to_be_bytes())
    }

    /// The recorded start timestamp of a term, if any
    pub fn term_start_time(&self, term: TermNumber) -> DbResult<Option<u64>> {
        match self.backend.get(&term_start_key(term))? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    DbError::InvalidData("term start time is not 8 bytes".to_string())
                })?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use dpos_core::{MinerSlot, Pubkey};

    fn test_round(number: u64, term: u64) -> Round {
        let mut round = Round::new(number, term);
        let pubkey = Pubkey::new([1u8; 32]);
        round.miners.insert(pubkey, MinerSlot::new(pubkey, 1, 4000));
        round
    }

    fn test_store() -> RoundStore {
        RoundStore::new(Box::new(MemoryBackend::new()))
    }

    #[test]
    fn test_genesis_sequence() {
        let store = test_store();
        assert_eq!(store.current_round_number().unwrap(), 0);
        assert_eq!(store.current_term_number().unwrap(), 0);

        store.put(&test_round(1, 1)).unwrap();
        store.advance_round_number(1).unwrap();
        store.advance_term_number(1).unwrap();

        assert_eq!(store.current_round_number().unwrap(), 1);
        assert_eq!(store.current_round().unwrap().round_number, 1);
    }

    #[test]
    fn test_put_rejects_gap() {
        let store = test_store();
        store.put(&test_round(1, 1)).unwrap();
        store.advance_round_number(1).unwrap();
        store.advance_term_number(1).unwrap();

        // Skipping round 2 must fail
        assert!(matches!(
            store.put(&test_round(3, 1)),
            Err(DbError::AppendViolation(_))
        ));
    }

    #[test]
    fn test_put_rejects_foreign_term() {
        let store = test_store();
        store.put(&test_round(1, 1)).unwrap();
        store.advance_round_number(1).unwrap();
        store.advance_term_number(1).unwrap();

        // Term 5 while the cursor says 1
        assert!(matches!(
            store.put(&test_round(2, 5)),
            Err(DbError::AppendViolation(_))
        ));
        // Term 2 is fine: a NextTerm committing
        store.put(&test_round(2, 2)).unwrap();
    }

    #[test]
    fn test_cursor_advance_strictness() {
        let store = test_store();
        assert!(store.advance_round_number(2).is_err());
        assert!(store.advance_term_number(0).is_err());
        store.put(&test_round(1, 1)).unwrap();
        store.advance_round_number(1).unwrap();
        assert!(store.advance_round_number(3).is_err());
        assert!(store.advance_round_number(1).is_err());
    }

    #[test]
    fn test_term_start_time_write_once() {
        let store = test_store();
        assert_eq!(store.term_start_time(1).unwrap(), None);
        store.set_term_start_time(1, 1_000_000).unwrap();
        assert_eq!(store.term_start_time(1).unwrap(), Some(1_000_000));
        assert!(matches!(
            store.set_term_start_time(1, 2_000_000),
            Err(DbError::AppendViolation(_))
        ));
    }

    #[test]
    fn test_update_requires_existing() {
        let store = test_store();
        assert!(matches!(
            store.update(&test_round(1, 1)),
            Err(DbError::RoundNotFound(1))
        ));

        store.put(&test_round(1, 1)).unwrap();
        store.advance_round_number(1).unwrap();

        let mut round = store.get(1).unwrap().unwrap();
        round.blockchain_age = 42;
        store.update(&round).unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().blockchain_age, 42);
    }
}
