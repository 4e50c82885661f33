//! Threshold secret sharing of in-values
//!
//! Each miner splits its in-value into shares over the Ristretto scalar
//! field, one per peer, and publishes a blake3 commitment per share at deal
//! time. A decrypted piece is accepted only if it matches the commitment
//! recorded for the same (dealer, holder) pair, so no single miner can feed
//! corrupted pieces into another miner's reconstruction. A reconstruction is
//! only ever accepted if it hashes back to the dealer's published out-value.
//!
//! Transport encryption of pieces is out of scope here; pieces travel as
//! opaque bytes and the commitments carry the binding.

use crate::{ConsensusError, ConsensusResult};
use curve25519_dalek::scalar::Scalar;
use dpos_core::{hash_bytes, Hash, Pubkey, Round};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One share of a split in-value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePiece {
    /// 1-based share index (the x coordinate)
    pub index: u8,
    /// Scalar value of the share (the y coordinate)
    pub value: [u8; 32],
}

impl SharePiece {
    /// Serialize to opaque bytes: index byte followed by the scalar
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(33);
        bytes.push(self.index);
        bytes.extend_from_slice(&self.value);
        bytes
    }

    /// Parse from opaque bytes
    pub fn from_bytes(bytes: &[u8]) -> ConsensusResult<Self> {
        if bytes.len() != 33 {
            return Err(ConsensusError::Structural(format!(
                "share piece must be 33 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] == 0 {
            return Err(ConsensusError::Structural(
                "share piece index must be nonzero".to_string(),
            ));
        }
        let mut value = [0u8; 32];
        value.copy_from_slice(&bytes[1..]);
        Ok(Self {
            index: bytes[0],
            value,
        })
    }

    /// Commitment binding this piece: hash of index and value
    pub fn commitment(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }
}

/// Reduce an arbitrary 32-byte value into the scalar field so that splitting
/// and reconstruction round-trip exactly. In-values are reduced at creation.
pub fn reduce_in_value(value: &Hash) -> Hash {
    Hash::new(Scalar::from_bytes_mod_order(*value.as_bytes()).to_bytes())
}

/// The out-value commitment for an in-value
pub fn out_value_for(in_value: &Hash) -> Hash {
    hash_bytes(in_value.as_bytes())
}

/// Split an in-value into `total` shares, any `threshold` of which
/// reconstruct it
pub fn split(in_value: &Hash, threshold: usize, total: usize) -> ConsensusResult<Vec<SharePiece>> {
    if threshold == 0 || threshold > total {
        return Err(ConsensusError::Structural(format!(
            "invalid threshold {threshold} for {total} shares"
        )));
    }
    if total > u8::MAX as usize {
        return Err(ConsensusError::Structural(format!(
            "at most {} shares supported, requested {total}",
            u8::MAX
        )));
    }

    let secret = Scalar::from_bytes_mod_order(*in_value.as_bytes());
    if secret.to_bytes() != *in_value.as_bytes() {
        return Err(ConsensusError::Structural(
            "in-value is not reduced into the scalar field".to_string(),
        ));
    }

    let mut coefficients = vec![secret];
    for _ in 1..threshold {
        coefficients.push(Scalar::from_bytes_mod_order(rand::random::<[u8; 32]>()));
    }

    let mut pieces = Vec::with_capacity(total);
    for i in 1..=total {
        let x = Scalar::from(i as u64);
        // Horner evaluation
        let mut y = Scalar::ZERO;
        for coefficient in coefficients.iter().rev() {
            y = y * x + coefficient;
        }
        pieces.push(SharePiece {
            index: i as u8,
            value: y.to_bytes(),
        });
    }
    Ok(pieces)
}

/// Reconstruct the secret from at least `threshold` distinct shares via
/// Lagrange interpolation at zero
pub fn reconstruct(pieces: &[SharePiece], threshold: usize) -> ConsensusResult<Hash> {
    if pieces.len() < threshold {
        return Err(ConsensusError::Structural(format!(
            "{} pieces below threshold {threshold}",
            pieces.len()
        )));
    }
    let selected = &pieces[..threshold];
    for (i, piece) in selected.iter().enumerate() {
        if selected[..i].iter().any(|p| p.index == piece.index) {
            return Err(ConsensusError::Structural(format!(
                "duplicate share index {}",
                piece.index
            )));
        }
    }

    let mut secret = Scalar::ZERO;
    for piece in selected {
        let xi = Scalar::from(piece.index as u64);
        let yi = Scalar::from_bytes_mod_order(piece.value);
        let mut weight = Scalar::ONE;
        for other in selected {
            if other.index == piece.index {
                continue;
            }
            let xj = Scalar::from(other.index as u64);
            weight *= xj * (xj - xi).invert();
        }
        secret += yi * weight;
    }
    Ok(Hash::new(secret.to_bytes()))
}

/// Deal pieces of an in-value to a recipient list: returns per-recipient
/// opaque piece bytes and the matching commitments. Recipient order fixes
/// the share indices.
pub fn deal(
    in_value: &Hash,
    recipients: &[Pubkey],
    threshold: usize,
) -> ConsensusResult<(BTreeMap<Pubkey, Vec<u8>>, BTreeMap<Pubkey, Hash>)> {
    let pieces = split(in_value, threshold, recipients.len())?;
    let mut encrypted = BTreeMap::new();
    let mut commitments = BTreeMap::new();
    for (recipient, piece) in recipients.iter().zip(pieces) {
        commitments.insert(*recipient, piece.commitment());
        encrypted.insert(*recipient, piece.to_bytes());
    }
    Ok((encrypted, commitments))
}

/// Record an encrypted piece dealt by `from` to `to`, with the commitment to
/// its plaintext. Stored in the recipient's slot keyed by the dealer. First
/// write wins: a differing rewrite is rejected.
pub fn record_encrypted_piece(
    round: &mut Round,
    from: &Pubkey,
    to: &Pubkey,
    piece: Vec<u8>,
    commitment: Hash,
) -> ConsensusResult<()> {
    let slot = round
        .slot_mut(to)
        .ok_or_else(|| ConsensusError::Authorization(format!("{to} is not a miner")))?;

    if let Some(existing) = slot.encrypted_pieces.get(from) {
        if existing != &piece {
            return Err(ConsensusError::Structural(format!(
                "encrypted piece from {from} for {to} already recorded"
            )));
        }
        return Ok(());
    }
    slot.encrypted_pieces.insert(*from, piece);
    slot.piece_commitments.insert(*from, commitment);
    Ok(())
}

/// Record the decrypted piece of `from`'s secret published by its holder
/// `to`. Rejected unless it matches the commitment recorded when the
/// encrypted piece arrived for the same (from, to) pair. Accepted pieces
/// collect in the dealer's slot, where reconstruction reads them.
pub fn record_decrypted_piece(
    round: &mut Round,
    from: &Pubkey,
    to: &Pubkey,
    piece: Vec<u8>,
) -> ConsensusResult<()> {
    let commitment = round
        .slot(to)
        .ok_or_else(|| ConsensusError::Authorization(format!("{to} is not a miner")))?
        .piece_commitments
        .get(from)
        .copied()
        .ok_or_else(|| {
            ConsensusError::CryptographicMismatch(format!(
                "no encrypted piece from {from} for {to} to bind against"
            ))
        })?;
    if hash_bytes(&piece) != commitment {
        return Err(ConsensusError::CryptographicMismatch(format!(
            "decrypted piece from {from} published by {to} does not match its commitment"
        )));
    }

    let dealer_slot = round
        .slot_mut(from)
        .ok_or_else(|| ConsensusError::Authorization(format!("{from} is not a miner")))?;
    if let Some(existing) = dealer_slot.decrypted_pieces.get(to) {
        if existing != &piece {
            return Err(ConsensusError::Structural(format!(
                "decrypted piece from {from} published by {to} already recorded"
            )));
        }
        return Ok(());
    }
    dealer_slot.decrypted_pieces.insert(*to, piece);
    Ok(())
}

/// Attempt to reconstruct a miner's in-value from the decrypted pieces held
/// in its slot. Returns `Ok(None)` while fewer than `threshold` valid pieces
/// exist. A reconstruction that does not hash to the miner's published
/// out-value is discarded with an error and must never be committed.
pub fn reveal(
    round: &Round,
    miner: &Pubkey,
    threshold: usize,
) -> ConsensusResult<Option<Hash>> {
    let slot = round
        .slot(miner)
        .ok_or_else(|| ConsensusError::Authorization(format!("{miner} is not a miner")))?;
    let out_value = match slot.out_value {
        Some(v) => v,
        // Nothing committed, nothing to reveal against
        None => return Ok(None),
    };

    let mut pieces = Vec::new();
    for (holder, bytes) in &slot.decrypted_pieces {
        let piece = match SharePiece::from_bytes(bytes) {
            Ok(p) => p,
            Err(_) => {
                warn!(miner = %miner, holder = %holder, "skipping malformed share piece");
                continue;
            }
        };
        // Re-check the binding against the commitment in the holder's slot
        let commitment = round
            .slot(holder)
            .and_then(|s| s.piece_commitments.get(miner));
        match commitment {
            Some(commitment) if &piece.commitment() == commitment => pieces.push(piece),
            _ => warn!(miner = %miner, holder = %holder, "skipping unbound share piece"),
        }
    }

    if pieces.len() < threshold {
        return Ok(None);
    }

    let reconstructed = reconstruct(&pieces, threshold)?;
    if out_value_for(&reconstructed) != out_value {
        return Err(ConsensusError::CryptographicMismatch(format!(
            "reconstructed in-value for {miner} does not hash to its out-value"
        )));
    }
    debug!(miner = %miner, "in-value revealed from {} pieces", pieces.len());
    Ok(Some(reconstructed))
}
