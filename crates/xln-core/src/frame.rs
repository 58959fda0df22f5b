//! Frame types: the bilateral [`AccountFrame`], the BFT [`EntityFrame`] and
//! the cooperative settlement proof pair.
//!
//! Frame ids and signature digests are keccak256 over the canonical bincode
//! serialization of a borrow-struct holding exactly the committed fields, in
//! declaration order. Signatures are never part of the hashed body.

use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::tx::{AccountTx, EntityTx};
use crate::types::{EntityId, Height, StateHash, Timestamp, TokenId};

// ── AccountFrame ─────────────────────────────────────────────────────────────

/// An ordered batch of account transactions committed at one bilateral height.
/// `token_ids` and `deltas` are parallel vectors sorted by token id and carry
/// the post-frame state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFrame {
    pub height: Height,
    pub timestamp: Timestamp,
    pub txs: Vec<AccountTx>,
    pub prev_frame_hash: StateHash,
    pub state_hash: StateHash,
    pub token_ids: Vec<TokenId>,
    pub deltas: Vec<Delta>,
}

/// The fields committed by an account frame's `state_hash`.
/// Excludes `state_hash` itself, `timestamp` and `txs`: two parties agree on
/// the resulting state, not on the local bookkeeping that produced it.
#[derive(Serialize)]
pub struct AccountFrameBody<'a> {
    pub token_ids: &'a [TokenId],
    pub deltas: &'a [Delta],
    pub prev_frame_hash: &'a StateHash,
    pub height: Height,
}

impl AccountFrame {
    pub fn body(&self) -> AccountFrameBody<'_> {
        AccountFrameBody {
            token_ids: &self.token_ids,
            deltas: &self.deltas,
            prev_frame_hash: &self.prev_frame_hash,
            height: self.height,
        }
    }

    /// Canonical body bytes (bincode).
    pub fn body_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.body()).expect("frame body serialization is infallible")
    }
}

// ── EntityFrame ──────────────────────────────────────────────────────────────

/// A proposed or committed batch of entity transactions at one entity height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFrame {
    pub entity_id: EntityId,
    pub height: Height,
    pub timestamp: Timestamp,
    pub txs: Vec<EntityTx>,
    pub prev_state_hash: StateHash,
    /// Root the proposer obtained by applying `txs`; every validator must
    /// reproduce it exactly.
    pub new_state_root: StateHash,
}

// ── Settlement proofs ────────────────────────────────────────────────────────

/// Header of the cooperative / dispute settlement witness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofHeader {
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    /// Bumped on every cooperative settlement.
    pub cooperative_nonce: u64,
    /// Bumped only on contested closes; independently monotone.
    pub dispute_nonce: u64,
}

/// The settled balance vector accompanying a [`ProofHeader`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBody {
    pub token_ids: Vec<TokenId>,
    pub deltas: Vec<Delta>,
}

impl ProofBody {
    pub fn body_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("proof body serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;

    fn frame(height: Height, offdelta: i128) -> AccountFrame {
        AccountFrame {
            height,
            timestamp: 0,
            txs: vec![],
            prev_frame_hash: StateHash::zero(),
            state_hash: StateHash::zero(),
            token_ids: vec![1],
            deltas: vec![Delta {
                offdelta,
                ..Delta::default()
            }],
        }
    }

    #[test]
    fn body_bytes_ignore_timestamp() {
        let mut a = frame(1, 50);
        let mut b = frame(1, 50);
        a.timestamp = 1_000;
        b.timestamp = 2_000;
        assert_eq!(a.body_bytes(), b.body_bytes());
    }

    #[test]
    fn body_bytes_commit_to_state() {
        assert_ne!(frame(1, 50).body_bytes(), frame(1, 51).body_bytes());
        assert_ne!(frame(1, 50).body_bytes(), frame(2, 50).body_bytes());
    }
}
