//! Cooperative settlement proofs.
//!
//! `(ProofHeader, ProofBody, left_sig, right_sig)` is the witness the
//! on-chain Depository accepts for cooperative closes; the same structure
//! plus a challenge nonce backs dispute proofs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use xln_core::delta::Delta;
use xln_core::frame::{ProofBody, ProofHeader};
use xln_core::types::{AccountKey, EcdsaSignature, Height, StateHash, TokenId};
use xln_crypto::account_digest;

/// Canonical proof header for an account: `from` is always the left entity,
/// so both sides produce an identical signing digest.
pub fn proof_header(key: &AccountKey, cooperative_nonce: u64, dispute_nonce: u64) -> ProofHeader {
    ProofHeader {
        from_entity: key.left,
        to_entity: key.right,
        cooperative_nonce,
        dispute_nonce,
    }
}

/// Proof body snapshot of the delta map, sorted by token id.
pub fn proof_body(deltas: &BTreeMap<TokenId, Delta>) -> ProofBody {
    ProofBody {
        token_ids: deltas.keys().copied().collect(),
        deltas: deltas.values().cloned().collect(),
    }
}

/// The digest both parties sign for a frame of this account.
pub fn signing_digest(
    key: &AccountKey,
    cooperative_nonce: u64,
    dispute_nonce: u64,
    state_hash: &StateHash,
    height: Height,
) -> [u8; 32] {
    let header = proof_header(key, cooperative_nonce, dispute_nonce);
    account_digest(&header, state_hash, height)
}

/// A settlement witness assembled at commit time. Either party may submit it
/// on-chain once both signatures are present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeProof {
    pub header: ProofHeader,
    pub body: ProofBody,
    pub left_sig: Option<EcdsaSignature>,
    pub right_sig: Option<EcdsaSignature>,
}

impl CooperativeProof {
    pub fn is_complete(&self) -> bool {
        self.left_sig.is_some() && self.right_sig.is_some()
    }
}
