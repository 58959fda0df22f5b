use sha3::{Digest, Keccak256};

use xln_core::constants::{DOMAIN_ACCOUNT, DOMAIN_ENTITY, DOMAIN_FRAME};
use xln_core::frame::ProofHeader;
use xln_core::types::{EntityId, Height, StateHash};

/// Compute keccak256 of arbitrary bytes → 32-byte array.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn keccak_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Account-frame state hash: `keccak256("xln.frame/v1" ‖ body_bytes)`.
pub fn frame_hash(body_bytes: &[u8]) -> StateHash {
    StateHash(keccak_parts(&[DOMAIN_FRAME, body_bytes]))
}

/// Digest signed by both parties of a bilateral account:
/// `keccak256("xln.account/v1" ‖ from ‖ to ‖ coop_nonce ‖ dispute_nonce ‖
/// state_hash ‖ height)`.
pub fn account_digest(header: &ProofHeader, state_hash: &StateHash, height: Height) -> [u8; 32] {
    keccak_parts(&[
        DOMAIN_ACCOUNT,
        header.from_entity.as_bytes(),
        header.to_entity.as_bytes(),
        &header.cooperative_nonce.to_be_bytes(),
        &header.dispute_nonce.to_be_bytes(),
        state_hash.as_bytes(),
        &height.to_be_bytes(),
    ])
}

/// Digest signed by validators when committing an entity frame:
/// `keccak256("xln.entity/v1" ‖ entity_id ‖ height ‖ new_state_root)`.
pub fn entity_digest(entity_id: &EntityId, height: Height, new_state_root: &StateHash) -> [u8; 32] {
    keccak_parts(&[
        DOMAIN_ENTITY,
        entity_id.as_bytes(),
        &height.to_be_bytes(),
        new_state_root.as_bytes(),
    ])
}

/// Hash canonical state bytes into a state root.
pub fn state_root(state_bytes: &[u8]) -> StateHash {
    StateHash(keccak256(state_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_known_vector() {
        // keccak256(""), the canonical empty-input digest.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn domains_separate_digests() {
        let header = ProofHeader {
            from_entity: EntityId::from_bytes([1u8; 32]),
            to_entity: EntityId::from_bytes([2u8; 32]),
            cooperative_nonce: 0,
            dispute_nonce: 0,
        };
        let sh = StateHash([3u8; 32]);
        let acct = account_digest(&header, &sh, 1);
        let entity = entity_digest(&header.from_entity, 1, &sh);
        assert_ne!(acct, entity);
    }

    #[test]
    fn account_digest_commits_to_nonces() {
        let mut header = ProofHeader {
            from_entity: EntityId::from_bytes([1u8; 32]),
            to_entity: EntityId::from_bytes([2u8; 32]),
            cooperative_nonce: 0,
            dispute_nonce: 0,
        };
        let sh = StateHash([3u8; 32]);
        let a = account_digest(&header, &sh, 1);
        header.cooperative_nonce = 1;
        let b = account_digest(&header, &sh, 1);
        assert_ne!(a, b);
    }
}
