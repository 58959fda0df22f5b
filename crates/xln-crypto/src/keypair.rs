use libsecp256k1::{Message, PublicKey, RecoveryId, SecretKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

use xln_core::types::{EcdsaSignature, SignerId};
use xln_core::XlnError;

use crate::hash::keccak256;

/// Derive a signer address from an uncompressed secp256k1 public key:
/// low 20 bytes of keccak256 over the 64-byte point encoding.
pub fn signer_id_from_pubkey(pubkey: &PublicKey) -> SignerId {
    let uncompressed = pubkey.serialize();
    let digest = keccak256(&uncompressed[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    SignerId(addr)
}

/// An XLN keypair: secp256k1 secret + public key with derived signer address.
///
/// The secret key bytes are wiped on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub signer_id: SignerId,
    secret_key: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh keypair from the given randomness source.
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        let sk = SecretKey::random(rng);
        Self::from_secret_key(sk)
    }

    /// Deterministic keypair from a seed: keccak the seed until the digest is
    /// a valid secret scalar. Test fixtures rely on this being stable.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut digest = keccak256(seed);
        loop {
            if let Ok(sk) = SecretKey::parse(&digest) {
                return Self::from_secret_key(sk);
            }
            digest = keccak256(&digest);
        }
    }

    fn from_secret_key(sk: SecretKey) -> Self {
        let pk = PublicKey::from_secret_key(&sk);
        Self {
            signer_id: signer_id_from_pubkey(&pk),
            secret_key: sk.serialize().to_vec(),
        }
    }

    /// Restore a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, XlnError> {
        let sk = SecretKey::parse_slice(bytes).map_err(|_| XlnError::InvalidSignature)?;
        Ok(Self::from_secret_key(sk))
    }

    /// Sign a 32-byte digest; returns the 65-byte recoverable signature
    /// (r ‖ s ‖ recovery_id).
    pub fn sign_digest(&self, digest: &[u8; 32]) -> EcdsaSignature {
        let sk_bytes = Zeroizing::new(self.secret_key.clone());
        let sk = SecretKey::parse_slice(&sk_bytes).expect("stored secret key is valid");
        let (sig, rid) = libsecp256k1::sign(&Message::parse(digest), &sk);
        let mut out = Vec::with_capacity(EcdsaSignature::LEN);
        out.extend_from_slice(&sig.serialize());
        out.push(rid.serialize());
        EcdsaSignature(out)
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.secret_key.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ signer_id: {:?} }}", self.signer_id)
    }
}

/// Recover the signer address from a 65-byte recoverable signature.
pub fn recover_signer(digest: &[u8; 32], sig: &EcdsaSignature) -> Result<SignerId, XlnError> {
    if sig.0.len() != EcdsaSignature::LEN {
        return Err(XlnError::InvalidSignature);
    }
    let mut rs = [0u8; 64];
    rs.copy_from_slice(&sig.0[..64]);
    let signature = Signature::parse_standard(&rs).map_err(|_| XlnError::InvalidSignature)?;
    let rid = RecoveryId::parse(sig.0[64]).map_err(|_| XlnError::InvalidSignature)?;
    let pk = libsecp256k1::recover(&Message::parse(digest), &signature, &rid)
        .map_err(|_| XlnError::InvalidSignature)?;
    Ok(signer_id_from_pubkey(&pk))
}

/// Verify that `sig` over `digest` recovers to `expected`.
pub fn verify_signer(
    digest: &[u8; 32],
    sig: &EcdsaSignature,
    expected: &SignerId,
) -> Result<(), XlnError> {
    let recovered = recover_signer(digest, sig)?;
    if recovered == *expected {
        Ok(())
    } else {
        Err(XlnError::InvalidSignature)
    }
}

// ── Keystore ─────────────────────────────────────────────────────────────────

/// Signing keys available to a runtime, keyed by signer address. Injected
/// into replica steps; never part of consensus-observable state.
#[derive(Clone, Debug, Default)]
pub struct Keystore {
    keys: BTreeMap<SignerId, KeyPair>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kp: KeyPair) -> SignerId {
        let id = kp.signer_id;
        self.keys.insert(id, kp);
        id
    }

    pub fn contains(&self, signer: &SignerId) -> bool {
        self.keys.contains_key(signer)
    }

    /// Sign `digest` with `signer`'s key.
    pub fn sign(&self, signer: &SignerId, digest: &[u8; 32]) -> Result<EcdsaSignature, XlnError> {
        let kp = self
            .keys
            .get(signer)
            .ok_or_else(|| XlnError::UnknownReplica(signer.to_string()))?;
        Ok(kp.sign_digest(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_round_trip() {
        let kp = KeyPair::from_seed(b"validator-1");
        let digest = keccak256(b"hello");
        let sig = kp.sign_digest(&digest);
        assert_eq!(sig.0.len(), EcdsaSignature::LEN);
        assert_eq!(recover_signer(&digest, &sig).unwrap(), kp.signer_id);
    }

    #[test]
    fn tampered_digest_recovers_different_signer() {
        let kp = KeyPair::from_seed(b"validator-1");
        let sig = kp.sign_digest(&keccak256(b"hello"));
        let other = keccak256(b"goodbye");
        assert!(verify_signer(&other, &sig, &kp.signer_id).is_err());
    }

    #[test]
    fn seed_derivation_is_stable() {
        let a = KeyPair::from_seed(b"same-seed");
        let b = KeyPair::from_seed(b"same-seed");
        assert_eq!(a.signer_id, b.signer_id);
        let c = KeyPair::from_seed(b"other-seed");
        assert_ne!(a.signer_id, c.signer_id);
    }

    #[test]
    fn truncated_signature_rejected() {
        let kp = KeyPair::from_seed(b"validator-1");
        let digest = keccak256(b"hello");
        let mut sig = kp.sign_digest(&digest);
        sig.0.truncate(64);
        assert!(recover_signer(&digest, &sig).is_err());
    }

    #[test]
    fn keystore_signs_for_known_signer_only() {
        let mut ks = Keystore::new();
        let id = ks.insert(KeyPair::from_seed(b"validator-1"));
        let digest = keccak256(b"payload");
        assert!(ks.sign(&id, &digest).is_ok());
        let unknown = SignerId::from_bytes([0u8; 20]);
        assert!(ks.sign(&unknown, &digest).is_err());
    }
}
