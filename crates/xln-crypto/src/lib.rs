//! Cryptography primitives for XLN: keccak256 digests with protocol domain
//! tags, recoverable secp256k1 ECDSA keypairs, and Hanko aggregate
//! threshold-signature verification.

pub mod hanko;
pub mod hash;
pub mod keypair;

pub use hanko::{make_hanko, verify_hanko};
pub use hash::{account_digest, entity_digest, frame_hash, keccak256, state_root};
pub use keypair::{recover_signer, verify_signer, KeyPair, Keystore};
