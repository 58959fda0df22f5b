use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Token amount in the token's base unit. u128 holds every realistic
/// 18-decimal amount (2^127 ≈ 1.7e38) with room to spare.
pub type TokenAmount = u128;

/// Signed bilateral balance component (ondelta / offdelta / net positions).
pub type SignedAmount = i128;

/// Frame height (runtime, entity and account machines).
pub type Height = u64;

/// Transaction sequence number per signer (monotonically increasing).
pub type Nonce = u64;

/// Unix timestamp (milliseconds, UTC).
pub type Timestamp = i64;

/// Token identifier, unique within a jurisdiction.
pub type TokenId = u32;

// ── EntityId ─────────────────────────────────────────────────────────────────

/// 32-byte entity identifier, unique within a jurisdiction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub [u8; 32]);

impl EntityId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes[..32]);
        Ok(Self(arr))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}…)", &self.to_hex()[..8])
    }
}

// ── SignerId ─────────────────────────────────────────────────────────────────

/// 20-byte signer address: low 20 bytes of keccak256 of the uncompressed
/// secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignerId(pub [u8; 20]);

impl SignerId {
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId(0x{}…)", &self.to_hex()[..8])
    }
}

// ── StateHash ────────────────────────────────────────────────────────────────

/// 32-byte keccak256 digest committing to machine state or a frame body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({}…)", &self.to_hex()[..16])
    }
}

// ── EcdsaSignature ───────────────────────────────────────────────────────────

/// Recoverable secp256k1 ECDSA signature: 64 bytes (r ‖ s) + 1 recovery byte.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaSignature(pub Vec<u8>);

impl EcdsaSignature {
    pub const LEN: usize = 65;
}

impl fmt::Debug for EcdsaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcdsaSignature({}b)", self.0.len())
    }
}

// ── Account orientation ──────────────────────────────────────────────────────

/// Which end of a bilateral account an entity occupies. The entity with the
/// lexicographically smaller id is always `Left`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccountSide {
    Left,
    Right,
}

impl AccountSide {
    pub fn other(self) -> Self {
        match self {
            AccountSide::Left => AccountSide::Right,
            AccountSide::Right => AccountSide::Left,
        }
    }
}

/// Canonical designation of a bilateral account: the ordered entity pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub left: EntityId,
    pub right: EntityId,
}

impl AccountKey {
    /// Build the canonical key for an unordered entity pair.
    pub fn new(a: EntityId, b: EntityId) -> Self {
        if a <= b {
            Self { left: a, right: b }
        } else {
            Self { left: b, right: a }
        }
    }

    /// The side `entity` occupies, or `None` if it is not a party.
    pub fn side_of(&self, entity: &EntityId) -> Option<AccountSide> {
        if *entity == self.left {
            Some(AccountSide::Left)
        } else if *entity == self.right {
            Some(AccountSide::Right)
        } else {
            None
        }
    }

    pub fn counterparty_of(&self, entity: &EntityId) -> Option<EntityId> {
        match self.side_of(entity)? {
            AccountSide::Left => Some(self.right),
            AccountSide::Right => Some(self.left),
        }
    }
}

// ── Quorum configuration ─────────────────────────────────────────────────────

/// How an entity's validators reach agreement on a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMode {
    /// Frames flow through a designated proposer (reference mode).
    ProposerBased,
    /// Propose and signature messages are broadcast to every validator.
    GossipBased,
}

/// The validator set and signing weights of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    pub mode: ConsensusMode,
    /// Minimum total signing weight required to commit a frame.
    pub threshold: TokenAmount,
    /// Validator addresses; index 0 is the designated proposer.
    pub validators: Vec<SignerId>,
    /// Per-validator signing weight.
    pub shares: BTreeMap<SignerId, TokenAmount>,
}

impl QuorumConfig {
    /// Single-signer quorum: one validator holding the full threshold.
    pub fn single(signer: SignerId) -> Self {
        let mut shares = BTreeMap::new();
        shares.insert(signer, 1);
        Self {
            mode: ConsensusMode::ProposerBased,
            threshold: 1,
            validators: vec![signer],
            shares,
        }
    }

    pub fn total_shares(&self) -> TokenAmount {
        self.shares.values().sum()
    }

    pub fn proposer(&self) -> Option<SignerId> {
        self.validators.first().copied()
    }

    pub fn is_validator(&self, signer: &SignerId) -> bool {
        self.shares.contains_key(signer)
    }

    /// True when propose and commit collapse into a single local step.
    pub fn is_single_signer(&self) -> bool {
        self.validators.len() == 1
            && self
                .validators
                .first()
                .and_then(|v| self.shares.get(v))
                .is_some_and(|s| *s >= self.threshold)
    }
}
