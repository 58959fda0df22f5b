use thiserror::Error;

use crate::types::{Height, Nonce, TokenAmount};

/// Every failure in the core is a value of this enum. The groups mirror how
/// callers react: user errors are reported back, protocol errors drop the
/// offending message, adapter errors surface at tick boundaries, and
/// invariant violations abort the whole tick.
#[derive(Debug, Error)]
pub enum XlnError {
    // ── User errors (recoverable, reported back) ─────────────────────────────
    #[error("nonce reused for signer {signer}: last applied {last}, got {got}")]
    NonceReused {
        signer: String,
        last: Nonce,
        got: Nonce,
    },

    #[error("unknown replica: {0}")]
    UnknownReplica(String),

    #[error("capacity exceeded: need {need}, available {available}")]
    CapacityExceeded {
        need: TokenAmount,
        available: TokenAmount,
    },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("threshold not met: need {need}, got {got}")]
    ThresholdNotMet { need: TokenAmount, got: TokenAmount },

    #[error("no account with counterparty {0}")]
    NoSuchAccount(String),

    #[error("no such proposal: {0}")]
    NoSuchProposal(String),

    #[error("signer already voted on proposal {0}")]
    AlreadyVoted(String),

    #[error("entity already imported: {0}")]
    DuplicateEntity(String),

    #[error("insufficient reserves: need {need}, have {have}")]
    InsufficientReserves {
        need: TokenAmount,
        have: TokenAmount,
    },

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("credit limit below current utilization: limit {limit}, used {used}")]
    CreditLimitBelowUtilization {
        limit: TokenAmount,
        used: TokenAmount,
    },

    #[error("allowance plus pending requests exceed collateral")]
    AllowanceExceedsCollateral,

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ── Protocol errors (drop message, continue) ─────────────────────────────
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: Height, got: Height },

    #[error("wrong previous frame hash at height {0}")]
    WrongPrevHash(Height),

    #[error("crossed proposal at height {0}")]
    CrossedProposal(Height),

    #[error("unknown counterparty: {0}")]
    UnknownCounterparty(String),

    #[error("stale message counter: expected {expected}, got {got}")]
    StaleCounter { expected: u64, got: u64 },

    #[error("pending frame already in flight at height {0}")]
    FrameInFlight(Height),

    #[error("withdrawal request not found: {0}")]
    UnknownWithdrawal(u64),

    // ── Adapter errors (surfaced at tick boundary if terminal) ───────────────
    #[error("jurisdiction adapter timeout: {0}")]
    JAdapterTimeout(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    // ── Invariant violations (fatal; tick aborts, shadow env restored) ───────
    #[error("state hash mismatch at height {height}: expected {expected}, got {got}")]
    StateHashMismatch {
        height: Height,
        expected: String,
        got: String,
    },

    #[error("history divergence at height {0}")]
    HistoryDivergence(Height),

    #[error("monotonicity broken: {0}")]
    MonotonicityBroken(String),

    #[error("iteration budget exceeded after {0} iterations")]
    BudgetExceeded(u32),

    #[error("serialization nondeterminism: {0}")]
    SerializationNondeterminism(String),

    // ── Serialization / storage plumbing ─────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl XlnError {
    /// True for errors that must abort the enclosing tick and restore the
    /// shadow env.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XlnError::StateHashMismatch { .. }
                | XlnError::HistoryDivergence(_)
                | XlnError::MonotonicityBroken(_)
                | XlnError::BudgetExceeded(_)
                | XlnError::SerializationNondeterminism(_)
        )
    }
}
