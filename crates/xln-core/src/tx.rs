//! Transaction and input sum types for all three machines.
//!
//! Every consensus-observable message is a closed enum with a stable variant
//! order; the canonical wire form is bincode over these declarations, so
//! variant order is part of the protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::frame::{AccountFrame, EntityFrame};
use crate::types::{
    AccountSide, EcdsaSignature, EntityId, Height, Nonce, QuorumConfig, SignerId, StateHash,
    TokenAmount, TokenId,
};

// ── Account transactions ─────────────────────────────────────────────────────

/// Remaining route of a multi-hop payment after the receiving entity.
/// `route[0]` is the next hop; the last element is the final destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardIntent {
    pub route: Vec<EntityId>,
}

/// A state transition of one bilateral account, committed inside an
/// [`AccountFrame`]. The acting side is encoded explicitly so both parties
/// interpret the tx identically in canonical orientation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTx {
    /// Move `amount` of `token_id` from `from` to the other side (offdelta).
    Payment {
        token_id: TokenId,
        amount: TokenAmount,
        from: AccountSide,
        /// Set when the receiver must forward the payment onward.
        forward: Option<ForwardIntent>,
        description: Option<String>,
    },

    /// `side` raises the credit limit it extends to the other party.
    ExtendCredit {
        token_id: TokenId,
        side: AccountSide,
        new_limit: TokenAmount,
    },

    /// `side` reserves `amount` of its collateral share for withdrawal.
    RequestWithdrawal {
        token_id: TokenId,
        amount: TokenAmount,
        side: AccountSide,
        request_id: u64,
    },

    /// Counter-signature finalizing a withdrawal request; collateral drops
    /// once the matching on-chain event is observed.
    AcceptWithdrawal {
        request_id: u64,
        sig: EcdsaSignature,
    },

    /// `side` asks the counterparty to move credit-backed balance into
    /// collateral.
    RequestRebalance {
        token_id: TokenId,
        amount: TokenAmount,
        side: AccountSide,
    },

    /// Produce a cooperative settlement proof for on-chain consumption.
    SettleCooperative { token_ids: Vec<TokenId> },
}

// ── Bilateral consensus messages ─────────────────────────────────────────────

/// A message of the two-party account protocol, carried between entities and
/// committed on the receiving side by BFT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMessage {
    /// Account opening handshake; carries the sender's frame-signing address.
    /// Idempotent: the receiver mirrors the machine and answers with its own
    /// `Open` exactly once.
    Open { signer: SignerId, fee_bps: u32 },

    /// The sender raised the credit limit it extends to the receiver. Like
    /// on-chain events this mutates both sides outside the frame flow; the
    /// framed `AccountTx::ExtendCredit` remains for in-band renegotiation.
    ExtendCredit {
        token_id: TokenId,
        new_limit: TokenAmount,
    },

    /// Proposer sends the next frame with its signature over the account
    /// digest.
    Propose {
        frame: AccountFrame,
        sig: EcdsaSignature,
    },

    /// Acceptor agrees; both sides commit `height`.
    Ack {
        height: Height,
        sig: EcdsaSignature,
    },

    /// Acceptor rejects; proposer rolls the frame back.
    Cancel { height: Height, reason: String },
}

/// Envelope carrying an [`AccountMessage`] across the entity boundary.
/// `counter` is the sender's per-direction send counter, checked monotone by
/// the receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEnvelope {
    pub from: EntityId,
    pub counter: u64,
    pub message: AccountMessage,
}

// ── Entity governance payloads ───────────────────────────────────────────────

/// Executable action of an entity governance proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalAction {
    SetThreshold { threshold: TokenAmount },
    AddValidator { signer: SignerId, shares: TokenAmount },
    RemoveValidator { signer: SignerId },
    UpdateProfile { profile: Profile },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

/// Public profile record, persisted under `profile/<entity_id>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub capabilities: Vec<String>,
    pub hub: bool,
}

// ── J-events ─────────────────────────────────────────────────────────────────

/// Typed on-chain event kinds delivered by the `JEventSource`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JEventKind {
    ReserveCredited,
    CollateralPosted,
    WithdrawalExecuted,
    SettlementApplied,
    DisputeOpened,
}

/// An on-chain event observed by the jurisdiction watcher. Delivery is
/// at-least-once; the runtime deduplicates by `(kind, tx_hash, log_index)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JEvent {
    pub kind: JEventKind,
    pub entity_id: EntityId,
    pub counterparty: Option<EntityId>,
    pub token_id: TokenId,
    pub amount: TokenAmount,
    pub block_number: u64,
    pub tx_hash: [u8; 32],
    pub log_index: u32,
}

impl JEvent {
    /// Deduplication key: at-least-once delivery collapses on this.
    pub fn dedup_key(&self) -> (JEventKind, [u8; 32], u32) {
        (self.kind, self.tx_hash, self.log_index)
    }
}

// ── Entity transactions ──────────────────────────────────────────────────────

/// The operation payload of an [`EntityTx`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityTxKind {
    /// Open (or re-announce) the bilateral account with `target`.
    OpenAccount { target: EntityId, fee_bps: u32 },

    /// Pay `amount` of `token_id` along `route`; `route[0]` must be this
    /// entity and the last element the final recipient.
    DirectPayment {
        token_id: TokenId,
        amount: TokenAmount,
        route: Vec<EntityId>,
        description: Option<String>,
    },

    /// Enqueue account transactions on the machine shared with
    /// `counterparty`.
    AccountTxs {
        counterparty: EntityId,
        txs: Vec<AccountTx>,
    },

    /// An inbound bilateral consensus message, wrapped by the runtime.
    AccountMessage(AccountEnvelope),

    /// Extend `amount` of credit to `counterparty` on `token_id`.
    ExtendCredit {
        counterparty: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    },

    /// Transfer between entity reserves (settled on-chain by the adapter).
    ReserveToReserve {
        target: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    },

    /// Submit a governance proposal.
    Propose { action: ProposalAction },

    /// Vote on an open proposal.
    Vote {
        proposal_id: StateHash,
        choice: VoteChoice,
        comment: Option<String>,
    },

    /// Publish this entity's profile record.
    UpdateProfile { profile: Profile },

    /// An observed on-chain event (injected by the runtime, deduplicated).
    JEvent(JEvent),
}

/// A signed-intent entity transaction. `nonce` must be strictly greater than
/// the signer's last applied nonce; authentication happens at the frame
/// signature layer, not per tx.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTx {
    pub signer_id: SignerId,
    pub nonce: Nonce,
    pub kind: EntityTxKind,
}

impl EntityTx {
    /// Canonical encoding used for deterministic tie-breaks in frame order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("entity tx serialization is infallible")
    }
}

// ── Entity inputs ────────────────────────────────────────────────────────────

/// A message addressed to one entity replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityInputKind {
    /// Add a transaction to the proposer's mempool.
    AddTx(EntityTx),

    /// Proposer broadcasts a frame for validation.
    ProposeFrame {
        frame: EntityFrame,
        sig: EcdsaSignature,
    },

    /// A validator returns its partial signature for `height`.
    SignFrame {
        height: Height,
        signer: SignerId,
        sig: EcdsaSignature,
    },

    /// Proposer announces the committed frame with the aggregate signature.
    CommitFrame { height: Height, hanko: Hanko },

    /// Bilateral message from a counterparty entity.
    AccountMessage(AccountEnvelope),

    /// Deduplicated on-chain event, injected by the runtime; the proposer
    /// wraps it as an entity tx so it gets ordered by consensus.
    JEvent(JEvent),

    /// Ask the proposer for committed frames after `since`.
    SyncRequest { since: Height, requester: SignerId },

    /// Committed frames (with aggregates) answering a `SyncRequest`.
    SyncResponse { frames: Vec<(EntityFrame, Hanko)> },
}

/// Addressed entity input. `signer_id = None` routes to the entity's
/// designated proposer replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInput {
    pub entity_id: EntityId,
    pub signer_id: Option<SignerId>,
    pub kind: EntityInputKind,
}

// ── Hanko ────────────────────────────────────────────────────────────────────

/// Aggregate threshold signature: the serialized signer set, per-signer
/// recoverable signatures, and the quorum they claim to satisfy.
/// Verification is pure recovery + membership + weight summation; there is
/// no trusted setup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hanko {
    pub signers: Vec<SignerId>,
    pub sigs: Vec<(SignerId, EcdsaSignature)>,
    pub threshold: TokenAmount,
    pub shares: BTreeMap<SignerId, TokenAmount>,
}

// ── Runtime inputs ───────────────────────────────────────────────────────────

/// Runtime-level transaction: replica lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeTx {
    /// Insert a new `(entity_id, signer_id)` replica with the given quorum.
    ImportReplica {
        entity_id: EntityId,
        signer_id: SignerId,
        config: QuorumConfig,
    },
}

/// One tick's worth of external input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInput {
    pub runtime_txs: Vec<RuntimeTx>,
    pub entity_inputs: Vec<EntityInput>,
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

/// Result of one applied entity transaction, reported per tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Applied,
    Failed(String),
}

/// References the originating tx by `(entity, signer, nonce)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub nonce: Nonce,
    pub status: OutcomeStatus,
}

impl Outcome {
    pub fn applied(entity_id: EntityId, tx: &EntityTx) -> Self {
        Self {
            entity_id,
            signer_id: tx.signer_id,
            nonce: tx.nonce,
            status: OutcomeStatus::Applied,
        }
    }

    pub fn failed(entity_id: EntityId, tx: &EntityTx, reason: impl Into<String>) -> Self {
        Self {
            entity_id,
            signer_id: tx.signer_id,
            nonce: tx.nonce,
            status: OutcomeStatus::Failed(reason.into()),
        }
    }
}
