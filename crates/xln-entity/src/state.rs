//! Entity-level replicated state.
//!
//! Everything in [`EntityState`] is consensus-observable: every validator of
//! an entity computes bit-identical state from the committed frame log, and
//! the state root is keccak256 over the canonical bincode serialization.
//! All maps are `BTreeMap` so iteration and encoding order are fixed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use xln_account::machine::AccountMachine;
use xln_core::tx::{Profile, ProposalAction, VoteChoice};
use xln_core::types::{
    EntityId, Height, Nonce, QuorumConfig, SignerId, StateHash, Timestamp, TokenAmount, TokenId,
};
use xln_crypto::state_root;

/// Messages kept in the entity's rolling log.
const MESSAGE_LOG_CAP: usize = 100;

// ── Proposals ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
}

/// A governance proposal with share-weighted voting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: StateHash,
    pub proposer: SignerId,
    pub action: ProposalAction,
    pub votes: BTreeMap<SignerId, VoteChoice>,
    pub status: ProposalStatus,
    pub created: Timestamp,
}

impl Proposal {
    /// Voting weight cast as `choice`.
    pub fn weight_of(&self, choice: VoteChoice, config: &QuorumConfig) -> TokenAmount {
        self.votes
            .iter()
            .filter(|(_, c)| **c == choice)
            .filter_map(|(s, _)| config.shares.get(s))
            .sum()
    }
}

// ── EntityState ──────────────────────────────────────────────────────────────

/// The replicated state of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub height: Height,
    pub timestamp: Timestamp,
    /// Last applied nonce per signer.
    pub nonces: BTreeMap<SignerId, Nonce>,
    /// Rolling human-readable log (capped).
    pub messages: Vec<String>,
    pub proposals: BTreeMap<StateHash, Proposal>,
    /// On-chain reserves per token, maintained from J-events.
    pub reserves: BTreeMap<TokenId, TokenAmount>,
    /// Bilateral account machines keyed by counterparty entity.
    pub accounts: BTreeMap<EntityId, AccountMachine>,
    /// Highest J-block this entity has observed.
    pub j_block: u64,
    pub profile: Profile,
    pub config: QuorumConfig,
}

impl EntityState {
    pub fn new(entity_id: EntityId, config: QuorumConfig) -> Self {
        Self {
            entity_id,
            height: 0,
            timestamp: 0,
            nonces: BTreeMap::new(),
            messages: Vec::new(),
            proposals: BTreeMap::new(),
            reserves: BTreeMap::new(),
            accounts: BTreeMap::new(),
            j_block: 0,
            profile: Profile::default(),
            config,
        }
    }

    /// Canonical state root over the bincode serialization.
    pub fn state_root(&self) -> StateHash {
        let bytes = bincode::serialize(self).expect("entity state serialization is infallible");
        state_root(&bytes)
    }

    /// Last applied nonce for `signer` (0 if none).
    pub fn last_nonce(&self, signer: &SignerId) -> Nonce {
        self.nonces.get(signer).copied().unwrap_or(0)
    }

    /// Append to the rolling message log.
    pub fn log_message(&mut self, msg: impl Into<String>) {
        self.messages.push(msg.into());
        if self.messages.len() > MESSAGE_LOG_CAP {
            let overflow = self.messages.len() - MESSAGE_LOG_CAP;
            self.messages.drain(..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xln_core::types::ConsensusMode;

    fn state() -> EntityState {
        let signer = SignerId::from_bytes([1u8; 20]);
        EntityState::new(EntityId::from_bytes([1u8; 32]), QuorumConfig::single(signer))
    }

    #[test]
    fn state_root_is_deterministic() {
        let a = state();
        let b = state();
        assert_eq!(a.state_root(), b.state_root());
    }

    #[test]
    fn state_root_tracks_mutations() {
        let a = state();
        let mut b = state();
        b.reserves.insert(1, 1_000);
        assert_ne!(a.state_root(), b.state_root());
    }

    #[test]
    fn message_log_is_capped() {
        let mut s = state();
        for i in 0..(MESSAGE_LOG_CAP + 10) {
            s.log_message(format!("m{i}"));
        }
        assert_eq!(s.messages.len(), MESSAGE_LOG_CAP);
        assert_eq!(s.messages.last().unwrap(), &format!("m{}", MESSAGE_LOG_CAP + 9));
    }

    #[test]
    fn proposal_weights_follow_shares() {
        let a = SignerId::from_bytes([1u8; 20]);
        let b = SignerId::from_bytes([2u8; 20]);
        let mut shares = BTreeMap::new();
        shares.insert(a, 3u128);
        shares.insert(b, 1u128);
        let config = QuorumConfig {
            mode: ConsensusMode::ProposerBased,
            threshold: 3,
            validators: vec![a, b],
            shares,
        };
        let mut votes = BTreeMap::new();
        votes.insert(a, VoteChoice::Yes);
        votes.insert(b, VoteChoice::No);
        let p = Proposal {
            id: StateHash::zero(),
            proposer: a,
            action: ProposalAction::SetThreshold { threshold: 2 },
            votes,
            status: ProposalStatus::Pending,
            created: 0,
        };
        assert_eq!(p.weight_of(VoteChoice::Yes, &config), 3);
        assert_eq!(p.weight_of(VoteChoice::No, &config), 1);
    }
}
