//! Replica-level BFT consensus: ADD_TX → PROPOSE → SIGN → COMMIT.
//!
//! A replica is one signer's view of one entity. The proposer collects
//! transactions, proposes a frame, gathers weighted partial signatures and
//! commits with a Hanko aggregate. Every validator independently re-executes
//! the frame and refuses to sign anything whose state root it cannot
//! reproduce. A single-signer entity collapses the whole exchange into one
//! local step.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use xln_account::machine::TickContext;
use xln_core::frame::EntityFrame;
use xln_core::tx::{
    AccountEnvelope, EntityInputKind, EntityTx, EntityTxKind, Hanko, Outcome,
};
use xln_core::types::{
    ConsensusMode, EcdsaSignature, EntityId, Nonce, QuorumConfig, SignerId, TokenAmount,
};
use xln_core::XlnError;
use xln_crypto::{entity_digest, make_hanko, verify_hanko, verify_signer, Keystore};

use crate::dispatch::{apply_entity_frame, EntityEffect};
use crate::state::EntityState;

// ── Step output ──────────────────────────────────────────────────────────────

/// Everything a replica step produces besides its own mutation.
#[derive(Debug, Default)]
pub struct StepOutput {
    /// Cross-entity / adapter effects (proposer replica only).
    pub effects: Vec<EntityEffect>,
    /// Intra-entity consensus messages, delivered within the same tick.
    pub consensus: Vec<(SignerId, EntityInputKind)>,
    /// Per-tx results for the tick report.
    pub outcomes: Vec<Outcome>,
}

impl StepOutput {
    pub fn merge(&mut self, other: StepOutput) {
        self.effects.extend(other.effects);
        self.consensus.extend(other.consensus);
        self.outcomes.extend(other.outcomes);
    }
}

// ── Replica ──────────────────────────────────────────────────────────────────

/// A frame under consensus: the proposal, the post-state every honest
/// validator reproduces, and the partial signatures collected so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEntityFrame {
    pub frame: EntityFrame,
    pub post_state: EntityState,
    pub sigs: BTreeMap<SignerId, EcdsaSignature>,
}

/// One signer's replica of one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityReplica {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub mempool: Vec<EntityTx>,
    pub state: EntityState,
    pub pending: Option<PendingEntityFrame>,
    /// Committed frames with their aggregates, kept for lagging validators.
    pub committed_log: Vec<(EntityFrame, Hanko)>,
}

impl EntityReplica {
    pub fn new(entity_id: EntityId, signer_id: SignerId, config: QuorumConfig) -> Self {
        Self {
            entity_id,
            signer_id,
            mempool: Vec::new(),
            state: EntityState::new(entity_id, config),
            pending: None,
            committed_log: Vec::new(),
        }
    }

    pub fn is_proposer(&self) -> bool {
        self.state.config.proposer() == Some(self.signer_id)
    }

    fn proposer(&self) -> Result<SignerId, XlnError> {
        self.state
            .config
            .proposer()
            .ok_or_else(|| XlnError::InvalidInput("entity has no validators".into()))
    }

    /// Next unused nonce for `signer`, accounting for queued txs.
    pub fn next_nonce(&self, signer: &SignerId) -> Nonce {
        let queued = self
            .mempool
            .iter()
            .filter(|tx| tx.signer_id == *signer)
            .map(|tx| tx.nonce)
            .max()
            .unwrap_or(0);
        self.state.last_nonce(signer).max(queued) + 1
    }

    /// Mempool admission: reject nonce replays before they reach a frame.
    fn admit_tx(&mut self, tx: EntityTx) -> Result<(), XlnError> {
        let last = self.state.last_nonce(&tx.signer_id);
        if tx.nonce <= last {
            return Err(XlnError::NonceReused {
                signer: tx.signer_id.to_string(),
                last,
                got: tx.nonce,
            });
        }
        if self
            .mempool
            .iter()
            .any(|queued| queued.signer_id == tx.signer_id && queued.nonce == tx.nonce)
        {
            return Err(XlnError::NonceReused {
                signer: tx.signer_id.to_string(),
                last,
                got: tx.nonce,
            });
        }
        self.mempool.push(tx);
        Ok(())
    }

    /// Wrap an inbound bilateral envelope as this replica's own entity tx so
    /// it gets ordered by consensus.
    fn wrap_account_envelope(&mut self, envelope: AccountEnvelope) -> Result<(), XlnError> {
        let tx = EntityTx {
            signer_id: self.signer_id,
            nonce: self.next_nonce(&self.signer_id),
            kind: EntityTxKind::AccountMessage(envelope),
        };
        self.admit_tx(tx)
    }

    fn digest_of(&self, frame: &EntityFrame) -> [u8; 32] {
        entity_digest(&self.entity_id, frame.height, &frame.new_state_root)
    }

    fn weight_of(&self, sigs: &BTreeMap<SignerId, EcdsaSignature>) -> TokenAmount {
        sigs.keys()
            .filter_map(|s| self.state.config.shares.get(s))
            .sum()
    }

    fn other_validators(&self) -> Vec<SignerId> {
        self.state
            .config
            .validators
            .iter()
            .copied()
            .filter(|v| *v != self.signer_id)
            .collect()
    }

    // ── Input handling ───────────────────────────────────────────────────────

    pub fn handle_input(
        &mut self,
        kind: EntityInputKind,
        ctx: &TickContext,
        keystore: &Keystore,
    ) -> Result<StepOutput, XlnError> {
        match kind {
            EntityInputKind::AddTx(tx) => {
                let mut out = StepOutput::default();
                if !self.is_proposer() {
                    // Mempool lives with the proposer.
                    out.consensus
                        .push((self.proposer()?, EntityInputKind::AddTx(tx)));
                    return Ok(out);
                }
                if let Err(err) = self.admit_tx(tx.clone()) {
                    warn!(entity = %self.entity_id, %err, "tx rejected at admission");
                    out.outcomes
                        .push(Outcome::failed(self.entity_id, &tx, err.to_string()));
                }
                Ok(out)
            }

            EntityInputKind::AccountMessage(envelope) => {
                let mut out = StepOutput::default();
                if !self.is_proposer() {
                    out.consensus.push((
                        self.proposer()?,
                        EntityInputKind::AccountMessage(envelope),
                    ));
                    return Ok(out);
                }
                self.wrap_account_envelope(envelope)?;
                Ok(out)
            }

            EntityInputKind::JEvent(event) => {
                let mut out = StepOutput::default();
                if !self.is_proposer() {
                    out.consensus
                        .push((self.proposer()?, EntityInputKind::JEvent(event)));
                    return Ok(out);
                }
                let tx = EntityTx {
                    signer_id: self.signer_id,
                    nonce: self.next_nonce(&self.signer_id),
                    kind: EntityTxKind::JEvent(event),
                };
                self.admit_tx(tx)?;
                Ok(out)
            }

            EntityInputKind::ProposeFrame { frame, sig } => {
                self.handle_propose_frame(frame, sig, ctx, keystore)
            }

            EntityInputKind::SignFrame {
                height,
                signer,
                sig,
            } => self.handle_sign_frame(height, signer, sig, ctx, keystore),

            EntityInputKind::CommitFrame { height, hanko } => {
                self.handle_commit_frame(height, hanko)
            }

            EntityInputKind::SyncRequest { since, requester } => {
                let frames: Vec<(EntityFrame, Hanko)> = self
                    .committed_log
                    .iter()
                    .filter(|(f, _)| f.height > since)
                    .cloned()
                    .collect();
                let mut out = StepOutput::default();
                if !frames.is_empty() {
                    out.consensus
                        .push((requester, EntityInputKind::SyncResponse { frames }));
                }
                Ok(out)
            }

            EntityInputKind::SyncResponse { frames } => {
                self.handle_sync_response(frames, ctx, keystore)
            }
        }
    }

    fn handle_propose_frame(
        &mut self,
        frame: EntityFrame,
        sig: EcdsaSignature,
        ctx: &TickContext,
        keystore: &Keystore,
    ) -> Result<StepOutput, XlnError> {
        let mut out = StepOutput::default();
        let expected = self.state.height + 1;
        if frame.height <= self.state.height {
            return Ok(out); // already committed
        }
        if frame.height != expected {
            // We are behind: catch up from the proposer.
            out.consensus.push((
                self.proposer()?,
                EntityInputKind::SyncRequest {
                    since: self.state.height,
                    requester: self.signer_id,
                },
            ));
            return Ok(out);
        }
        if frame.prev_state_hash != self.state.state_root() {
            return Err(XlnError::StateHashMismatch {
                height: frame.height,
                expected: self.state.state_root().to_hex(),
                got: frame.prev_state_hash.to_hex(),
            });
        }

        // Re-execute the frame; refuse to sign what we cannot reproduce.
        let mut post_state = self.state.clone();
        apply_entity_frame(
            &mut post_state,
            &frame.txs,
            frame.height,
            frame.timestamp,
            ctx,
            keystore,
            false,
        )?;
        let root = post_state.state_root();
        if root != frame.new_state_root {
            return Err(XlnError::StateHashMismatch {
                height: frame.height,
                expected: frame.new_state_root.to_hex(),
                got: root.to_hex(),
            });
        }

        let digest = self.digest_of(&frame);
        verify_signer(&digest, &sig, &self.proposer()?)?;

        let our_sig = keystore.sign(&self.signer_id, &digest)?;
        let mut sigs = BTreeMap::new();
        sigs.insert(self.proposer()?, sig);
        sigs.insert(self.signer_id, our_sig.clone());

        debug!(entity = %self.entity_id, height = frame.height, "frame validated; signing");
        match self.state.config.mode {
            ConsensusMode::ProposerBased => {
                out.consensus.push((
                    self.proposer()?,
                    EntityInputKind::SignFrame {
                        height: frame.height,
                        signer: self.signer_id,
                        sig: our_sig,
                    },
                ));
            }
            ConsensusMode::GossipBased => {
                for v in self.other_validators() {
                    out.consensus.push((
                        v,
                        EntityInputKind::SignFrame {
                            height: frame.height,
                            signer: self.signer_id,
                            sig: our_sig.clone(),
                        },
                    ));
                }
            }
        }
        self.pending = Some(PendingEntityFrame {
            frame,
            post_state,
            sigs,
        });
        Ok(out)
    }

    fn handle_sign_frame(
        &mut self,
        height: u64,
        signer: SignerId,
        sig: EcdsaSignature,
        ctx: &TickContext,
        keystore: &Keystore,
    ) -> Result<StepOutput, XlnError> {
        let mut out = StepOutput::default();
        let Some(pending) = &mut self.pending else {
            return Ok(out); // late partial for an already-settled height
        };
        if pending.frame.height != height {
            return Ok(out);
        }
        if !self.state.config.is_validator(&signer) {
            return Err(XlnError::InvalidSignature);
        }
        let digest = entity_digest(&self.entity_id, height, &pending.frame.new_state_root);
        verify_signer(&digest, &sig, &signer)?;
        pending.sigs.insert(signer, sig);

        let weight = self.weight_of(&self.pending.as_ref().expect("pending held").sigs);
        if weight < self.state.config.threshold {
            return Ok(out);
        }

        // Threshold reached.
        match self.state.config.mode {
            ConsensusMode::ProposerBased => {
                if self.is_proposer() {
                    out.merge(self.commit_pending(ctx, keystore)?);
                }
                // Validators wait for the CommitFrame broadcast.
            }
            ConsensusMode::GossipBased => {
                out.merge(self.commit_pending(ctx, keystore)?);
            }
        }
        Ok(out)
    }

    /// Aggregate, apply and broadcast the pending frame. The applier role
    /// (proposer) emits outputs; everyone else installs silently.
    fn commit_pending(
        &mut self,
        ctx: &TickContext,
        keystore: &Keystore,
    ) -> Result<StepOutput, XlnError> {
        let pending = self.pending.take().expect("commit without pending frame");
        let mut out = StepOutput::default();

        let sigs: Vec<(SignerId, EcdsaSignature)> = pending
            .sigs
            .iter()
            .map(|(s, sig)| (*s, sig.clone()))
            .collect();
        let hanko = make_hanko(sigs, &self.state.config);

        let emit = self.is_proposer();
        let (effects, outcomes) = apply_entity_frame(
            &mut self.state,
            &pending.frame.txs,
            pending.frame.height,
            pending.frame.timestamp,
            ctx,
            keystore,
            emit,
        )?;
        let root = self.state.state_root();
        if root != pending.frame.new_state_root {
            return Err(XlnError::StateHashMismatch {
                height: pending.frame.height,
                expected: pending.frame.new_state_root.to_hex(),
                got: root.to_hex(),
            });
        }
        if emit {
            out.effects = effects;
            out.outcomes = outcomes;
        }

        self.drop_committed(&pending.frame);
        info!(entity = %self.entity_id, height = pending.frame.height, txs = pending.frame.txs.len(), "frame committed");

        if self.state.config.mode == ConsensusMode::ProposerBased && self.is_proposer() {
            for v in self.other_validators() {
                out.consensus.push((
                    v,
                    EntityInputKind::CommitFrame {
                        height: pending.frame.height,
                        hanko: hanko.clone(),
                    },
                ));
            }
        }
        self.committed_log.push((pending.frame, hanko));
        Ok(out)
    }

    fn handle_commit_frame(&mut self, height: u64, hanko: Hanko) -> Result<StepOutput, XlnError> {
        let mut out = StepOutput::default();
        if height <= self.state.height {
            return Ok(out); // replayed commit
        }
        let Some(pending) = &self.pending else {
            // Commit for a frame we never saw: catch up.
            out.consensus.push((
                self.proposer()?,
                EntityInputKind::SyncRequest {
                    since: self.state.height,
                    requester: self.signer_id,
                },
            ));
            return Ok(out);
        };
        if pending.frame.height != height {
            return Ok(out);
        }

        let digest = entity_digest(&self.entity_id, height, &pending.frame.new_state_root);
        verify_hanko(&hanko, &digest, &self.state.config)?;

        let pending = self.pending.take().expect("pending checked above");
        self.state = pending.post_state;
        self.drop_committed(&pending.frame);
        info!(entity = %self.entity_id, height, "frame committed (validator)");
        self.committed_log.push((pending.frame, hanko));
        Ok(out)
    }

    fn handle_sync_response(
        &mut self,
        frames: Vec<(EntityFrame, Hanko)>,
        ctx: &TickContext,
        keystore: &Keystore,
    ) -> Result<StepOutput, XlnError> {
        for (frame, hanko) in frames {
            if frame.height != self.state.height + 1 {
                continue;
            }
            let digest = entity_digest(&self.entity_id, frame.height, &frame.new_state_root);
            verify_hanko(&hanko, &digest, &self.state.config)?;
            apply_entity_frame(
                &mut self.state,
                &frame.txs,
                frame.height,
                frame.timestamp,
                ctx,
                keystore,
                false,
            )?;
            self.pending = None;
            self.drop_committed(&frame);
            info!(entity = %self.entity_id, height = frame.height, "frame applied from sync");
            self.committed_log.push((frame, hanko));
        }
        Ok(StepOutput::default())
    }

    /// Remove a committed frame's txs from the local mempool.
    fn drop_committed(&mut self, frame: &EntityFrame) {
        let committed: BTreeSet<(SignerId, Nonce)> = frame
            .txs
            .iter()
            .map(|tx| (tx.signer_id, tx.nonce))
            .collect();
        self.mempool
            .retain(|tx| !committed.contains(&(tx.signer_id, tx.nonce)));
    }

    // ── End-of-tick flush ────────────────────────────────────────────────────

    /// Proposer-side driver: propose a frame when transactions are queued or
    /// an account machine needs service (timeouts, retries, announcements).
    pub fn flush(
        &mut self,
        ctx: &TickContext,
        keystore: &Keystore,
    ) -> Result<StepOutput, XlnError> {
        let mut out = StepOutput::default();
        if !self.is_proposer() || self.pending.is_some() {
            return Ok(out);
        }
        let accounts_due = self
            .state
            .accounts
            .values()
            .any(|m| m.needs_service(ctx.tick));
        if self.mempool.is_empty() && !accounts_due {
            return Ok(out);
        }

        // Frame order: ascending (signer, nonce), ties by canonical bytes.
        let mut txs = std::mem::take(&mut self.mempool);
        txs.sort_by(|a, b| {
            (a.signer_id, a.nonce, a.canonical_bytes()).cmp(&(
                b.signer_id,
                b.nonce,
                b.canonical_bytes(),
            ))
        });

        let height = self.state.height + 1;
        let prev_state_hash = self.state.state_root();

        // Dry-run to compute the post-state root.
        let mut post_state = self.state.clone();
        apply_entity_frame(
            &mut post_state,
            &txs,
            height,
            ctx.timestamp,
            ctx,
            keystore,
            false,
        )?;
        let frame = EntityFrame {
            entity_id: self.entity_id,
            height,
            timestamp: ctx.timestamp,
            txs,
            prev_state_hash,
            new_state_root: post_state.state_root(),
        };
        let digest = self.digest_of(&frame);
        let our_sig = keystore.sign(&self.signer_id, &digest)?;

        if self.state.config.is_single_signer() {
            // Fast path: propose and commit fused, no partial exchange.
            let mut sigs = BTreeMap::new();
            sigs.insert(self.signer_id, our_sig);
            self.pending = Some(PendingEntityFrame {
                frame,
                post_state,
                sigs,
            });
            out.merge(self.commit_pending(ctx, keystore)?);
            return Ok(out);
        }

        debug!(entity = %self.entity_id, height, txs = frame.txs.len(), "broadcasting proposal");
        let mut sigs = BTreeMap::new();
        sigs.insert(self.signer_id, our_sig.clone());
        for v in self.other_validators() {
            out.consensus.push((
                v,
                EntityInputKind::ProposeFrame {
                    frame: frame.clone(),
                    sig: our_sig.clone(),
                },
            ));
        }
        self.pending = Some(PendingEntityFrame {
            frame,
            post_state,
            sigs,
        });
        Ok(out)
    }
}
