use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use xln_core::constants::{FRAME_TX_LIMIT, REPROPOSE_COOLDOWN_TICKS};
use xln_core::delta::Delta;
use xln_core::frame::AccountFrame;
use xln_core::tx::{AccountEnvelope, AccountMessage, AccountTx};
use xln_core::types::{
    AccountKey, AccountSide, EcdsaSignature, EntityId, SignerId, StateHash, Timestamp, TokenAmount,
    TokenId,
};
use xln_core::XlnError;
use xln_crypto::{frame_hash, verify_signer, Keystore};

use crate::handlers::apply_account_tx;
use crate::proof::{proof_body, proof_header, signing_digest, CooperativeProof};

// ── Context & effects ────────────────────────────────────────────────────────

/// Per-tick context handed into every machine step.
#[derive(Clone, Copy, Debug)]
pub struct TickContext {
    /// Runtime height (the tick counter).
    pub tick: u64,
    pub timestamp: Timestamp,
}

/// What a machine step asks its enclosing entity to do.
///
/// State mutations are identical on every replica of the entity; `Send` and
/// `Settlement` effects are only materialized on the replica that emits
/// outputs (the proposer), which is why machine steps take an `emit` flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountEffect {
    /// Deliver a bilateral message to the counterparty entity.
    Send(AccountEnvelope),

    /// A committed inbound payment carries a route tail: enqueue the next
    /// hop's payment (fee deduction is the entity's job). Deterministic on
    /// every replica.
    ForwardPayment {
        token_id: TokenId,
        amount: TokenAmount,
        route: Vec<EntityId>,
        description: Option<String>,
    },

    /// The counterparty asked this side to post collateral. Deterministic on
    /// every replica; the entity turns it into an adapter intent.
    RebalanceRequested {
        token_id: TokenId,
        amount: TokenAmount,
    },

    /// A cooperative settlement witness with this side's signature attached.
    Settlement(CooperativeProof),
}

// ── Machine state ────────────────────────────────────────────────────────────

/// A mempool entry; `bounced` marks a tx that already failed one frame's
/// capacity check and gets dropped on the second failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub tx: AccountTx,
    pub bounced: bool,
}

/// A proposed-but-unacknowledged frame. At most one per side. Signatures are
/// produced at send time and never stored in consensus state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFrame {
    pub frame: AccountFrame,
    pub sent_at_tick: u64,
}

/// A withdrawal intent awaiting the counterparty signature and the on-chain
/// execution event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub token_id: TokenId,
    pub amount: TokenAmount,
    pub side: AccountSide,
    pub accepted: bool,
}

/// One side's view of a bilateral account. Both parties hold a mirrored
/// machine in canonical orientation and converge on every committed frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMachine {
    pub key: AccountKey,
    pub our_side: AccountSide,
    /// Address whose key signs this side's frames (the entity's designated
    /// proposer signer).
    pub our_signer: SignerId,
    /// Counterparty's frame-signing address, learned from its `Open`.
    pub their_signer: Option<SignerId>,
    /// Forwarding fee taken by hops routing through this account.
    pub fee_bps: u32,

    pub mempool: Vec<MempoolEntry>,
    pub current_frame: AccountFrame,
    pub pending_frame: Option<PendingFrame>,
    pub deltas: BTreeMap<TokenId, Delta>,
    pub frame_history: Vec<AccountFrame>,

    pub sent_transitions: u64,
    pub acked_transitions: u64,
    pub rollback_count: u64,
    pub send_counter: u64,
    pub receive_counter: u64,
    pub cooperative_nonce: u64,
    pub dispute_nonce: u64,

    pub pending_withdrawals: BTreeMap<u64, WithdrawalRequest>,
    pub next_withdrawal_id: u64,
    pub requested_rebalance: BTreeMap<TokenId, TokenAmount>,

    /// Proposer may not re-propose until the tick after this one (set on
    /// cancel to break proposal livelock).
    pub cooldown_until_tick: u64,
    /// Ticks without an Ack before a proposer cancels its own pending frame.
    pub ack_timeout_ticks: u64,
    open_sent: bool,
}

fn genesis_frame() -> AccountFrame {
    let mut frame = AccountFrame {
        height: 0,
        timestamp: 0,
        txs: vec![],
        prev_frame_hash: StateHash::zero(),
        state_hash: StateHash::zero(),
        token_ids: vec![],
        deltas: vec![],
    };
    frame.state_hash = frame_hash(&frame.body_bytes());
    frame
}

impl AccountMachine {
    pub fn new(key: AccountKey, our_side: AccountSide, our_signer: SignerId, fee_bps: u32) -> Self {
        Self {
            key,
            our_side,
            our_signer,
            their_signer: None,
            fee_bps,
            mempool: Vec::new(),
            current_frame: genesis_frame(),
            pending_frame: None,
            deltas: BTreeMap::new(),
            frame_history: Vec::new(),
            sent_transitions: 0,
            acked_transitions: 0,
            rollback_count: 0,
            send_counter: 0,
            receive_counter: 0,
            cooperative_nonce: 0,
            dispute_nonce: 0,
            pending_withdrawals: BTreeMap::new(),
            next_withdrawal_id: 1,
            requested_rebalance: BTreeMap::new(),
            cooldown_until_tick: 0,
            ack_timeout_ticks: xln_core::constants::DEFAULT_ACK_TIMEOUT_TICKS,
            open_sent: false,
        }
    }

    pub fn our_entity(&self) -> EntityId {
        match self.our_side {
            AccountSide::Left => self.key.left,
            AccountSide::Right => self.key.right,
        }
    }

    pub fn counterparty(&self) -> EntityId {
        match self.our_side {
            AccountSide::Left => self.key.right,
            AccountSide::Right => self.key.left,
        }
    }

    /// Enqueue an account transaction for the next proposed frame.
    pub fn enqueue(&mut self, tx: AccountTx) {
        self.mempool.push(MempoolEntry { tx, bounced: false });
    }

    /// Current sending capacity of `side` for `token_id`.
    pub fn capacity_of(&self, token_id: TokenId, side: AccountSide) -> TokenAmount {
        self.deltas
            .get(&token_id)
            .map(|d| d.capacity(side))
            .unwrap_or(0)
    }

    /// Allocate the next withdrawal request id for this side.
    pub fn allocate_withdrawal_id(&mut self) -> u64 {
        let id = self.next_withdrawal_id;
        self.next_withdrawal_id += 1;
        id
    }

    /// True when the end-of-tick pass should drive this machine (something
    /// to announce, propose, time out or retry).
    pub fn needs_service(&self, tick: u64) -> bool {
        if !self.open_sent {
            return true;
        }
        if let Some(pending) = &self.pending_frame {
            return tick.saturating_sub(pending.sent_at_tick) >= self.ack_timeout_ticks;
        }
        self.their_signer.is_some() && !self.mempool.is_empty() && tick > self.cooldown_until_tick
    }

    /// Advance the per-direction send counter. Runs on every replica; the
    /// envelope itself is only built on the emitting one.
    fn bump_send(&mut self) -> u64 {
        self.send_counter += 1;
        self.send_counter
    }

    fn send(
        &mut self,
        message: AccountMessage,
        emit: bool,
        effects: &mut Vec<AccountEffect>,
    ) {
        let counter = self.bump_send();
        if emit {
            effects.push(AccountEffect::Send(AccountEnvelope {
                from: self.our_entity(),
                counter,
                message,
            }));
        }
    }

    fn digest_for(&self, state_hash: &StateHash, height: u64) -> [u8; 32] {
        signing_digest(
            &self.key,
            self.cooperative_nonce,
            self.dispute_nonce,
            state_hash,
            height,
        )
    }

    // ── End-of-tick flush ────────────────────────────────────────────────────

    /// Drive the proposer role: announce the account, time out a stale
    /// pending frame, and propose the next frame when one is due.
    pub fn flush(
        &mut self,
        ctx: &TickContext,
        keystore: &Keystore,
        emit: bool,
    ) -> Result<Vec<AccountEffect>, XlnError> {
        let mut effects = Vec::new();

        if !self.open_sent {
            self.open_sent = true;
            let msg = AccountMessage::Open {
                signer: self.our_signer,
                fee_bps: self.fee_bps,
            };
            self.send(msg, emit, &mut effects);
        }

        // Ack timeout: cancel our own pending frame and tell the peer.
        if let Some(pending) = &self.pending_frame {
            if ctx.tick.saturating_sub(pending.sent_at_tick) >= self.ack_timeout_ticks {
                let height = pending.frame.height;
                warn!(account = %self.counterparty(), height, "ack timeout; cancelling pending frame");
                self.rollback(ctx);
                self.send(
                    AccountMessage::Cancel {
                        height,
                        reason: "ack timeout".into(),
                    },
                    emit,
                    &mut effects,
                );
            }
            return Ok(effects);
        }

        if self.their_signer.is_none()
            || self.mempool.is_empty()
            || ctx.tick <= self.cooldown_until_tick
        {
            return Ok(effects);
        }

        if let Some(frame) = self.build_frame(ctx) {
            self.sent_transitions += frame.txs.len() as u64;
            self.pending_frame = Some(PendingFrame {
                frame: frame.clone(),
                sent_at_tick: ctx.tick,
            });
            debug!(account = %self.counterparty(), height = frame.height, txs = frame.txs.len(), "proposing frame");
            let counter = self.bump_send();
            if emit {
                let digest = self.digest_for(&frame.state_hash, frame.height);
                let sig = keystore.sign(&self.our_signer, &digest)?;
                effects.push(AccountEffect::Send(AccountEnvelope {
                    from: self.our_entity(),
                    counter,
                    message: AccountMessage::Propose { frame, sig },
                }));
            }
        }
        Ok(effects)
    }

    /// Drain the mempool FIFO into the next frame, applying each tx to a
    /// shadow delta map. Capacity failures bounce the tx to the tail once;
    /// a second failure drops it.
    fn build_frame(&mut self, ctx: &TickContext) -> Option<AccountFrame> {
        let mut shadow = self.deltas.clone();
        let mut taken: Vec<AccountTx> = Vec::new();
        let mut requeue: Vec<MempoolEntry> = Vec::new();

        let entries: Vec<MempoolEntry> = std::mem::take(&mut self.mempool);
        for entry in entries {
            if taken.len() >= FRAME_TX_LIMIT {
                requeue.push(entry);
                continue;
            }
            match apply_account_tx(&mut shadow, &entry.tx) {
                Ok(()) => taken.push(entry.tx),
                Err(err) => {
                    if entry.bounced {
                        warn!(account = %self.counterparty(), %err, "dropping twice-bounced account tx");
                    } else {
                        debug!(account = %self.counterparty(), %err, "bouncing account tx to mempool tail");
                        requeue.push(MempoolEntry {
                            tx: entry.tx,
                            bounced: true,
                        });
                    }
                }
            }
        }
        self.mempool = requeue;

        if taken.is_empty() {
            return None;
        }

        let token_ids: Vec<TokenId> = shadow.keys().copied().collect();
        let deltas: Vec<Delta> = shadow.values().cloned().collect();
        let mut frame = AccountFrame {
            height: self.current_frame.height + 1,
            timestamp: ctx.timestamp,
            txs: taken,
            prev_frame_hash: self.current_frame.state_hash,
            state_hash: StateHash::zero(),
            token_ids,
            deltas,
        };
        frame.state_hash = frame_hash(&frame.body_bytes());
        Some(frame)
    }

    // ── Inbound messages ─────────────────────────────────────────────────────

    /// Process one counterparty envelope. Duplicate counters are no-ops;
    /// a counter gap is a protocol error.
    pub fn handle_envelope(
        &mut self,
        envelope: &AccountEnvelope,
        ctx: &TickContext,
        keystore: &Keystore,
        emit: bool,
    ) -> Result<Vec<AccountEffect>, XlnError> {
        if envelope.counter <= self.receive_counter {
            return Ok(Vec::new()); // redelivery
        }
        if envelope.counter != self.receive_counter + 1 {
            return Err(XlnError::StaleCounter {
                expected: self.receive_counter + 1,
                got: envelope.counter,
            });
        }
        self.receive_counter = envelope.counter;

        match &envelope.message {
            AccountMessage::Open { signer, fee_bps } => {
                Ok(self.handle_open(*signer, *fee_bps, emit))
            }
            AccountMessage::ExtendCredit {
                token_id,
                new_limit,
            } => {
                // The sender extends credit from its side of the bar.
                self.set_credit_limit(self.our_side.other(), *token_id, *new_limit)?;
                Ok(Vec::new())
            }
            AccountMessage::Propose { frame, sig } => {
                self.handle_propose(frame.clone(), sig, ctx, keystore, emit)
            }
            AccountMessage::Ack { height, sig } => self.handle_ack(*height, sig, keystore, emit),
            AccountMessage::Cancel { height, reason } => {
                Ok(self.handle_cancel(*height, reason, ctx))
            }
        }
    }

    /// Raise the credit this side extends to the counterparty and announce
    /// it. Converges without a frame, like on-chain events.
    pub fn extend_credit(
        &mut self,
        token_id: TokenId,
        new_limit: TokenAmount,
        emit: bool,
    ) -> Result<Vec<AccountEffect>, XlnError> {
        self.set_credit_limit(self.our_side, token_id, new_limit)?;
        let mut effects = Vec::new();
        self.send(
            AccountMessage::ExtendCredit {
                token_id,
                new_limit,
            },
            emit,
            &mut effects,
        );
        Ok(effects)
    }

    /// Set the limit extended by `side`, refusing to cut below utilization.
    fn set_credit_limit(
        &mut self,
        side: AccountSide,
        token_id: TokenId,
        new_limit: TokenAmount,
    ) -> Result<(), XlnError> {
        crate::handlers::apply_account_tx(
            &mut self.deltas,
            &AccountTx::ExtendCredit {
                token_id,
                side,
                new_limit,
            },
        )?;
        info!(account = %self.counterparty(), token_id, new_limit, side = ?side, "credit limit updated");
        Ok(())
    }

    fn handle_open(&mut self, signer: SignerId, fee_bps: u32, emit: bool) -> Vec<AccountEffect> {
        let mut effects = Vec::new();
        if self.their_signer.is_none() {
            self.their_signer = Some(signer);
            self.fee_bps = self.fee_bps.max(fee_bps);
            info!(account = %self.counterparty(), signer = %signer, "account opened");
        }
        if !self.open_sent {
            self.open_sent = true;
            let msg = AccountMessage::Open {
                signer: self.our_signer,
                fee_bps: self.fee_bps,
            };
            self.send(msg, emit, &mut effects);
        }
        effects
    }

    fn handle_propose(
        &mut self,
        frame: AccountFrame,
        sig: &EcdsaSignature,
        ctx: &TickContext,
        keystore: &Keystore,
        emit: bool,
    ) -> Result<Vec<AccountEffect>, XlnError> {
        let mut effects = Vec::new();

        // Crossed proposal: both sides have a frame in flight. Left wins;
        // the right side cancels its own pending and accepts left's frame.
        if self.pending_frame.is_some() {
            match self.our_side {
                AccountSide::Left => {
                    debug!(account = %self.counterparty(), height = frame.height, "crossed proposal; rejecting right's frame");
                    self.send(
                        AccountMessage::Cancel {
                            height: frame.height,
                            reason: "crossed proposal".into(),
                        },
                        emit,
                        &mut effects,
                    );
                    return Ok(effects);
                }
                AccountSide::Right => {
                    debug!(account = %self.counterparty(), "crossed proposal; yielding to left");
                    self.rollback(ctx);
                }
            }
        }

        let expected = self.current_frame.height + 1;
        if frame.height != expected {
            return Err(XlnError::WrongHeight {
                expected,
                got: frame.height,
            });
        }
        if frame.prev_frame_hash != self.current_frame.state_hash {
            return Err(XlnError::WrongPrevHash(frame.height));
        }

        // Re-derive the post-frame state; any disagreement rejects the
        // proposal rather than committing divergent views.
        let mut shadow = self.deltas.clone();
        for tx in &frame.txs {
            if let Err(err) = apply_account_tx(&mut shadow, tx) {
                warn!(account = %self.counterparty(), %err, "rejecting proposed frame");
                self.send(
                    AccountMessage::Cancel {
                        height: frame.height,
                        reason: err.to_string(),
                    },
                    emit,
                    &mut effects,
                );
                return Ok(effects);
            }
        }
        let token_ids: Vec<TokenId> = shadow.keys().copied().collect();
        let deltas: Vec<Delta> = shadow.values().cloned().collect();
        let mut check = frame.clone();
        check.token_ids = token_ids;
        check.deltas = deltas;
        check.state_hash = frame_hash(&check.body_bytes());
        if check.token_ids != frame.token_ids
            || check.deltas != frame.deltas
            || check.state_hash != frame.state_hash
        {
            warn!(account = %self.counterparty(), height = frame.height, "proposed frame state mismatch");
            self.send(
                AccountMessage::Cancel {
                    height: frame.height,
                    reason: "state mismatch".into(),
                },
                emit,
                &mut effects,
            );
            return Ok(effects);
        }

        let digest = self.digest_for(&frame.state_hash, frame.height);
        let proposer = self
            .their_signer
            .ok_or_else(|| XlnError::UnknownCounterparty(self.counterparty().to_string()))?;
        verify_signer(&digest, sig, &proposer)?;

        // Accept: counter-sign and commit on this side.
        let height = frame.height;
        let counter = self.bump_send();
        if emit {
            let our_sig = keystore.sign(&self.our_signer, &digest)?;
            effects.push(AccountEffect::Send(AccountEnvelope {
                from: self.our_entity(),
                counter,
                message: AccountMessage::Ack {
                    height,
                    sig: our_sig,
                },
            }));
        }
        effects.extend(self.absorb_committed(frame, keystore, emit)?);
        Ok(effects)
    }

    fn handle_ack(
        &mut self,
        height: u64,
        sig: &EcdsaSignature,
        keystore: &Keystore,
        emit: bool,
    ) -> Result<Vec<AccountEffect>, XlnError> {
        let pending = match &self.pending_frame {
            Some(p) if p.frame.height == height => p.clone(),
            // Late or duplicate ack: committed state already moved on.
            _ => return Ok(Vec::new()),
        };

        let digest = self.digest_for(&pending.frame.state_hash, height);
        let acceptor = self
            .their_signer
            .ok_or_else(|| XlnError::UnknownCounterparty(self.counterparty().to_string()))?;
        verify_signer(&digest, sig, &acceptor)?;

        self.pending_frame = None;
        self.acked_transitions += pending.frame.txs.len() as u64;
        info!(account = %self.counterparty(), height, "frame acknowledged");
        self.absorb_committed(pending.frame, keystore, emit)
    }

    fn handle_cancel(&mut self, height: u64, reason: &str, ctx: &TickContext) -> Vec<AccountEffect> {
        match &self.pending_frame {
            Some(p) if p.frame.height == height => {
                warn!(account = %self.counterparty(), height, reason, "pending frame cancelled");
                self.rollback(ctx);
            }
            // Cancel for a frame we no longer hold (e.g. crossed-proposal
            // race already resolved): no-op.
            _ => {}
        }
        Vec::new()
    }

    /// Clear the pending frame, return its txs to the mempool head in their
    /// original order, and start the re-propose cooldown.
    fn rollback(&mut self, ctx: &TickContext) {
        if let Some(pending) = self.pending_frame.take() {
            let n = pending.frame.txs.len() as u64;
            self.sent_transitions = self.sent_transitions.saturating_sub(n);
            let restored: Vec<MempoolEntry> = pending
                .frame
                .txs
                .into_iter()
                .map(|tx| MempoolEntry { tx, bounced: false })
                .collect();
            self.mempool.splice(0..0, restored);
            self.rollback_count += 1;
            self.cooldown_until_tick = ctx.tick + REPROPOSE_COOLDOWN_TICKS;
        }
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    /// Install a committed frame: replace the delta map from the frame's
    /// parallel vectors, run per-tx bookkeeping, append to history.
    fn absorb_committed(
        &mut self,
        frame: AccountFrame,
        keystore: &Keystore,
        emit: bool,
    ) -> Result<Vec<AccountEffect>, XlnError> {
        let mut effects = Vec::new();

        self.deltas = frame
            .token_ids
            .iter()
            .copied()
            .zip(frame.deltas.iter().cloned())
            .collect();

        for tx in &frame.txs {
            match tx {
                AccountTx::Payment {
                    token_id,
                    amount,
                    from,
                    forward: Some(intent),
                    description,
                } if *from != self.our_side => {
                    // We are the receiving hop: ask the entity to route the
                    // remaining hops.
                    effects.push(AccountEffect::ForwardPayment {
                        token_id: *token_id,
                        amount: *amount,
                        route: intent.route.clone(),
                        description: description.clone(),
                    });
                }
                AccountTx::RequestWithdrawal {
                    token_id,
                    amount,
                    side,
                    request_id,
                } => {
                    self.pending_withdrawals.insert(
                        *request_id,
                        WithdrawalRequest {
                            token_id: *token_id,
                            amount: *amount,
                            side: *side,
                            accepted: false,
                        },
                    );
                    if *request_id >= self.next_withdrawal_id {
                        self.next_withdrawal_id = *request_id + 1;
                    }
                }
                AccountTx::AcceptWithdrawal { request_id, .. } => {
                    if let Some(req) = self.pending_withdrawals.get_mut(request_id) {
                        req.accepted = true;
                    }
                }
                AccountTx::RequestRebalance {
                    token_id,
                    amount,
                    side,
                } => {
                    *self.requested_rebalance.entry(*token_id).or_default() += *amount;
                    if *side != self.our_side {
                        // We are the side being asked to post collateral.
                        effects.push(AccountEffect::RebalanceRequested {
                            token_id: *token_id,
                            amount: *amount,
                        });
                    }
                }
                AccountTx::SettleCooperative { .. } => {
                    self.cooperative_nonce += 1;
                    if emit {
                        let header =
                            proof_header(&self.key, self.cooperative_nonce, self.dispute_nonce);
                        let body = proof_body(&self.deltas);
                        let digest = self.digest_for(&frame.state_hash, frame.height);
                        let our_sig = keystore.sign(&self.our_signer, &digest)?;
                        let mut proof = CooperativeProof {
                            header,
                            body,
                            left_sig: None,
                            right_sig: None,
                        };
                        match self.our_side {
                            AccountSide::Left => proof.left_sig = Some(our_sig),
                            AccountSide::Right => proof.right_sig = Some(our_sig),
                        }
                        effects.push(AccountEffect::Settlement(proof));
                    }
                }
                _ => {}
            }
        }

        self.frame_history.push(frame.clone());
        self.current_frame = frame;
        Ok(effects)
    }

    // ── On-chain events ──────────────────────────────────────────────────────
    //
    // J-events move the on-chain components (collateral / ondelta) outside
    // the frame flow. Both entities observe the same events, so the sides
    // stay convergent without a frame.

    /// Collateral posted on-chain by `by`. Funds stay on the poster's side
    /// of the bar: a right-side prefund shifts `ondelta` along with it.
    pub fn apply_collateral_posted(
        &mut self,
        token_id: TokenId,
        amount: TokenAmount,
        by: AccountSide,
    ) {
        let delta = self.deltas.entry(token_id).or_default();
        delta.collateral += amount;
        if by == AccountSide::Right {
            delta.ondelta += amount as i128;
        }
        info!(account = %self.counterparty(), token_id, amount, side = ?by, "collateral posted");
    }

    /// A reserved withdrawal was executed on-chain: release the allowance
    /// and lower collateral by the exact amount.
    pub fn apply_withdrawal_executed(
        &mut self,
        token_id: TokenId,
        amount: TokenAmount,
        side: AccountSide,
    ) -> Result<(), XlnError> {
        let delta = self
            .deltas
            .get_mut(&token_id)
            .ok_or_else(|| XlnError::InvalidInput(format!("no delta for token {token_id}")))?;
        let allowance = match side {
            AccountSide::Left => &mut delta.left_allowance,
            AccountSide::Right => &mut delta.right_allowance,
        };
        if *allowance < amount || delta.collateral < amount {
            return Err(XlnError::AllowanceExceedsCollateral);
        }
        *allowance -= amount;
        delta.collateral -= amount;
        if side == AccountSide::Right {
            delta.ondelta -= amount as i128;
        }
        // Retire the matching accepted request, if tracked.
        let done = self
            .pending_withdrawals
            .iter()
            .find(|(_, req)| {
                req.accepted && req.token_id == token_id && req.side == side && req.amount == amount
            })
            .map(|(id, _)| *id);
        if let Some(id) = done {
            self.pending_withdrawals.remove(&id);
        }
        info!(account = %self.counterparty(), token_id, amount, side = ?side, "withdrawal executed");
        Ok(())
    }

    /// An on-chain settlement moved `amount` toward `toward`'s side.
    pub fn apply_settlement(&mut self, token_id: TokenId, amount: TokenAmount, toward: AccountSide) {
        let delta = self.deltas.entry(token_id).or_default();
        match toward {
            AccountSide::Left => delta.ondelta -= amount as i128,
            AccountSide::Right => delta.ondelta += amount as i128,
        }
    }

    /// A dispute was opened on-chain against this account.
    pub fn apply_dispute_opened(&mut self) {
        self.dispute_nonce += 1;
        warn!(account = %self.counterparty(), dispute_nonce = self.dispute_nonce, "dispute opened");
    }

    // ── Invariants ───────────────────────────────────────────────────────────

    /// Check the per-tick account invariants; any failure is fatal for the
    /// enclosing tick.
    pub fn validate_invariants(&self) -> Result<(), XlnError> {
        if self.frame_history.len() as u64 != self.current_frame.height {
            return Err(XlnError::HistoryDivergence(self.current_frame.height));
        }
        let mut prev: Option<&AccountFrame> = None;
        for (i, frame) in self.frame_history.iter().enumerate() {
            if frame.height != i as u64 + 1 {
                return Err(XlnError::MonotonicityBroken(format!(
                    "frame height {} at history index {}",
                    frame.height, i
                )));
            }
            if let Some(prev) = prev {
                if frame.prev_frame_hash != prev.state_hash {
                    return Err(XlnError::HistoryDivergence(frame.height));
                }
            }
            prev = Some(frame);
        }
        if let Some(last) = self.frame_history.last() {
            if last.state_hash != self.current_frame.state_hash {
                return Err(XlnError::HistoryDivergence(last.height));
            }
        }
        if let Some(pending) = &self.pending_frame {
            if pending.frame.height != self.current_frame.height + 1 {
                return Err(XlnError::MonotonicityBroken(format!(
                    "pending height {} after committed {}",
                    pending.frame.height, self.current_frame.height
                )));
            }
        }
        Ok(())
    }
}
