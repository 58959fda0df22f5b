//! Capability traits at the runtime boundary.
//!
//! `JAdapter` and `JEventSource` face the external jurisdiction (the
//! on-chain Depository), `Clock` and `Rng` abstract the ambient machine.
//! Production wires real implementations; tests inject the `Sim*` doubles,
//! which are fully deterministic.

use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use xln_account::proof::CooperativeProof;
use xln_core::tx::JEvent;
use xln_core::types::{EntityId, Timestamp, TokenAmount, TokenId};
use xln_core::XlnError;

// ── Clock ────────────────────────────────────────────────────────────────────

/// Tick timestamp source. Deterministic in tests, wall-clock in production.
pub trait Clock {
    fn now(&mut self) -> Timestamp;
}

/// Fixed-step clock for deterministic runs and replay.
#[derive(Clone, Debug)]
pub struct SimClock {
    next: Timestamp,
    step: Timestamp,
}

impl SimClock {
    pub fn new(start: Timestamp, step: Timestamp) -> Self {
        Self { next: start, step }
    }
}

impl Clock for SimClock {
    fn now(&mut self) -> Timestamp {
        let now = self.next;
        self.next += self.step;
        now
    }
}

/// Wall-clock milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

// ── Rng ──────────────────────────────────────────────────────────────────────

/// Randomness capability. Only non-consensus-observable choices may draw
/// from it.
pub trait RngCapability {
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

/// Seeded deterministic randomness for tests.
pub struct SimRng(StdRng);

impl SimRng {
    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RngCapability for SimRng {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }
}

// ── JAdapter ─────────────────────────────────────────────────────────────────

/// Opaque transaction id returned by the jurisdiction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JTxId(pub [u8; 32]);

/// Write-side interface of the on-chain Depository. All calls are fallible;
/// the runtime invokes them strictly at tick boundaries.
pub trait JAdapter {
    fn reserve_to_reserve(
        &mut self,
        from: EntityId,
        to: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    ) -> Result<JTxId, XlnError>;

    fn prefund_account(
        &mut self,
        entity: EntityId,
        counterparty: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    ) -> Result<JTxId, XlnError>;

    fn settle_cooperative(&mut self, proof: &CooperativeProof) -> Result<JTxId, XlnError>;

    fn submit_dispute(&mut self, proof: &CooperativeProof) -> Result<JTxId, XlnError>;

    fn get_reserves(&self, entity: EntityId, token_id: TokenId) -> Result<TokenAmount, XlnError>;

    fn get_collateral(
        &self,
        entity: EntityId,
        counterparty: EntityId,
        token_id: TokenId,
    ) -> Result<TokenAmount, XlnError>;
}

/// Recording adapter double: bookkeeps reserves/collateral and logs calls.
#[derive(Debug, Default)]
pub struct SimJAdapter {
    pub reserves: BTreeMap<(EntityId, TokenId), TokenAmount>,
    pub collateral: BTreeMap<(EntityId, EntityId, TokenId), TokenAmount>,
    pub calls: Vec<String>,
    next_tx: u64,
}

impl SimJAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn tx_id(&mut self) -> JTxId {
        self.next_tx += 1;
        let mut id = [0u8; 32];
        id[24..].copy_from_slice(&self.next_tx.to_be_bytes());
        JTxId(id)
    }
}

impl JAdapter for SimJAdapter {
    fn reserve_to_reserve(
        &mut self,
        from: EntityId,
        to: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    ) -> Result<JTxId, XlnError> {
        self.calls
            .push(format!("reserve_to_reserve {from} -> {to} {token_id} {amount}"));
        let src = self.reserves.entry((from, token_id)).or_default();
        *src = src.saturating_sub(amount);
        *self.reserves.entry((to, token_id)).or_default() += amount;
        Ok(self.tx_id())
    }

    fn prefund_account(
        &mut self,
        entity: EntityId,
        counterparty: EntityId,
        token_id: TokenId,
        amount: TokenAmount,
    ) -> Result<JTxId, XlnError> {
        self.calls
            .push(format!("prefund_account {entity} / {counterparty} {token_id} {amount}"));
        *self
            .collateral
            .entry((entity, counterparty, token_id))
            .or_default() += amount;
        Ok(self.tx_id())
    }

    fn settle_cooperative(&mut self, proof: &CooperativeProof) -> Result<JTxId, XlnError> {
        self.calls.push(format!(
            "settle_cooperative {} / {} nonce {}",
            proof.header.from_entity, proof.header.to_entity, proof.header.cooperative_nonce
        ));
        Ok(self.tx_id())
    }

    fn submit_dispute(&mut self, proof: &CooperativeProof) -> Result<JTxId, XlnError> {
        self.calls.push(format!(
            "submit_dispute {} / {} nonce {}",
            proof.header.from_entity, proof.header.to_entity, proof.header.dispute_nonce
        ));
        Ok(self.tx_id())
    }

    fn get_reserves(&self, entity: EntityId, token_id: TokenId) -> Result<TokenAmount, XlnError> {
        Ok(self.reserves.get(&(entity, token_id)).copied().unwrap_or(0))
    }

    fn get_collateral(
        &self,
        entity: EntityId,
        counterparty: EntityId,
        token_id: TokenId,
    ) -> Result<TokenAmount, XlnError> {
        Ok(self
            .collateral
            .get(&(entity, counterparty, token_id))
            .copied()
            .unwrap_or(0))
    }
}

// ── JEventSource ─────────────────────────────────────────────────────────────

/// Chain subscription: typed events, at-least-once per block. The runtime
/// drains it strictly before a tick and deduplicates.
pub trait JEventSource {
    fn poll_events(&mut self) -> Vec<JEvent>;
}

/// Scriptable event source for tests; redeliveries are fair game.
#[derive(Debug, Default)]
pub struct SimJEventSource {
    queue: VecDeque<JEvent>,
}

impl SimJEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: JEvent) {
        self.queue.push_back(event);
    }
}

impl JEventSource for SimJEventSource {
    fn poll_events(&mut self) -> Vec<JEvent> {
        self.queue.drain(..).collect()
    }
}
