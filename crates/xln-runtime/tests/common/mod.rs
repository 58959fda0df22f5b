//! Shared harness for the end-to-end scenarios: a small network of
//! single-signer entities driven tick by tick, with every applied input
//! logged for replay assertions.
#![allow(dead_code)]

use std::collections::BTreeMap;

use xln_account::machine::AccountMachine;
use xln_core::tx::{
    EntityInput, EntityInputKind, EntityTx, EntityTxKind, JEvent, Outcome, RuntimeInput, RuntimeTx,
};
use xln_core::types::{EntityId, QuorumConfig, SignerId, TokenId};
use xln_crypto::{KeyPair, Keystore};
use xln_runtime::{Runtime, SimClock};

pub const TOKEN: TokenId = 1;
/// One whole token at 18 decimals.
pub const WEI: u128 = 1_000_000_000_000_000_000;

pub const CLOCK_START: i64 = 1_000_000;
pub const CLOCK_STEP: i64 = 1_000;

pub fn eid(n: u8) -> EntityId {
    EntityId::from_bytes([n; 32])
}

pub struct Net {
    pub rt: Runtime,
    pub signers: BTreeMap<EntityId, SignerId>,
    /// Copy of the keystore for replay runs.
    pub keystore: Keystore,
    /// Every input applied, in order, starting from genesis.
    pub log: Vec<RuntimeInput>,
}

impl Net {
    /// Import one single-signer entity per tag in a first tick.
    pub fn new(tags: &[u8]) -> Self {
        let mut ks = Keystore::new();
        let mut signers = BTreeMap::new();
        let mut runtime_txs = Vec::new();
        for t in tags {
            let signer = ks.insert(KeyPair::from_seed(&[*t; 8]));
            signers.insert(eid(*t), signer);
            runtime_txs.push(RuntimeTx::ImportReplica {
                entity_id: eid(*t),
                signer_id: signer,
                config: QuorumConfig::single(signer),
            });
        }
        let keystore = ks.clone();
        let mut net = Self {
            rt: Runtime::new(ks, Box::new(SimClock::new(CLOCK_START, CLOCK_STEP))),
            signers,
            keystore,
            log: Vec::new(),
        };
        net.apply(RuntimeInput {
            runtime_txs,
            entity_inputs: vec![],
        });
        net
    }

    pub fn apply(&mut self, input: RuntimeInput) -> Vec<Outcome> {
        self.log.push(input.clone());
        self.rt.tick(input).expect("tick must not abort")
    }

    /// Build an AddTx input with the next free nonce of the entity's signer.
    pub fn add_tx_input(&self, entity: EntityId, kind: EntityTxKind) -> EntityInput {
        let signer = self.signers[&entity];
        let replica = self.rt.env.proposer_of(&entity).expect("entity imported");
        EntityInput {
            entity_id: entity,
            signer_id: None,
            kind: EntityInputKind::AddTx(EntityTx {
                signer_id: signer,
                nonce: replica.next_nonce(&signer),
                kind,
            }),
        }
    }

    /// Submit one entity tx as its own tick.
    pub fn submit(&mut self, entity: EntityId, kind: EntityTxKind) -> Vec<Outcome> {
        let input = RuntimeInput {
            runtime_txs: vec![],
            entity_inputs: vec![self.add_tx_input(entity, kind)],
        };
        self.apply(input)
    }

    pub fn tick_empty(&mut self) -> Vec<Outcome> {
        self.apply(RuntimeInput::default())
    }

    /// Tick until no deferred cross-entity output remains.
    pub fn settle(&mut self, max_ticks: usize) {
        for _ in 0..max_ticks {
            if self.rt.env.pending_outputs.is_empty() {
                return;
            }
            self.tick_empty();
        }
        assert!(
            self.rt.env.pending_outputs.is_empty(),
            "network did not settle within {max_ticks} ticks"
        );
    }

    /// Deliver a chain event to both parties, as the watcher would.
    pub fn deliver_jevent(&mut self, event: JEvent) -> Vec<Outcome> {
        let mut entity_inputs = vec![EntityInput {
            entity_id: event.entity_id,
            signer_id: None,
            kind: EntityInputKind::JEvent(event.clone()),
        }];
        if let Some(cp) = event.counterparty {
            entity_inputs.push(EntityInput {
                entity_id: cp,
                signer_id: None,
                kind: EntityInputKind::JEvent(event),
            });
        }
        self.apply(RuntimeInput {
            runtime_txs: vec![],
            entity_inputs,
        })
    }

    /// `entity`'s view of its account with `counterparty`.
    pub fn machine(&self, entity: EntityId, counterparty: EntityId) -> &AccountMachine {
        &self.rt.env.proposer_of(&entity).expect("entity imported").state.accounts[&counterparty]
    }

    /// Open the `a`↔`b` account from `a` and settle the handshake.
    pub fn open_account(&mut self, a: EntityId, b: EntityId, fee_bps: u32) {
        self.submit(
            a,
            EntityTxKind::OpenAccount {
                target: b,
                fee_bps,
            },
        );
        self.settle(4);
        assert!(self.machine(a, b).their_signer.is_some());
        assert!(self.machine(b, a).their_signer.is_some());
    }

    /// Credit `entity`'s reserve and post it as collateral on its account
    /// with `counterparty` (two chain events).
    pub fn fund_collateral(
        &mut self,
        entity: EntityId,
        counterparty: EntityId,
        amount: u128,
        block: u64,
    ) {
        self.deliver_jevent(JEvent {
            kind: xln_core::tx::JEventKind::ReserveCredited,
            entity_id: entity,
            counterparty: None,
            token_id: TOKEN,
            amount,
            block_number: block,
            tx_hash: [block as u8; 32],
            log_index: 0,
        });
        self.deliver_jevent(JEvent {
            kind: xln_core::tx::JEventKind::CollateralPosted,
            entity_id: entity,
            counterparty: Some(counterparty),
            token_id: TOKEN,
            amount,
            block_number: block + 1,
            tx_hash: [block as u8 + 1; 32],
            log_index: 0,
        });
    }
}
