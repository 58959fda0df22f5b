//! The tick loop: deterministic input routing with a bounded fan-out.
//!
//! One tick = one `RuntimeInput`. Intra-entity consensus messages cascade
//! inside the tick; cross-entity account messages defer one tick through
//! `env.pending_outputs`, which is what paces multi-hop payments to one
//! bilateral frame per hop per tick. The tick is all-or-nothing: work runs
//! on a shadow copy and replaces the env only on success.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};

use xln_account::machine::TickContext;
use xln_account::proof::CooperativeProof;
use xln_core::constants::DEFAULT_ITERATION_BUDGET;
use xln_core::tx::{
    EntityInput, EntityInputKind, JEventKind, Outcome, Profile, RuntimeInput, RuntimeTx,
};
use xln_core::types::{AccountKey, AccountSide, EntityId, Timestamp};
use xln_core::XlnError;
use xln_crypto::Keystore;
use xln_entity::{EntityEffect, EntityReplica, JIntent, StepOutput};
use xln_store::{keys, KvStore};

use crate::adapters::{Clock, JAdapter, JEventSource};
use crate::env::{Env, EnvSnapshot, ReplicaKey};
use crate::snapshot::canonical_env_bytes;

/// Adapter-facing work accumulated during one tick, flushed strictly after
/// the env has advanced.
#[derive(Default)]
struct TickEffects {
    jintents: Vec<JIntent>,
    profiles: Vec<(EntityId, Profile)>,
    settled: Vec<CooperativeProof>,
}

/// The R-machine: owns the env, the signing keys and the adapters.
pub struct Runtime {
    pub env: Env,
    pub keystore: Keystore,
    pub clock: Box<dyn Clock>,
    pub adapter: Option<Box<dyn JAdapter>>,
    pub events: Option<Box<dyn JEventSource>>,
    pub store: Option<Box<dyn KvStore>>,
    pub snapshots_enabled: bool,
    pub iteration_budget: u32,
    seen_jevents: BTreeSet<(JEventKind, [u8; 32], u32)>,
    j_cursor: u64,
}

impl Runtime {
    pub fn new(keystore: Keystore, clock: Box<dyn Clock>) -> Self {
        Self::with_env(Env::default(), keystore, clock)
    }

    pub fn with_env(env: Env, keystore: Keystore, clock: Box<dyn Clock>) -> Self {
        Self {
            env,
            keystore,
            clock,
            adapter: None,
            events: None,
            store: None,
            snapshots_enabled: true,
            iteration_budget: DEFAULT_ITERATION_BUDGET,
            seen_jevents: BTreeSet::new(),
            j_cursor: 0,
        }
    }

    // ── Public operations ────────────────────────────────────────────────────

    /// Drain the event source into the input, then run one tick.
    pub fn tick(&mut self, mut input: RuntimeInput) -> Result<Vec<Outcome>, XlnError> {
        input.entity_inputs.extend(self.drain_jevents());
        self.apply_runtime_input(input)
    }

    /// Apply one `RuntimeInput` deterministically. On any fatal error the
    /// env is left untouched.
    pub fn apply_runtime_input(&mut self, input: RuntimeInput) -> Result<Vec<Outcome>, XlnError> {
        let timestamp = self.clock.now();
        // The snapshot history is not part of the working state.
        let history = std::mem::take(&mut self.env.history);
        let mut work = self.env.clone();

        match self.run_tick(&mut work, &input, timestamp) {
            Ok((outcomes, fx)) => {
                self.env = work;
                self.env.history = history;
                if self.snapshots_enabled {
                    let snapshot = EnvSnapshot {
                        height: self.env.height,
                        timestamp: self.env.timestamp,
                        description: describe_input(&input),
                        input: input.clone(),
                        replicas: self.env.replicas.clone(),
                        pending_outputs: self.env.pending_outputs.clone(),
                        settlements: self.env.settlements.clone(),
                    };
                    self.env.history.push(snapshot);
                }
                self.post_tick(&input, fx);
                Ok(outcomes)
            }
            Err(err) => {
                self.env.history = history;
                warn!(%err, "tick aborted; env restored");
                Err(err)
            }
        }
    }

    /// Lower-level routing variant used by tests: routes `entity_inputs`
    /// directly against the env without advancing the height or capturing a
    /// snapshot. Cross-entity outputs accumulate in `env.pending_outputs`.
    pub fn process(
        &mut self,
        entity_inputs: Vec<EntityInput>,
        iteration_budget: Option<u32>,
        single_iteration: bool,
    ) -> Result<Vec<Outcome>, XlnError> {
        let ctx = TickContext {
            tick: self.env.height + 1,
            timestamp: self.env.timestamp,
        };
        let budget = iteration_budget.unwrap_or(self.iteration_budget);
        let mut outcomes = Vec::new();
        let mut fx = TickEffects::default();
        let mut env = std::mem::take(&mut self.env);
        let mut queue: VecDeque<EntityInput> = entity_inputs.into();
        let result = Self::route_queue(
            &mut env,
            &mut queue,
            &ctx,
            &self.keystore,
            budget,
            single_iteration,
            &mut fx,
            &mut outcomes,
        );
        self.env = env;
        result.map(|_| outcomes)
    }

    // ── Tick body ────────────────────────────────────────────────────────────

    fn run_tick(
        &mut self,
        work: &mut Env,
        input: &RuntimeInput,
        timestamp: Timestamp,
    ) -> Result<(Vec<Outcome>, TickEffects), XlnError> {
        let ctx = TickContext {
            tick: work.height + 1,
            timestamp,
        };
        let mut outcomes = Vec::new();
        let mut fx = TickEffects::default();

        // 1. Runtime-level transactions.
        for rtx in &input.runtime_txs {
            match rtx {
                RuntimeTx::ImportReplica {
                    entity_id,
                    signer_id,
                    config,
                } => {
                    if config.validators.is_empty()
                        || config.threshold == 0
                        || config.threshold > config.total_shares()
                    {
                        return Err(XlnError::InvalidInput(
                            "quorum threshold outside total shares".into(),
                        ));
                    }
                    if !config.is_validator(signer_id) {
                        return Err(XlnError::InvalidInput(format!(
                            "signer {signer_id} is not in the validator set"
                        )));
                    }
                    let key = (*entity_id, *signer_id);
                    if work.replicas.contains_key(&key) {
                        return Err(XlnError::DuplicateEntity(entity_id.to_string()));
                    }
                    work.replicas
                        .insert(key, EntityReplica::new(*entity_id, *signer_id, config.clone()));
                    info!(entity = %entity_id, signer = %signer_id, "replica imported");
                }
            }
        }

        // 2. Route: deferred outputs from the previous tick first, then this
        //    tick's inputs.
        let mut queue: VecDeque<EntityInput> = work.pending_outputs.drain(..).collect();
        queue.extend(input.entity_inputs.iter().cloned());

        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > self.iteration_budget {
                return Err(XlnError::BudgetExceeded(rounds));
            }
            Self::route_queue(
                work,
                &mut queue,
                &ctx,
                &self.keystore,
                self.iteration_budget,
                false,
                &mut fx,
                &mut outcomes,
            )?;

            // End-of-tick service pass: drive proposers (frame proposal,
            // account timeouts, retries). May feed the queue again.
            let keys: Vec<ReplicaKey> = work.replicas.keys().copied().collect();
            for key in keys {
                let out = {
                    let replica = work.replicas.get_mut(&key).expect("listed key");
                    replica.flush(&ctx, &self.keystore)?
                };
                Self::route_step_output(work, key.0, out, &mut queue, &mut fx, &mut outcomes);
            }
            if queue.is_empty() {
                break;
            }
        }

        // 3. Invariants.
        Self::validate_invariants(work)?;

        // 4. Advance.
        work.height += 1;
        work.timestamp = timestamp;
        debug!(height = work.height, outcomes = outcomes.len(), "tick complete");
        Ok((outcomes, fx))
    }

    /// Drain the queue through the replicas, wave by wave. Each wave is
    /// partitioned per replica and processed in sorted key order.
    #[allow(clippy::too_many_arguments)]
    fn route_queue(
        work: &mut Env,
        queue: &mut VecDeque<EntityInput>,
        ctx: &TickContext,
        keystore: &Keystore,
        budget: u32,
        single_iteration: bool,
        fx: &mut TickEffects,
        outcomes: &mut Vec<Outcome>,
    ) -> Result<(), XlnError> {
        let mut iterations = 0u32;
        while !queue.is_empty() {
            iterations += 1;
            if iterations > budget {
                return Err(XlnError::BudgetExceeded(iterations));
            }

            // Partition this wave by replica, preserving arrival order.
            let wave: Vec<EntityInput> = queue.drain(..).collect();
            let mut per: BTreeMap<ReplicaKey, Vec<EntityInputKind>> = BTreeMap::new();
            for item in wave {
                let signer = match item.signer_id {
                    Some(s) => Some(s),
                    None => work.proposer_of(&item.entity_id).map(|r| r.signer_id),
                };
                match signer {
                    Some(signer) if work.replicas.contains_key(&(item.entity_id, signer)) => {
                        per.entry((item.entity_id, signer)).or_default().push(item.kind);
                    }
                    _ => {
                        warn!(entity = %item.entity_id, "dropping input for unknown replica");
                    }
                }
            }

            for (key, kinds) in per {
                let mut step_outs: Vec<StepOutput> = Vec::new();
                {
                    let replica = work.replicas.get_mut(&key).expect("partitioned key");
                    for kind in kinds {
                        match replica.handle_input(kind, ctx, keystore) {
                            Ok(out) => step_outs.push(out),
                            Err(err) if err.is_fatal() => return Err(err),
                            Err(err) => {
                                // Protocol / user errors drop the message.
                                warn!(entity = %key.0, signer = %key.1, %err, "input dropped");
                            }
                        }
                    }
                }
                for out in step_outs {
                    Self::route_step_output(work, key.0, out, queue, fx, outcomes);
                }
            }

            if single_iteration {
                break;
            }
        }
        Ok(())
    }

    /// Fan a replica step's outputs into the right queues: consensus
    /// messages stay in-tick, account sends defer one tick, adapter work
    /// buffers until after the env advances.
    fn route_step_output(
        work: &mut Env,
        entity_id: EntityId,
        out: StepOutput,
        queue: &mut VecDeque<EntityInput>,
        fx: &mut TickEffects,
        outcomes: &mut Vec<Outcome>,
    ) {
        for (target, kind) in out.consensus {
            queue.push_back(EntityInput {
                entity_id,
                signer_id: Some(target),
                kind,
            });
        }
        for effect in out.effects {
            match effect {
                EntityEffect::AccountSend { to, envelope } => {
                    work.pending_outputs.push(EntityInput {
                        entity_id: to,
                        signer_id: None,
                        kind: EntityInputKind::AccountMessage(envelope),
                    });
                }
                EntityEffect::Settlement(proof) => {
                    let merged = merge_settlement(&mut work.settlements, proof);
                    if let Some(complete) = merged {
                        fx.settled.push(complete);
                    }
                }
                EntityEffect::JIntent(intent) => fx.jintents.push(intent),
                EntityEffect::ProfileUpdated(profile) => fx.profiles.push((entity_id, profile)),
            }
        }
        outcomes.extend(out.outcomes);
    }

    // ── Invariants ───────────────────────────────────────────────────────────

    /// Machine-local invariants plus bilateral convergence: wherever both
    /// parties' proposer replicas sit at the same account height, their
    /// state hashes must agree.
    fn validate_invariants(work: &Env) -> Result<(), XlnError> {
        let mut views: BTreeMap<AccountKey, BTreeMap<AccountSide, (u64, [u8; 32])>> =
            BTreeMap::new();

        for replica in work.replicas.values() {
            if !replica.is_proposer() {
                continue;
            }
            for machine in replica.state.accounts.values() {
                machine.validate_invariants()?;
                views.entry(machine.key).or_default().insert(
                    machine.our_side,
                    (machine.current_frame.height, machine.current_frame.state_hash.0),
                );
            }
        }

        for (key, sides) in views {
            if let (Some(left), Some(right)) = (
                sides.get(&AccountSide::Left),
                sides.get(&AccountSide::Right),
            ) {
                if left.0 == right.0 && left.1 != right.1 {
                    warn!(left = %key.left, right = %key.right, height = left.0, "bilateral views diverged");
                    return Err(XlnError::HistoryDivergence(left.0));
                }
            }
        }
        Ok(())
    }

    // ── J-events ─────────────────────────────────────────────────────────────

    /// Poll the event source, deduplicate by `(kind, tx_hash, log_index)`,
    /// and address each fresh event to both parties' proposers.
    fn drain_jevents(&mut self) -> Vec<EntityInput> {
        let Some(source) = self.events.as_mut() else {
            return Vec::new();
        };
        let mut inputs = Vec::new();
        for event in source.poll_events() {
            if !self.seen_jevents.insert(event.dedup_key()) {
                debug!(block = event.block_number, "duplicate J-event dropped");
                continue;
            }
            self.j_cursor = self.j_cursor.max(event.block_number);
            let mut targets = vec![event.entity_id];
            if let Some(cp) = event.counterparty {
                targets.push(cp);
            }
            for target in targets {
                inputs.push(EntityInput {
                    entity_id: target,
                    signer_id: None,
                    kind: EntityInputKind::JEvent(event.clone()),
                });
            }
        }
        inputs
    }

    // ── Post-tick I/O ────────────────────────────────────────────────────────

    /// Adapter calls and durable writes, strictly after the tick committed.
    /// Adapter failures are logged, never fatal for the already-advanced env.
    fn post_tick(&mut self, input: &RuntimeInput, fx: TickEffects) {
        if let Some(adapter) = self.adapter.as_mut() {
            for intent in &fx.jintents {
                let result = match intent {
                    JIntent::ReserveToReserve {
                        from,
                        to,
                        token_id,
                        amount,
                    } => adapter.reserve_to_reserve(*from, *to, *token_id, *amount),
                    JIntent::PrefundAccount {
                        entity,
                        counterparty,
                        token_id,
                        amount,
                    } => adapter.prefund_account(*entity, *counterparty, *token_id, *amount),
                };
                if let Err(err) = result {
                    warn!(%err, "jurisdiction intent failed; adapter will retry");
                }
            }
            for proof in &fx.settled {
                if let Err(err) = adapter.settle_cooperative(proof) {
                    warn!(%err, "cooperative settlement submission failed");
                }
            }
        }

        if let Some(store) = self.store.as_mut() {
            let height = self.env.height;
            let env_bytes = canonical_env_bytes(&self.env);
            let input_bytes =
                bincode::serialize(input).expect("runtime input serialization is infallible");
            let writes: [(Vec<u8>, Vec<u8>); 3] = [
                (keys::snapshot(height), env_bytes),
                (keys::inputs(height), input_bytes),
                (keys::J_CURSOR.to_vec(), self.j_cursor.to_be_bytes().to_vec()),
            ];
            for (key, value) in writes {
                if let Err(err) = store.put(&key, &value) {
                    warn!(%err, "snapshot write failed");
                }
            }
            for (entity, profile) in &fx.profiles {
                match serde_json::to_vec(profile) {
                    Ok(bytes) => {
                        if let Err(err) = store.put(&keys::profile(entity), &bytes) {
                            warn!(%err, "profile write failed");
                        }
                    }
                    Err(err) => warn!(%err, "profile serialization failed"),
                }
            }
        }
    }
}

fn describe_input(input: &RuntimeInput) -> String {
    format!(
        "{} runtime txs, {} entity inputs",
        input.runtime_txs.len(),
        input.entity_inputs.len()
    )
}

/// Merge a half-signed settlement witness into the env's collection; returns
/// the proof once both signatures are present.
fn merge_settlement(
    settlements: &mut Vec<CooperativeProof>,
    incoming: CooperativeProof,
) -> Option<CooperativeProof> {
    for existing in settlements.iter_mut() {
        if existing.header == incoming.header && existing.body == incoming.body {
            if existing.left_sig.is_none() {
                existing.left_sig = incoming.left_sig.clone();
            }
            if existing.right_sig.is_none() {
                existing.right_sig = incoming.right_sig.clone();
            }
            if existing.is_complete() {
                return Some(existing.clone());
            }
            return None;
        }
    }
    let complete = incoming.is_complete();
    settlements.push(incoming.clone());
    complete.then_some(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimClock;
    use xln_core::tx::{EntityTx, EntityTxKind, Profile};
    use xln_core::types::{EntityId, QuorumConfig};
    use xln_crypto::KeyPair;

    fn single_entity_runtime() -> (Runtime, EntityId) {
        let mut ks = Keystore::new();
        let signer = ks.insert(KeyPair::from_seed(b"rt-signer"));
        let entity = EntityId::from_bytes([1u8; 32]);
        let mut rt = Runtime::new(ks, Box::new(SimClock::new(1_000, 100)));
        rt.apply_runtime_input(RuntimeInput {
            runtime_txs: vec![RuntimeTx::ImportReplica {
                entity_id: entity,
                signer_id: signer,
                config: QuorumConfig::single(signer),
            }],
            entity_inputs: vec![],
        })
        .unwrap();
        (rt, entity)
    }

    fn profile_input(rt: &Runtime, entity: EntityId) -> EntityInput {
        let replica = rt.env.proposer_of(&entity).unwrap();
        let signer = replica.signer_id;
        EntityInput {
            entity_id: entity,
            signer_id: None,
            kind: EntityInputKind::AddTx(EntityTx {
                signer_id: signer,
                nonce: replica.next_nonce(&signer),
                kind: EntityTxKind::UpdateProfile {
                    profile: Profile {
                        name: "tick-test".into(),
                        capabilities: vec![],
                        hub: false,
                    },
                },
            }),
        }
    }

    #[test]
    fn tick_advances_height_and_captures_snapshot() {
        let (mut rt, entity) = single_entity_runtime();
        assert_eq!(rt.env.height, 1);
        assert_eq!(rt.env.history.len(), 1);

        let input = RuntimeInput {
            runtime_txs: vec![],
            entity_inputs: vec![profile_input(&rt, entity)],
        };
        let outcomes = rt.apply_runtime_input(input).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(rt.env.height, 2);
        assert_eq!(rt.env.history.len(), 2);
        assert_eq!(
            rt.env.proposer_of(&entity).unwrap().state.profile.name,
            "tick-test"
        );
    }

    #[test]
    fn duplicate_import_aborts_without_mutating_env() {
        let (mut rt, entity) = single_entity_runtime();
        let signer = rt.env.proposer_of(&entity).unwrap().signer_id;
        let before = canonical_env_bytes(&rt.env);

        let err = rt
            .apply_runtime_input(RuntimeInput {
                runtime_txs: vec![RuntimeTx::ImportReplica {
                    entity_id: entity,
                    signer_id: signer,
                    config: QuorumConfig::single(signer),
                }],
                entity_inputs: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, XlnError::DuplicateEntity(_)));
        assert_eq!(canonical_env_bytes(&rt.env), before);
    }

    #[test]
    fn exhausted_budget_restores_the_shadow_env() {
        let (mut rt, entity) = single_entity_runtime();
        rt.iteration_budget = 0;
        let before = canonical_env_bytes(&rt.env);

        let err = rt
            .apply_runtime_input(RuntimeInput {
                runtime_txs: vec![],
                entity_inputs: vec![profile_input(&rt, entity)],
            })
            .unwrap_err();
        assert!(matches!(err, XlnError::BudgetExceeded(_)));
        assert_eq!(canonical_env_bytes(&rt.env), before);
    }

    #[test]
    fn process_routes_without_advancing_height() {
        let (mut rt, entity) = single_entity_runtime();
        let input = profile_input(&rt, entity);
        rt.process(vec![input], None, false).unwrap();

        // The tx reached the proposer's mempool; no tick bookkeeping ran.
        assert_eq!(rt.env.height, 1);
        assert_eq!(rt.env.history.len(), 1);
        assert_eq!(rt.env.proposer_of(&entity).unwrap().mempool.len(), 1);
    }
}

