//! The runtime environment: every replica, the deferred cross-entity
//! output queue, and the snapshot history.
//!
//! All collections are ordered so that serialization and iteration are
//! canonical; the replay law depends on it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use xln_account::proof::CooperativeProof;
use xln_core::tx::{EntityInput, RuntimeInput};
use xln_core::types::{EntityId, SignerId, Timestamp};
use xln_entity::EntityReplica;

/// Key of one replica: the entity and the signer holding this view.
pub type ReplicaKey = (EntityId, SignerId);

/// The whole-world state owned by one runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Env {
    /// Tick counter; strictly monotone.
    pub height: u64,
    pub timestamp: Timestamp,
    pub replicas: BTreeMap<ReplicaKey, EntityReplica>,
    /// Cross-entity outputs produced this tick, drained at the next one.
    pub pending_outputs: Vec<EntityInput>,
    /// Completed settlement witnesses awaiting on-chain consumption.
    pub settlements: Vec<CooperativeProof>,
    /// Snapshot per tick when snapshotting is enabled.
    pub history: Vec<EnvSnapshot>,
}

/// The consensus-relevant fields of an [`Env`], used for canonical
/// serialization (history is derived data and stays out).
#[derive(Serialize)]
pub struct EnvBody<'a> {
    pub height: u64,
    pub timestamp: Timestamp,
    pub replicas: &'a BTreeMap<ReplicaKey, EntityReplica>,
    pub pending_outputs: &'a [EntityInput],
    pub settlements: &'a [CooperativeProof],
}

/// A deep, value-equal copy of the env captured after one tick, together
/// with the input that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub height: u64,
    pub timestamp: Timestamp,
    pub description: String,
    pub input: RuntimeInput,
    pub replicas: BTreeMap<ReplicaKey, EntityReplica>,
    pub pending_outputs: Vec<EntityInput>,
    pub settlements: Vec<CooperativeProof>,
}

impl Env {
    pub fn body(&self) -> EnvBody<'_> {
        EnvBody {
            height: self.height,
            timestamp: self.timestamp,
            replicas: &self.replicas,
            pending_outputs: &self.pending_outputs,
            settlements: &self.settlements,
        }
    }

    /// The designated proposer replica of `entity`, if imported.
    pub fn proposer_of(&self, entity: &EntityId) -> Option<&EntityReplica> {
        self.replica_keys_of(entity)
            .into_iter()
            .map(|k| &self.replicas[&k])
            .find(|r| r.is_proposer())
    }

    /// All replica keys belonging to `entity`, in signer order.
    pub fn replica_keys_of(&self, entity: &EntityId) -> Vec<ReplicaKey> {
        self.replicas
            .range((*entity, SignerId([0u8; 20]))..=(*entity, SignerId([0xFF; 20])))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Restore a captured snapshot as a standalone env (without history).
    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        Self {
            height: snapshot.height,
            timestamp: snapshot.timestamp,
            replicas: snapshot.replicas.clone(),
            pending_outputs: snapshot.pending_outputs.clone(),
            settlements: snapshot.settlements.clone(),
            history: Vec::new(),
        }
    }
}
