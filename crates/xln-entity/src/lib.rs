//! The E-machine: a BFT-replicated entity state machine.
//!
//! Each `(entity_id, signer_id)` pair is one [`consensus::EntityReplica`].
//! Replicas collect entity transactions, agree on frames via
//! propose → sign → commit with Hanko aggregates, and dispatch committed
//! transactions into entity state and the bilateral account machines.

pub mod consensus;
pub mod dispatch;
pub mod state;

pub use consensus::{EntityReplica, StepOutput};
pub use dispatch::{EntityEffect, JIntent};
pub use state::{EntityState, Proposal, ProposalStatus};
