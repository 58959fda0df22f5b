//! The A-machine: strict two-party bilateral consensus over a shared
//! balance-sheet proof.
//!
//! Each entity holds one [`machine::AccountMachine`] per counterparty. Both
//! sides see the same canonically-oriented state and converge on every
//! committed frame via the proposer-cancel-rollback protocol.

pub mod handlers;
pub mod machine;
pub mod proof;

pub use machine::{AccountEffect, AccountMachine, TickContext};
