//! The R-machine: single-threaded tick coordinator.
//!
//! A [`tick::Runtime`] owns one [`env::Env`], routes each `RuntimeInput`
//! through the entity replicas with a bounded fan-out loop, captures
//! snapshots and persists history through the injected adapters. All I/O is
//! mediated by the capability traits in [`adapters`]; nothing in the core
//! blocks or yields mid-tick.

pub mod adapters;
pub mod env;
pub mod snapshot;
pub mod tick;

pub use adapters::{Clock, JAdapter, JEventSource, RngCapability, SimClock, SimJAdapter, SimJEventSource, SimRng, SystemClock};
pub use env::{Env, EnvSnapshot};
pub use snapshot::{canonical_env_bytes, replay};
pub use tick::Runtime;
