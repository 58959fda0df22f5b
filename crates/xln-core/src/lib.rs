//! Core types for the XLN protocol: identifiers, the bilateral delta record
//! and its derived-capacity arithmetic, account/entity frames, transaction
//! sum types and the shared error enum.
//!
//! Everything consensus-observable lives here so that the machine crates
//! (`xln-account`, `xln-entity`, `xln-runtime`) agree on one canonical data
//! model.

pub mod constants;
pub mod delta;
pub mod error;
pub mod frame;
pub mod tx;
pub mod types;

pub use error::XlnError;
