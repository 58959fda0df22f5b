//! Canonical serialization and deterministic replay.
//!
//! The replay law: re-running the recorded inputs from a snapshot must
//! reproduce byte-identical state. Everything consensus-observable is held
//! in ordered containers, so plain bincode over [`Env::body`] is canonical.

use xln_core::tx::RuntimeInput;
use xln_core::XlnError;
use xln_crypto::Keystore;

use crate::adapters::Clock;
use crate::env::Env;
use crate::tick::Runtime;

/// Canonical bytes of the env's consensus-relevant state (history excluded).
pub fn canonical_env_bytes(env: &Env) -> Vec<u8> {
    bincode::serialize(&env.body()).expect("env serialization is infallible")
}

/// Re-run `inputs` from `genesis` and return the resulting env.
///
/// The caller supplies the same keystore and an identically-configured
/// deterministic clock as the original run; snapshots are captured so the
/// replayed history matches too.
pub fn replay(
    genesis: Env,
    inputs: &[RuntimeInput],
    keystore: Keystore,
    clock: Box<dyn Clock>,
) -> Result<Env, XlnError> {
    let mut runtime = Runtime::with_env(genesis, keystore, clock);
    for input in inputs {
        runtime.apply_runtime_input(input.clone())?;
    }
    Ok(runtime.env)
}
