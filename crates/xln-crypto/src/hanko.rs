//! Hanko: aggregate threshold signatures over an entity's quorum.
//!
//! A Hanko carries the signer set, one recoverable signature per signer, and
//! the quorum it claims to satisfy. Verification is pure: recover every
//! signature, check membership, sum signing weight against the threshold.

use std::collections::BTreeSet;

use xln_core::tx::Hanko;
use xln_core::types::{EcdsaSignature, QuorumConfig, SignerId, TokenAmount};
use xln_core::XlnError;

use crate::keypair::recover_signer;

/// Assemble a Hanko from collected partial signatures.
pub fn make_hanko(sigs: Vec<(SignerId, EcdsaSignature)>, quorum: &QuorumConfig) -> Hanko {
    Hanko {
        signers: sigs.iter().map(|(s, _)| *s).collect(),
        sigs,
        threshold: quorum.threshold,
        shares: quorum.shares.clone(),
    }
}

/// Verify a Hanko over `digest` against the quorum the verifier trusts.
///
/// Checks (in order):
/// 1. The claimed threshold and shares match the trusted quorum.
/// 2. Every signature recovers to its claimed signer.
/// 3. Every signer is a quorum member; duplicates count once.
/// 4. The summed signing weight reaches the threshold.
pub fn verify_hanko(hanko: &Hanko, digest: &[u8; 32], quorum: &QuorumConfig) -> Result<(), XlnError> {
    if hanko.threshold != quorum.threshold || hanko.shares != quorum.shares {
        return Err(XlnError::InvalidInput(
            "hanko quorum does not match entity quorum".into(),
        ));
    }

    let mut seen: BTreeSet<SignerId> = BTreeSet::new();
    let mut weight: TokenAmount = 0;

    for (signer, sig) in &hanko.sigs {
        let recovered = recover_signer(digest, sig)?;
        if recovered != *signer {
            return Err(XlnError::InvalidSignature);
        }
        let share = match quorum.shares.get(signer) {
            Some(s) => *s,
            None => return Err(XlnError::InvalidSignature),
        };
        if seen.insert(*signer) {
            weight += share;
        }
    }

    if weight < quorum.threshold {
        return Err(XlnError::ThresholdNotMet {
            need: quorum.threshold,
            got: weight,
        });
    }
    Ok(())
}
