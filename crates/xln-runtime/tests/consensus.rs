//! End-to-end consensus scenarios: crossed bilateral proposals, nonce
//! replay rejection, and threshold BFT across partial validator sets.

mod common;

use common::*;
use xln_core::tx::{EntityInput, EntityInputKind, EntityTx, EntityTxKind, OutcomeStatus, Profile, RuntimeInput, RuntimeTx};
use xln_core::types::{ConsensusMode, QuorumConfig, SignerId};
use xln_crypto::{KeyPair, Keystore};
use xln_runtime::{Runtime, SimClock};

/// Both parties funded so either side can pay.
fn funded_pair() -> Net {
    let mut net = Net::new(&[1, 2]);
    let (e1, e2) = (eid(1), eid(2));
    net.open_account(e1, e2, 0);
    net.fund_collateral(e1, e2, 1_000 * WEI, 1);
    net.fund_collateral(e2, e1, 1_000 * WEI, 10);
    net
}

#[test]
fn crossed_proposals_resolve_left_first() {
    let mut net = funded_pair();
    let (e1, e2) = (eid(1), eid(2));

    // Conflicting payments submitted in the same tick: both sides propose.
    let a = net.add_tx_input(
        e1,
        EntityTxKind::DirectPayment {
            token_id: TOKEN,
            amount: 10 * WEI,
            route: vec![e1, e2],
            description: None,
        },
    );
    let b = net.add_tx_input(
        e2,
        EntityTxKind::DirectPayment {
            token_id: TOKEN,
            amount: 20 * WEI,
            route: vec![e2, e1],
            description: None,
        },
    );
    net.apply(RuntimeInput {
        runtime_txs: vec![],
        entity_inputs: vec![a, b],
    });

    // Crossed frames meet here: left rejects, right yields and commits
    // left's frame with its own payment back in the mempool.
    net.tick_empty();
    {
        let m21 = net.machine(e2, e1);
        assert_eq!(m21.rollback_count, 1);
        assert!(m21.pending_frame.is_none());
        assert_eq!(m21.current_frame.height, 1);
        assert_eq!(m21.deltas[&TOKEN].offdelta, (10 * WEI) as i128);
        assert_eq!(m21.mempool.len(), 1);
    }

    // Left finalizes its frame; right's stray cancel is a no-op.
    net.tick_empty();
    {
        let m12 = net.machine(e1, e2);
        assert_eq!(m12.current_frame.height, 1);
        assert_eq!(m12.frame_history.len(), 1);
        assert_eq!(m12.rollback_count, 0);
    }

    // After the one-tick cooldown right re-proposes and its payment lands
    // one frame later.
    for _ in 0..4 {
        net.tick_empty();
    }
    let m12 = net.machine(e1, e2);
    let m21 = net.machine(e2, e1);
    assert_eq!(m12.current_frame.height, 2);
    assert_eq!(m21.current_frame.height, 2);
    assert_eq!(m12.current_frame.state_hash, m21.current_frame.state_hash);
    // Net effect of both payments: +10 from left, -20 from right.
    assert_eq!(m12.deltas[&TOKEN].offdelta, -(10 * WEI as i128));
    assert!(m21.mempool.is_empty());
}

#[test]
fn nonce_replay_is_rejected_without_side_effects() {
    let mut net = funded_pair();
    let (e1, e2) = (eid(1), eid(2));

    let payment = net.add_tx_input(
        e1,
        EntityTxKind::DirectPayment {
            token_id: TOKEN,
            amount: 7 * WEI,
            route: vec![e1, e2],
            description: None,
        },
    );
    net.apply(RuntimeInput {
        runtime_txs: vec![],
        entity_inputs: vec![payment.clone()],
    });
    net.settle(4);
    assert_eq!(
        net.machine(e1, e2).deltas[&TOKEN].offdelta,
        (7 * WEI) as i128
    );

    // Byte-identical resubmission: rejected at admission, nothing moves.
    let state_before = net.rt.env.proposer_of(&e1).unwrap().state.clone();
    let outcomes = net.apply(RuntimeInput {
        runtime_txs: vec![],
        entity_inputs: vec![payment],
    });
    let failed = outcomes
        .iter()
        .find(|o| matches!(o.status, OutcomeStatus::Failed(_)))
        .expect("replayed tx reports failure");
    match &failed.status {
        OutcomeStatus::Failed(reason) => assert!(reason.contains("nonce reused"), "got {reason}"),
        OutcomeStatus::Applied => unreachable!(),
    }

    net.settle(4);
    let state_after = net.rt.env.proposer_of(&e1).unwrap().state.clone();
    assert_eq!(state_before.accounts, state_after.accounts);
    assert_eq!(state_before.nonces, state_after.nonces);
    assert_eq!(
        net.machine(e1, e2).deltas[&TOKEN].offdelta,
        (7 * WEI) as i128
    );
}

// ── Threshold BFT ────────────────────────────────────────────────────────────

fn three_validator_quorum(ks: &mut Keystore) -> QuorumConfig {
    let mut validators = Vec::new();
    let mut shares = std::collections::BTreeMap::new();
    for seed in [b"val-a", b"val-b", b"val-c"] {
        let id = ks.insert(KeyPair::from_seed(seed));
        validators.push(id);
        shares.insert(id, 1u128);
    }
    QuorumConfig {
        mode: ConsensusMode::ProposerBased,
        threshold: 2,
        validators,
        shares,
    }
}

fn import_and_submit(present: &[usize]) -> (Runtime, QuorumConfig) {
    let mut ks = Keystore::new();
    let config = three_validator_quorum(&mut ks);
    let entity = eid(7);

    let runtime_txs: Vec<RuntimeTx> = present
        .iter()
        .map(|i| RuntimeTx::ImportReplica {
            entity_id: entity,
            signer_id: config.validators[*i],
            config: config.clone(),
        })
        .collect();

    let mut rt = Runtime::new(ks, Box::new(SimClock::new(CLOCK_START, CLOCK_STEP)));
    rt.apply_runtime_input(RuntimeInput {
        runtime_txs,
        entity_inputs: vec![],
    })
    .unwrap();

    let proposer = config.validators[0];
    rt.apply_runtime_input(RuntimeInput {
        runtime_txs: vec![],
        entity_inputs: vec![EntityInput {
            entity_id: entity,
            signer_id: Some(proposer),
            kind: EntityInputKind::AddTx(EntityTx {
                signer_id: proposer,
                nonce: 1,
                kind: EntityTxKind::UpdateProfile {
                    profile: Profile {
                        name: "bft".into(),
                        capabilities: vec![],
                        hub: false,
                    },
                },
            }),
        }],
    })
    .unwrap();
    (rt, config)
}

#[test]
fn two_of_three_validators_commit() {
    // A (proposer) and C online; B partitioned away.
    let (rt, config) = import_and_submit(&[0, 2]);
    let entity = eid(7);

    for idx in [0, 2] {
        let replica = &rt.env.replicas[&(entity, config.validators[idx])];
        assert_eq!(replica.state.height, 1);
        assert_eq!(replica.state.profile.name, "bft");
        assert!(replica.pending.is_none());
    }
    // The committed aggregate carries exactly the two online signers.
    let proposer = &rt.env.replicas[&(entity, config.validators[0])];
    let (_, hanko) = &proposer.committed_log[0];
    let signers: std::collections::BTreeSet<SignerId> =
        hanko.sigs.iter().map(|(s, _)| *s).collect();
    assert_eq!(signers.len(), 2);
    assert!(signers.contains(&config.validators[0]));
    assert!(signers.contains(&config.validators[2]));
}

#[test]
fn lone_proposer_cannot_reach_threshold() {
    let (rt, config) = import_and_submit(&[0]);
    let entity = eid(7);

    let replica = &rt.env.replicas[&(entity, config.validators[0])];
    // Weight 1 of threshold 2: the frame stays pending, no height advance.
    assert_eq!(replica.state.height, 0);
    assert!(replica.pending.is_some());
    assert!(replica.committed_log.is_empty());
    assert_eq!(replica.state.profile.name, "");
}
