//! End-to-end: the withdrawal round trip. Bilateral request and accept
//! frames, then the on-chain execution event (delivered twice to exercise
//! deduplication) releasing allowance and collateral on both sides.

mod common;

use common::*;
use xln_core::tx::{AccountTx, EntityTxKind, JEvent, JEventKind};
use xln_core::types::AccountSide;
use xln_crypto::keccak256;
use xln_runtime::SimJEventSource;

#[test]
fn withdrawal_round_trip_with_jevent() {
    let mut net = Net::new(&[1, 2]);
    let (e1, e2) = (eid(1), eid(2));
    net.open_account(e1, e2, 0);
    net.fund_collateral(e1, e2, 500 * WEI, 1);

    // E1 reserves 50 for withdrawal; the frame commits on both sides.
    net.submit(
        e1,
        EntityTxKind::AccountTxs {
            counterparty: e2,
            txs: vec![AccountTx::RequestWithdrawal {
                token_id: TOKEN,
                amount: 50 * WEI,
                side: AccountSide::Left,
                request_id: 1,
            }],
        },
    );
    net.settle(4);
    for (a, b) in [(e1, e2), (e2, e1)] {
        let m = net.machine(a, b);
        assert_eq!(m.deltas[&TOKEN].left_allowance, 50 * WEI);
        assert_eq!(m.frame_history.len(), 1);
        assert!(!m.pending_withdrawals[&1].accepted);
    }
    // Reserved allowance is no longer spendable.
    assert_eq!(
        net.machine(e1, e2).capacity_of(TOKEN, AccountSide::Left),
        450 * WEI
    );

    // E2 counter-signs; one more committed frame.
    let accept_sig = net
        .keystore
        .sign(&net.signers[&e2], &keccak256(b"withdrawal-1"))
        .unwrap();
    net.submit(
        e2,
        EntityTxKind::AccountTxs {
            counterparty: e1,
            txs: vec![AccountTx::AcceptWithdrawal {
                request_id: 1,
                sig: accept_sig,
            }],
        },
    );
    net.settle(4);
    for (a, b) in [(e1, e2), (e2, e1)] {
        let m = net.machine(a, b);
        assert!(m.pending_withdrawals[&1].accepted);
        assert_eq!(m.frame_history.len(), 2);
    }

    // The chain executes the withdrawal. The watcher redelivers the event;
    // the runtime applies it exactly once.
    let executed = JEvent {
        kind: JEventKind::WithdrawalExecuted,
        entity_id: e1,
        counterparty: Some(e2),
        token_id: TOKEN,
        amount: 50 * WEI,
        block_number: 20,
        tx_hash: [0xAA; 32],
        log_index: 3,
    };
    let mut source = SimJEventSource::new();
    source.push(executed.clone());
    source.push(executed);
    net.rt.events = Some(Box::new(source));
    net.tick_empty();
    net.settle(4);

    for (a, b) in [(e1, e2), (e2, e1)] {
        let m = net.machine(a, b);
        assert_eq!(m.deltas[&TOKEN].collateral, 450 * WEI, "{a} view");
        assert_eq!(m.deltas[&TOKEN].left_allowance, 0);
        assert!(m.pending_withdrawals.is_empty());
        // No extra bilateral frame: on-chain moves bypass the frame flow.
        assert_eq!(m.frame_history.len(), 2);
    }
    let m12 = net.machine(e1, e2);
    let m21 = net.machine(e2, e1);
    assert_eq!(m12.current_frame.state_hash, m21.current_frame.state_hash);
    assert_eq!(m12.deltas, m21.deltas);

    // Withdrawn funds landed back in E1's reserve.
    let e1_state = &net.rt.env.proposer_of(&e1).unwrap().state;
    assert_eq!(e1_state.reserves[&TOKEN], 50 * WEI);
    assert_eq!(e1_state.j_block, 20);

    // Remaining capacity reflects the smaller collateral.
    assert_eq!(
        net.machine(e1, e2).capacity_of(TOKEN, AccountSide::Left),
        450 * WEI
    );
}
