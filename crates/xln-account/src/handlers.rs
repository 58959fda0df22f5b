//! Pure account-transaction transition handlers.
//!
//! Given the delta map and a transaction they produce the updated deltas or
//! an error; no machine bookkeeping is touched here. Frame construction and
//! frame validation both run through [`apply_account_tx`], which is what
//! keeps the two sides of an account in lockstep.

use std::collections::BTreeMap;

use xln_core::delta::Delta;
use xln_core::tx::AccountTx;
use xln_core::types::{AccountSide, TokenAmount, TokenId};
use xln_core::XlnError;

/// Credit utilization of the limit extended by `side`: how deep the other
/// party has drawn into `side`'s credit zone.
fn credit_utilization(delta: &Delta, side: AccountSide) -> TokenAmount {
    let total = delta.total();
    match side {
        // Left's credit covers the region below zero.
        AccountSide::Left => {
            if total < 0 {
                total.unsigned_abs()
            } else {
                0
            }
        }
        // Right's credit covers the region above the collateral bound.
        AccountSide::Right => {
            let above = total.saturating_sub_unsigned(delta.collateral);
            if above > 0 {
                above as TokenAmount
            } else {
                0
            }
        }
    }
}

/// Apply one account transaction to the delta map.
pub fn apply_account_tx(
    deltas: &mut BTreeMap<TokenId, Delta>,
    tx: &AccountTx,
) -> Result<(), XlnError> {
    match tx {
        AccountTx::Payment {
            token_id,
            amount,
            from,
            ..
        } => {
            if *amount == 0 {
                return Err(XlnError::ZeroAmount);
            }
            let delta = deltas.entry(*token_id).or_default();
            let available = delta.capacity(*from);
            if available < *amount {
                return Err(XlnError::CapacityExceeded {
                    need: *amount,
                    available,
                });
            }
            match from {
                AccountSide::Left => delta.offdelta += *amount as i128,
                AccountSide::Right => delta.offdelta -= *amount as i128,
            }
            Ok(())
        }

        AccountTx::ExtendCredit {
            token_id,
            side,
            new_limit,
        } => {
            let delta = deltas.entry(*token_id).or_default();
            let used = credit_utilization(delta, *side);
            if *new_limit < used {
                return Err(XlnError::CreditLimitBelowUtilization {
                    limit: *new_limit,
                    used,
                });
            }
            match side {
                AccountSide::Left => delta.left_credit_limit = *new_limit,
                AccountSide::Right => delta.right_credit_limit = *new_limit,
            }
            Ok(())
        }

        AccountTx::RequestWithdrawal {
            token_id,
            amount,
            side,
            ..
        } => {
            if *amount == 0 {
                return Err(XlnError::ZeroAmount);
            }
            let delta = deltas.entry(*token_id).or_default();
            let reserved = delta.left_allowance + delta.right_allowance;
            if reserved + *amount > delta.collateral {
                return Err(XlnError::AllowanceExceedsCollateral);
            }
            match side {
                AccountSide::Left => delta.left_allowance += *amount,
                AccountSide::Right => delta.right_allowance += *amount,
            }
            Ok(())
        }

        // Counter-signature and rebalance intents move no balance until the
        // matching on-chain event arrives; settlement is pure bookkeeping.
        AccountTx::AcceptWithdrawal { .. }
        | AccountTx::RequestRebalance { .. }
        | AccountTx::SettleCooperative { .. } => {
            if let AccountTx::RequestRebalance { amount, .. } = tx {
                if *amount == 0 {
                    return Err(XlnError::ZeroAmount);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(collateral: u128, right_cl: u128) -> BTreeMap<TokenId, Delta> {
        let mut m = BTreeMap::new();
        m.insert(
            1,
            Delta {
                collateral,
                right_credit_limit: right_cl,
                ..Delta::default()
            },
        );
        m
    }

    fn pay(amount: u128, from: AccountSide) -> AccountTx {
        AccountTx::Payment {
            token_id: 1,
            amount,
            from,
            forward: None,
            description: None,
        }
    }

    #[test]
    fn payment_moves_offdelta() {
        let mut deltas = seeded(100, 0);
        apply_account_tx(&mut deltas, &pay(40, AccountSide::Left)).unwrap();
        assert_eq!(deltas[&1].offdelta, 40);
        apply_account_tx(&mut deltas, &pay(15, AccountSide::Right)).unwrap();
        assert_eq!(deltas[&1].offdelta, 25);
    }

    #[test]
    fn payment_over_capacity_rejected() {
        let mut deltas = seeded(100, 0);
        let err = apply_account_tx(&mut deltas, &pay(101, AccountSide::Left)).unwrap_err();
        assert!(matches!(err, XlnError::CapacityExceeded { .. }));
        // State untouched on failure.
        assert_eq!(deltas[&1].offdelta, 0);
    }

    #[test]
    fn zero_payment_rejected() {
        let mut deltas = seeded(100, 0);
        assert!(matches!(
            apply_account_tx(&mut deltas, &pay(0, AccountSide::Left)),
            Err(XlnError::ZeroAmount)
        ));
    }

    #[test]
    fn extend_credit_below_utilization_rejected() {
        let mut deltas = seeded(0, 500);
        // Left borrows 300 into right's credit.
        apply_account_tx(&mut deltas, &pay(300, AccountSide::Left)).unwrap();
        let err = apply_account_tx(
            &mut deltas,
            &AccountTx::ExtendCredit {
                token_id: 1,
                side: AccountSide::Right,
                new_limit: 200,
            },
        )
        .unwrap_err();
        assert!(matches!(err, XlnError::CreditLimitBelowUtilization { used: 300, .. }));
    }

    #[test]
    fn extend_credit_raises_capacity() {
        let mut deltas = seeded(0, 0);
        apply_account_tx(
            &mut deltas,
            &AccountTx::ExtendCredit {
                token_id: 1,
                side: AccountSide::Right,
                new_limit: 250,
            },
        )
        .unwrap();
        assert_eq!(deltas[&1].capacity(AccountSide::Left), 250);
    }

    #[test]
    fn withdrawal_reserves_allowance_up_to_collateral() {
        let mut deltas = seeded(100, 0);
        apply_account_tx(
            &mut deltas,
            &AccountTx::RequestWithdrawal {
                token_id: 1,
                amount: 60,
                side: AccountSide::Left,
                request_id: 1,
            },
        )
        .unwrap();
        assert_eq!(deltas[&1].left_allowance, 60);

        let err = apply_account_tx(
            &mut deltas,
            &AccountTx::RequestWithdrawal {
                token_id: 1,
                amount: 50,
                side: AccountSide::Left,
                request_id: 2,
            },
        )
        .unwrap_err();
        assert!(matches!(err, XlnError::AllowanceExceedsCollateral));
    }
}
