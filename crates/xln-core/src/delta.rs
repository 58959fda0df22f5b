//! The per-token bilateral balance record and its derived-capacity
//! arithmetic (the RCPAN invariant).
//!
//! Every account/token pair is a bar of width
//! `left_credit_limit + collateral + right_credit_limit`. The current
//! position on the bar is `delta = ondelta + offdelta`; left's net position
//! is `-delta`, right's is `+delta`. A payment from left to right raises
//! `offdelta`, right to left lowers it.

use serde::{Deserialize, Serialize};

use crate::types::{AccountSide, SignedAmount, TokenAmount};

/// Bilateral balance state for one token of one account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Funds locked on-chain for this account/token.
    pub collateral: TokenAmount,
    /// On-chain balance component (moves only with settlement events).
    pub ondelta: SignedAmount,
    /// Off-chain balance component (moves with bilateral frames).
    pub offdelta: SignedAmount,
    /// Credit extended by left, usable by right.
    pub left_credit_limit: TokenAmount,
    /// Credit extended by right, usable by left.
    pub right_credit_limit: TokenAmount,
    /// Left's reserved amount pending withdrawal.
    pub left_allowance: TokenAmount,
    /// Right's reserved amount pending withdrawal.
    pub right_allowance: TokenAmount,
}

/// Capacities derived from a [`Delta`] under the RCPAN split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedCapacity {
    /// Amount left may still send (moves delta toward the right bound).
    pub left_capacity: TokenAmount,
    /// Amount right may still send (moves delta toward the left bound).
    pub right_capacity: TokenAmount,
    /// Portion of the position outside the bar bounds. Zero whenever the
    /// capacity invariant has been maintained.
    pub locked: TokenAmount,
    /// The combined position `ondelta + offdelta`.
    pub delta: SignedAmount,
}

/// Saturating u128 → i128 conversion. Amounts near i128::MAX are outside any
/// realistic token supply; saturation keeps the arithmetic total.
fn to_signed(x: TokenAmount) -> SignedAmount {
    SignedAmount::try_from(x).unwrap_or(SignedAmount::MAX)
}

fn to_unsigned(x: SignedAmount) -> TokenAmount {
    if x <= 0 {
        0
    } else {
        x as TokenAmount
    }
}

impl Delta {
    /// The combined signed position.
    pub fn total(&self) -> SignedAmount {
        self.ondelta + self.offdelta
    }

    /// Net position of `side`: left is `-delta`, right is `+delta`.
    pub fn net(&self, side: AccountSide) -> SignedAmount {
        match side {
            AccountSide::Left => -self.total(),
            AccountSide::Right => self.total(),
        }
    }

    /// Derive both sides' capacities.
    ///
    /// With `lo = -left_credit_limit`, `hi = collateral + right_credit_limit`
    /// and `x = clamp(delta, lo, hi)`:
    ///
    /// - `left_capacity  = max(0, hi - x - left_allowance)`
    /// - `right_capacity = max(0, x - lo - right_allowance)`
    ///
    /// which preserves `left_capacity + right_capacity + allowances =
    /// collateral + left_credit_limit + right_credit_limit` whenever the
    /// position lies on the bar.
    pub fn derive(&self) -> DerivedCapacity {
        let delta = self.total();
        let lo = -to_signed(self.left_credit_limit);
        let hi = to_signed(self.collateral) + to_signed(self.right_credit_limit);
        let x = delta.clamp(lo, hi);

        let left_capacity = to_unsigned(hi - x).saturating_sub(self.left_allowance);
        let right_capacity = to_unsigned(x - lo).saturating_sub(self.right_allowance);
        let locked = delta.abs_diff(x);

        DerivedCapacity {
            left_capacity,
            right_capacity,
            locked,
            delta,
        }
    }

    /// Sending capacity of `side`.
    pub fn capacity(&self, side: AccountSide) -> TokenAmount {
        let d = self.derive();
        match side {
            AccountSide::Left => d.left_capacity,
            AccountSide::Right => d.right_capacity,
        }
    }

    /// Allowance reserved by `side`.
    pub fn allowance(&self, side: AccountSide) -> TokenAmount {
        match side {
            AccountSide::Left => self.left_allowance,
            AccountSide::Right => self.right_allowance,
        }
    }

    /// Credit limit extended by `side`.
    pub fn credit_limit(&self, side: AccountSide) -> TokenAmount {
        match side {
            AccountSide::Left => self.left_credit_limit,
            AccountSide::Right => self.right_credit_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(collateral: u128, left_cl: u128, right_cl: u128, offdelta: i128) -> Delta {
        Delta {
            collateral,
            offdelta,
            left_credit_limit: left_cl,
            right_credit_limit: right_cl,
            ..Delta::default()
        }
    }

    #[test]
    fn zero_delta_splits_collateral_to_left() {
        // Left prefunded the collateral; with delta = 0 the whole bar right
        // of the position is left's to spend.
        let d = bar(100, 0, 0, 0);
        let c = d.derive();
        assert_eq!(c.left_capacity, 100);
        assert_eq!(c.right_capacity, 0);
        assert_eq!(c.locked, 0);
    }

    #[test]
    fn conservation_holds_across_positions() {
        for off in [-30i128, -1, 0, 1, 17, 60] {
            let d = bar(100, 30, 60, off);
            let c = d.derive();
            assert_eq!(
                c.left_capacity + c.right_capacity + c.locked,
                100 + 30 + 60,
                "offdelta={off}"
            );
        }
    }

    #[test]
    fn payment_moves_capacity_between_sides() {
        let before = bar(100, 0, 50, 0);
        let after = bar(100, 0, 50, 40);
        assert_eq!(before.capacity(AccountSide::Left), 150);
        assert_eq!(after.capacity(AccountSide::Left), 110);
        assert_eq!(after.capacity(AccountSide::Right), 40);
    }

    #[test]
    fn credit_only_account_has_borrow_capacity() {
        // No collateral: left can spend only what right extended.
        let d = bar(0, 0, 500, 0);
        assert_eq!(d.capacity(AccountSide::Left), 500);
        assert_eq!(d.capacity(AccountSide::Right), 0);
    }

    #[test]
    fn out_of_bounds_position_reports_locked() {
        let d = bar(10, 0, 0, 25);
        let c = d.derive();
        assert_eq!(c.locked, 15);
        assert_eq!(c.left_capacity, 0);
        assert_eq!(c.right_capacity, 10);
    }

    #[test]
    fn allowance_shrinks_capacity() {
        let mut d = bar(100, 0, 0, 0);
        d.left_allowance = 30;
        assert_eq!(d.capacity(AccountSide::Left), 70);
        // Conservation now includes the reserved allowance.
        let c = d.derive();
        assert_eq!(c.left_capacity + c.right_capacity + d.left_allowance, 100);
    }

    #[test]
    fn net_positions_mirror() {
        let d = bar(0, 50, 50, 20);
        assert_eq!(d.net(AccountSide::Left), -20);
        assert_eq!(d.net(AccountSide::Right), 20);
    }

    #[test]
    fn ondelta_and_offdelta_combine() {
        let mut d = bar(100, 0, 0, 25);
        d.ondelta = 10;
        assert_eq!(d.total(), 35);
        assert_eq!(d.capacity(AccountSide::Right), 35);
    }
}
