use alloy::primitives::{Address, U256};

/// One sequential redemption step. `balance_before` is the balance re-read
/// from the fresh fork (not the indexer's nominal figure); `redeemed` is the
/// observed delta on the same mutated session after the withdrawal call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainStep {
    pub account: Address,
    pub balance_before: U256,
    pub redeemed: U256,
}

/// Per-vault drain summary. `withdrawable_shares <= holder_shares` always:
/// a holder cannot redeem more than its balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSummary {
    pub vault: Address,
    pub total_supply: U256,
    /// Sum of corrected balances across the ranked holders.
    pub holder_shares: U256,
    /// Sum of what those holders actually redeemed, in order, against the
    /// shared fork state.
    pub withdrawable_shares: U256,
}

/// Fold per-step figures into one summary. Pure; a vault with no steps
/// carries no signal and yields `None` instead of a degenerate record.
pub fn summarize(vault: Address, total_supply: U256, steps: &[DrainStep]) -> Option<VaultSummary> {
    if steps.is_empty() {
        return None;
    }

    let mut holder_shares = U256::ZERO;
    let mut withdrawable_shares = U256::ZERO;
    for step in steps {
        holder_shares = holder_shares.saturating_add(step.balance_before);
        withdrawable_shares = withdrawable_shares.saturating_add(step.redeemed);
    }

    Some(VaultSummary {
        vault,
        total_supply,
        holder_shares,
        withdrawable_shares,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(balance: u64, redeemed: u64) -> DrainStep {
        DrainStep {
            account: Address::repeat_byte(0xe0),
            balance_before: U256::from(balance),
            redeemed: U256::from(redeemed),
        }
    }

    #[test]
    fn test_summarize_totals() {
        let vault = Address::repeat_byte(0xda);
        let steps = [step(1000, 1000), step(700, 700), step(2000, 2000), step(300, 300)];
        let summary = summarize(vault, U256::from(6000u64), &steps).expect("summary");
        assert_eq!(summary.total_supply, U256::from(6000u64));
        assert_eq!(summary.holder_shares, U256::from(4000u64));
        assert_eq!(summary.withdrawable_shares, U256::from(4000u64));
    }

    #[test]
    fn test_summarize_partial_redemptions() {
        let vault = Address::repeat_byte(0xda);
        let steps = [step(1000, 1000), step(1000, 500), step(2000, 2000), step(300, 0)];
        let summary = summarize(vault, U256::from(6000u64), &steps).expect("summary");
        assert_eq!(summary.holder_shares, U256::from(4300u64));
        assert_eq!(summary.withdrawable_shares, U256::from(3500u64));
    }

    #[test]
    fn test_summarize_empty_steps_yields_none() {
        assert!(summarize(Address::repeat_byte(0xda), U256::from(999u64), &[]).is_none());
    }

    #[test]
    fn test_summarize_zero_supply_is_not_an_error() {
        let summary =
            summarize(Address::repeat_byte(0xda), U256::ZERO, &[step(10, 10)]).expect("summary");
        assert_eq!(summary.total_supply, U256::ZERO);
    }
}
