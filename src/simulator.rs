use crate::error::Result;
use crate::fork::SessionFactory;
use crate::ranking::Stakeholder;
use crate::stats::{summarize, DrainStep, VaultSummary};
use alloy::primitives::Address;

/// Replay a sequential bank-run against one vault: the ranked holders exit
/// in descending-balance order through a single shared fork, so each
/// redemption draws on whatever liquidity the previous ones left.
///
/// A reverted or partial withdrawal is the measured signal, never an error;
/// only fork/RPC faults propagate (and abort the whole scan iteration).
pub fn drain_vault(
    factory: &dyn SessionFactory,
    block: u64,
    vault: Address,
    holders: &[Stakeholder],
) -> Result<Option<VaultSummary>> {
    if holders.is_empty() {
        return Ok(None);
    }

    let accounts = holders.iter().map(|h| h.account).collect::<Vec<_>>();
    let mut session = factory.open(block, &accounts)?;

    let total_supply = session.total_supply(vault)?;

    // The indexer's nominal figures may be stale; the fresh fork is the
    // authoritative baseline. Order stays as ranked.
    let mut balances = Vec::with_capacity(accounts.len());
    for account in &accounts {
        balances.push(session.balance_of(vault, *account)?);
    }

    let mut steps = Vec::with_capacity(accounts.len());
    for (account, balance_before) in accounts.iter().copied().zip(balances) {
        // A fork/RPC fault here aborts the whole iteration; only an
        // executed-but-reverted call counts as zero redeemed.
        let call_ok = session.withdraw(vault, account, balance_before)?;
        // Re-read on the same mutated session: a partial fill shows up here
        // even when the call itself succeeded.
        let balance_after = session.balance_of(vault, account)?;
        let redeemed = balance_before.saturating_sub(balance_after);
        if !call_ok {
            tracing::debug!(
                "[SCAN] withdrawal call failed for holder {:#x} on vault {:#x} (redeemed {})",
                account,
                vault,
                redeemed
            );
        }
        steps.push(DrainStep {
            account,
            balance_before,
            redeemed,
        });
    }

    Ok(summarize(vault, total_supply, &steps))
}
