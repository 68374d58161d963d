use crate::stats::VaultSummary;
use alloy::primitives::U256;
use serde::Serialize;
use std::collections::BTreeMap;

/// The drain report is purely informational; this grows alongside any
/// future alert kinds that warrant escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
}

/// One output record per vault summary, handed to the alert sink as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub name: String,
    pub description: String,
    pub alert_id: String,
    pub severity: Severity,
    pub protocol: String,
    pub metadata: BTreeMap<String, String>,
}

/// Percentage of declared supply the ranked holders could actually exit
/// with, floored. Zero supply renders as 0 rather than faulting.
fn min_percent_withdrawable(summary: &VaultSummary) -> U256 {
    if summary.total_supply.is_zero() {
        return U256::ZERO;
    }
    summary
        .withdrawable_shares
        .saturating_mul(U256::from(100u64))
        / summary.total_supply
}

pub fn build_alert(summary: &VaultSummary) -> Alert {
    let mut metadata = BTreeMap::new();
    metadata.insert("vault".into(), format!("{:#x}", summary.vault));
    metadata.insert("totalSupply".into(), summary.total_supply.to_string());
    metadata.insert(
        "sharesOwnedByTopHolders".into(),
        summary.holder_shares.to_string(),
    );
    metadata.insert(
        "sharesWithdrawableByTopHolders".into(),
        summary.withdrawable_shares.to_string(),
    );
    metadata.insert(
        "minPercentWithdrawable".into(),
        min_percent_withdrawable(summary).to_string(),
    );

    Alert {
        name: "Minimum Withdrawable Shares".into(),
        description: "Share liquidity available to the largest vault holders under a sequential exit".into(),
        alert_id: "VAULT-DRAIN-1".into(),
        severity: Severity::Info,
        protocol: "Yearn Finance".into(),
        metadata,
    }
}
