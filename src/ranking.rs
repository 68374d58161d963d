use crate::error::{compact_error_message, IndexerError, Result};
use alloy::primitives::{Address, U256};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;

/// One holder position as reported by the subgraph, ordered descending by
/// share balance. `nominal_shares` is advisory: the simulator re-reads the
/// authoritative balance from the fork before replaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stakeholder {
    pub vault: Address,
    pub account: Address,
    pub nominal_shares: U256,
}

// ---------------------------------------------------------------------------
// Subgraph response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GraphResponse {
    data: Option<PositionsData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionsData {
    account_vault_positions: Vec<PositionRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRecord {
    account: IdRef,
    vault: IdRef,
    balance_shares: Option<String>,
}

#[derive(Deserialize)]
struct IdRef {
    id: String,
}

fn position_query(vault: Address, top_n: usize) -> serde_json::Value {
    serde_json::json!({
        "query": format!(
            "{{ accountVaultPositions (orderBy: balanceShares, orderDirection: desc, \
             first: {top_n}, where: {{ vault_in: [\"{:#x}\"] }}) \
             {{ id, account {{ id }}, balanceShares, vault {{ id }} }} }}",
            vault
        ),
    })
}

fn parse_positions(body: &str) -> std::result::Result<Vec<PositionRecord>, IndexerError> {
    let parsed: GraphResponse = serde_json::from_str(body)
        .map_err(|e| IndexerError::Malformed(format!("subgraph JSON: {e}")))?;
    let data = parsed
        .data
        .ok_or_else(|| IndexerError::Malformed("subgraph response missing data field".into()))?;
    Ok(data.account_vault_positions)
}

fn record_to_stakeholder(record: &PositionRecord) -> Option<Stakeholder> {
    let vault = Address::from_str(record.vault.id.trim()).ok()?;
    let account = Address::from_str(record.account.id.trim()).ok()?;
    let nominal_shares = record
        .balance_shares
        .as_deref()
        .and_then(|raw| U256::from_str(raw.trim()).ok())
        .unwrap_or(U256::ZERO);
    Some(Stakeholder {
        vault,
        account,
        nominal_shares,
    })
}

/// Client for the external position indexer. One query per vault per scan;
/// failures here are isolated per vault by the producer.
pub struct RankingClient {
    client: reqwest::Client,
    url: String,
    top_n: usize,
    timeout: Duration,
}

impl RankingClient {
    pub fn new(url: String, top_n: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout.saturating_add(Duration::from_secs(5)))
            .build()
            .map_err(|e| IndexerError::Exhausted {
                attempts: 0,
                reason: format!("client construction failed: {e}"),
            })?;
        Ok(Self {
            client,
            url,
            top_n,
            timeout,
        })
    }

    /// Largest `top_n` holders of `vault`, descending by share balance.
    /// An empty list means the vault has no rankable positions and is
    /// excluded from this scan.
    pub async fn top_holders(&self, vault: Address) -> Result<Vec<Stakeholder>> {
        let body = self.fetch_with_retry(vault).await?;
        let records = parse_positions(&body)?;
        let holders = records
            .iter()
            .filter_map(record_to_stakeholder)
            .collect::<Vec<_>>();
        Ok(holders)
    }

    async fn fetch_with_retry(&self, vault: Address) -> Result<String> {
        let mut last_err: Option<String> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(1000 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            match self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&position_query(vault, self.top_n))
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        last_err = Some(format!("HTTP {status}"));
                        continue;
                    }
                    match resp.text().await {
                        Ok(body) => return Ok(body),
                        Err(e) => {
                            last_err = Some(compact_error_message(&e.to_string(), 220));
                            continue;
                        }
                    }
                }
                Err(e) => {
                    last_err = Some(compact_error_message(&e.to_string(), 220));
                    continue;
                }
            }
        }

        Err(IndexerError::Exhausted {
            attempts: MAX_RETRIES,
            reason: last_err.unwrap_or_else(|| "no attempts made".into()),
        }
        .into())
    }
}
