use crate::error::{ConfigError, Result};
use alloy::primitives::Address;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Yearn v2 vault registry on mainnet.
const DEFAULT_REGISTRY: &str = "0xe15461b18ee31b7379019dc523231c57d1cbc18c";
const DEFAULT_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/salazarguille/yearn-vaults-v2-subgraph-mainnet";

const DEFAULT_TOP_HOLDER_COUNT: usize = 10;
const DEFAULT_REPORT_PERIOD_SECS: u64 = 6 * 60 * 60;
const DEFAULT_SCAN_MIN_INTERVAL_SECS: u64 = 30;
const DEFAULT_SCAN_FAILURE_BACKOFF_SECS: u64 = 5;
const DEFAULT_SCAN_BACKOFF_CAP_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENT_VAULTS: usize = 4;
const DEFAULT_BLOCK_POLL_MS: u64 = 12_000;
const DEFAULT_SUBGRAPH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub eth_rpc_url: String,
    pub registry_address: Address,
    pub subgraph_url: String,
    /// How many of the largest holders per vault are replayed.
    pub top_holder_count: usize,
    pub report_period: Duration,
    /// Floor between scan iterations, even when every scan succeeds.
    pub scan_min_interval: Duration,
    /// Base delay after a failed scan; doubles per consecutive failure.
    pub scan_failure_backoff: Duration,
    pub scan_backoff_cap: Duration,
    pub max_concurrent_vaults: usize,
    pub block_poll_interval: Duration,
    pub subgraph_timeout: Duration,
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        ConfigError::Invalid(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => {
            Err(ConfigError::Invalid(format!("{name} must use http(s) scheme, got `{other}`"))
                .into())
        }
    }
}

fn load_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn load_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

impl SentinelConfig {
    pub fn from_env() -> Result<Self> {
        let eth_rpc_url = env::var("ETH_RPC_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::Missing("ETH_RPC_URL".into()))?;
        validate_http_url("ETH_RPC_URL", &eth_rpc_url)?;

        let registry_raw =
            env::var("VAULT_REGISTRY_ADDRESS").unwrap_or_else(|_| DEFAULT_REGISTRY.into());
        let registry_address = Address::from_str(registry_raw.trim()).map_err(|e| {
            ConfigError::Invalid(format!(
                "VAULT_REGISTRY_ADDRESS `{registry_raw}` is not an address: {e}"
            ))
        })?;

        let subgraph_url =
            env::var("SUBGRAPH_URL").unwrap_or_else(|_| DEFAULT_SUBGRAPH_URL.into());
        validate_http_url("SUBGRAPH_URL", &subgraph_url)?;

        let top_holder_count =
            load_usize("TOP_HOLDER_COUNT", DEFAULT_TOP_HOLDER_COUNT).clamp(1, 100);
        let max_concurrent_vaults =
            load_usize("MAX_CONCURRENT_VAULTS", DEFAULT_MAX_CONCURRENT_VAULTS).clamp(1, 64);

        Ok(Self {
            eth_rpc_url,
            registry_address,
            subgraph_url,
            top_holder_count,
            report_period: Duration::from_secs(load_u64(
                "REPORT_PERIOD_SECS",
                DEFAULT_REPORT_PERIOD_SECS,
            )),
            scan_min_interval: Duration::from_secs(load_u64(
                "SCAN_MIN_INTERVAL_SECS",
                DEFAULT_SCAN_MIN_INTERVAL_SECS,
            )),
            scan_failure_backoff: Duration::from_secs(
                load_u64("SCAN_FAILURE_BACKOFF_SECS", DEFAULT_SCAN_FAILURE_BACKOFF_SECS).max(1),
            ),
            scan_backoff_cap: Duration::from_secs(
                load_u64("SCAN_BACKOFF_CAP_SECS", DEFAULT_SCAN_BACKOFF_CAP_SECS).max(1),
            ),
            max_concurrent_vaults,
            block_poll_interval: Duration::from_millis(
                load_u64("BLOCK_POLL_MS", DEFAULT_BLOCK_POLL_MS).clamp(500, 120_000),
            ),
            subgraph_timeout: Duration::from_secs(
                load_u64("SUBGRAPH_TIMEOUT_SECS", DEFAULT_SUBGRAPH_TIMEOUT_SECS).clamp(1, 300),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_http_url_accepts_https() {
        assert!(validate_http_url("X", "https://example.com/rpc").is_ok());
    }

    #[test]
    fn test_validate_http_url_rejects_ws() {
        assert!(validate_http_url("X", "ws://example.com").is_err());
        assert!(validate_http_url("X", "not a url").is_err());
    }

    #[test]
    fn test_default_registry_parses() {
        assert!(Address::from_str(DEFAULT_REGISTRY).is_ok());
    }

    #[test]
    fn test_load_u64_falls_back_on_garbage() {
        std::env::set_var("SENTINEL_TEST_LOAD_U64", "not-a-number");
        assert_eq!(load_u64("SENTINEL_TEST_LOAD_U64", 7), 7);
        std::env::remove_var("SENTINEL_TEST_LOAD_U64");
    }
}
