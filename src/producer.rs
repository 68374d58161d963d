use crate::batch_slot::{BatchPublisher, ScanBatch};
use crate::config::SentinelConfig;
use crate::error::{compact_error_message, Result, SentinelError};
use crate::fork::SessionFactory;
use crate::ranking::RankingClient;
use crate::registry::{HttpProvider, RegistryClient};
use crate::simulator::drain_vault;
use crate::stats::VaultSummary;
use alloy::primitives::Address;
use alloy::providers::Provider;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};

/// Everything one scan iteration needs. Shared by value across per-vault
/// tasks via `Arc`.
pub struct ScanContext {
    pub provider: HttpProvider,
    pub registry: RegistryClient,
    pub ranking: RankingClient,
    pub factory: Arc<dyn SessionFactory>,
    pub max_concurrent_vaults: usize,
}

/// One full pass: pin a block, list vaults, rank and drain each, and batch
/// the summaries. Ranking failures are isolated per vault; registry or fork
/// faults abort the iteration and no partial batch escapes.
pub async fn run_one_scan(ctx: &Arc<ScanContext>) -> Result<ScanBatch> {
    let block = ctx
        .provider
        .get_block_number()
        .await
        .map_err(|e| crate::error::RpcError::Transport(compact_error_message(&e.to_string(), 220)))?;

    let vaults = ctx.registry.list_vaults(block).await?;
    tracing::debug!("[SCAN] block {} registry returned {} vaults", block, vaults.len());

    // Cross-vault fan-out only: everything within one vault's simulation is
    // strictly sequential on its own session.
    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrent_vaults));
    let mut handles = Vec::with_capacity(vaults.len());
    for vault in vaults {
        let ctx = Arc::clone(ctx);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| SentinelError::Task(format!("semaphore closed: {e}")))?;
            scan_vault(&ctx, block, vault).await
        }));
    }

    // Await in spawn order so batch order tracks registry order.
    let mut summaries = Vec::new();
    for handle in handles {
        let joined = handle
            .await
            .map_err(|e| SentinelError::Task(format!("vault scan task panicked: {e}")))?;
        if let Some(summary) = joined? {
            summaries.push(summary);
        }
    }

    Ok(ScanBatch { block, summaries })
}

/// Rank and drain a single vault. `Ok(None)` covers both isolated ranking
/// failures and vaults with no rankable holders; simulation faults propagate.
async fn scan_vault(
    ctx: &ScanContext,
    block: u64,
    vault: Address,
) -> Result<Option<VaultSummary>> {
    let holders = match ctx.ranking.top_holders(vault).await {
        Ok(holders) => holders,
        Err(err) => {
            tracing::warn!(
                "[RANK] skipping vault {:#x} this scan: {}",
                vault,
                compact_error_message(&err.to_string(), 220)
            );
            return Ok(None);
        }
    };
    if holders.is_empty() {
        return Ok(None);
    }

    let factory = Arc::clone(&ctx.factory);
    tokio::task::spawn_blocking(move || drain_vault(factory.as_ref(), block, vault, &holders))
        .await
        .map_err(|e| SentinelError::Task(format!("drain task panicked: {e}")))?
}

fn failure_backoff(cfg: &SentinelConfig, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exp = consecutive_failures.saturating_sub(1).min(16);
    cfg.scan_failure_backoff
        .saturating_mul(2u32.saturating_pow(exp))
        .min(cfg.scan_backoff_cap)
}

/// Infinite producer loop. Runs until shutdown; every iteration either
/// publishes one complete batch or discards its partial work. Failed
/// iterations back off exponentially instead of busy-looping against a
/// failing dependency, and a minimum pacing floor applies even on success.
pub async fn run_scan_loop(
    ctx: Arc<ScanContext>,
    cfg: SentinelConfig,
    publisher: BatchPublisher,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut consecutive_failures = 0u32;

    loop {
        let started = Instant::now();
        match run_one_scan(&ctx).await {
            Ok(batch) => {
                consecutive_failures = 0;
                tracing::info!(
                    "[SCAN] scan complete: block={} vaults={} elapsed={:?}",
                    batch.block,
                    batch.summaries.len(),
                    started.elapsed()
                );
                publisher.publish(batch);
            }
            Err(err) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                tracing::warn!(
                    "[SCAN] scan iteration discarded ({} consecutive): {}",
                    consecutive_failures,
                    compact_error_message(&err.to_string(), 220)
                );
            }
        }

        let pacing = cfg.scan_min_interval.saturating_sub(started.elapsed());
        let wait = pacing.max(failure_backoff(&cfg, consecutive_failures));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("[SCAN] shutdown signal received; producer exiting.");
                return;
            }
        }
    }
}
