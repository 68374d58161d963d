//! Sentinel daemon: spawns the scan producer and drives the report gate
//! once per newly observed block.

use alloy::providers::Provider;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use vault_sentinel::batch_slot::BatchSlot;
use vault_sentinel::config::SentinelConfig;
use vault_sentinel::error::compact_error_message;
use vault_sentinel::fork::ForkSessionFactory;
use vault_sentinel::gate::ReportGate;
use vault_sentinel::producer::{run_scan_loop, ScanContext};
use vault_sentinel::ranking::RankingClient;
use vault_sentinel::registry::{build_provider, RegistryClient};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to `info` when RUST_LOG is unset or invalid to avoid a silent
    // startup.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = SentinelConfig::from_env()?;
    tracing::info!(
        "[STARTUP] registry={:#x} top_holders={} report_period={:?} scan_floor={:?}",
        cfg.registry_address,
        cfg.top_holder_count,
        cfg.report_period,
        cfg.scan_min_interval
    );

    let provider = build_provider(&cfg.eth_rpc_url)?;

    // Probe connectivity early so configuration failures surface immediately
    // instead of inside the first scan.
    let start_block = provider
        .get_block_number()
        .await
        .map_err(|e| anyhow::anyhow!("RPC probe failed: {}", compact_error_message(&e.to_string(), 220)))?;
    tracing::info!("[STARTUP] RPC reachable, head block {}", start_block);

    let ctx = Arc::new(ScanContext {
        registry: RegistryClient::new(provider.clone(), cfg.registry_address),
        ranking: RankingClient::new(
            cfg.subgraph_url.clone(),
            cfg.top_holder_count,
            cfg.subgraph_timeout,
        )?,
        factory: Arc::new(ForkSessionFactory::new(cfg.eth_rpc_url.clone())),
        max_concurrent_vaults: cfg.max_concurrent_vaults,
        provider: provider.clone(),
    });

    let (publisher, consumer) = BatchSlot::new();
    let mut gate = ReportGate::new(consumer, cfg.report_period.as_millis() as u64);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let producer_task = tokio::spawn(run_scan_loop(
        Arc::clone(&ctx),
        cfg.clone(),
        publisher,
        shutdown_tx.subscribe(),
    ));

    // One gate tick per newly observed block number.
    let mut last_seen_block = start_block;
    let mut poll = tokio::time::interval(cfg.block_poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let head = match provider.get_block_number().await {
                    Ok(head) => head,
                    Err(e) => {
                        tracing::warn!(
                            "[DRIVER] head poll failed: {}",
                            compact_error_message(&e.to_string(), 220)
                        );
                        continue;
                    }
                };
                if head <= last_seen_block {
                    continue;
                }
                last_seen_block = head;

                for alert in gate.on_tick(now_ms()) {
                    match serde_json::to_string(&alert) {
                        Ok(line) => println!("{line}"),
                        Err(e) => tracing::error!("[DRIVER] alert serialization failed: {e}"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("[DRIVER] ctrl-c received; shutting down.");
                let _ = shutdown_tx.send(());
                break;
            }
        }
    }

    let _ = producer_task.await;
    Ok(())
}
