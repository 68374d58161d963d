use crate::alert::{build_alert, Alert};
use crate::batch_slot::BatchConsumer;

/// Level-triggered, coalescing report consumer. Driven once per external
/// tick; a tick before the report period has elapsed, or with nothing
/// published, is a pure no-op. When due, exactly the newest batch converts
/// to alerts, 1:1 and order-preserving.
pub struct ReportGate {
    consumer: BatchConsumer,
    period_ms: u64,
    last_report_ms: u64,
}

impl ReportGate {
    pub fn new(consumer: BatchConsumer, period_ms: u64) -> Self {
        Self {
            consumer,
            period_ms,
            last_report_ms: 0,
        }
    }

    pub fn last_report_ms(&self) -> u64 {
        self.last_report_ms
    }

    pub fn on_tick(&mut self, now_ms: u64) -> Vec<Alert> {
        // Tick timestamps are contractually non-decreasing; clamp anyway so a
        // misbehaving driver cannot push the gate backwards.
        let now_ms = now_ms.max(self.last_report_ms);
        if now_ms.saturating_sub(self.last_report_ms) < self.period_ms {
            return Vec::new();
        }

        let Some(batch) = self.consumer.take() else {
            // Nothing published since the last drain; leave the timer alone
            // so the next publication reports immediately.
            return Vec::new();
        };

        self.last_report_ms = now_ms;
        let alerts = batch
            .summaries
            .iter()
            .map(build_alert)
            .collect::<Vec<_>>();
        tracing::info!(
            "[REPORT] reporting scan batch from block {} ({} vaults)",
            batch.block,
            alerts.len()
        );
        alerts
    }
}
