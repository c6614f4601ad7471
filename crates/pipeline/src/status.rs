//! Periodic system-status aggregate.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::job_events::SystemStatus;
use kiln_events::ProgressBroadcaster;
use tokio_util::sync::CancellationToken;

use crate::table::JobTable;

/// Current per-state job counts.
pub fn snapshot(table: &JobTable, worker_count: usize) -> SystemStatus {
    SystemStatus {
        counts: table.counts(),
        worker_count,
        timestamp: chrono::Utc::now(),
    }
}

/// Publish a [`SystemStatus`] every `interval` until `cancel` fires.
pub async fn run(
    table: Arc<JobTable>,
    broadcaster: ProgressBroadcaster,
    worker_count: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    tracing::info!(interval_secs = interval.as_secs(), "System status reporter started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("System status reporter stopping");
                break;
            }
            _ = ticker.tick() => {
                let status = snapshot(&table, worker_count);
                tracing::debug!(
                    active = status.counts.active(),
                    total = status.counts.total(),
                    "Publishing system status",
                );
                broadcaster.publish_system(status);
            }
        }
    }
}
