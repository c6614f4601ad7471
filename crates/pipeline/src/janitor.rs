//! Retention cleanup for terminal jobs.
//!
//! Terminal jobs stay in memory for the retention window and are then
//! evicted; `get_status` falls back to the store after that. Stored records
//! are purged once they are older than [`STORE_RETENTION_FACTOR`] windows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::store::JobStore;
use crate::table::JobTable;

/// Stored records outlive the in-memory window by this factor.
pub const STORE_RETENTION_FACTOR: u32 = 24;

/// Sweep cadence: half the window, kept between 1 s and 60 s.
pub fn sweep_interval(retention: Duration) -> Duration {
    (retention / 2).clamp(Duration::from_secs(1), Duration::from_secs(60))
}

fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub async fn run(
    table: Arc<JobTable>,
    store: Option<Arc<dyn JobStore>>,
    retention: Duration,
    cancel: CancellationToken,
) {
    let interval = sweep_interval(retention);
    let memory_window = to_chrono(retention);
    let store_window = to_chrono(retention.saturating_mul(STORE_RETENTION_FACTOR));

    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Retention janitor started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Retention janitor stopping");
                break;
            }
            _ = ticker.tick() => {
                let now = Utc::now();

                let evicted = table.evict_completed_before(now - memory_window);
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted expired jobs from memory");
                }

                let Some(store) = &store else {
                    continue;
                };
                match store.purge_before(now - store_window).await {
                    Ok(0) => tracing::debug!("No stored jobs to purge"),
                    Ok(purged) => tracing::info!(purged, "Purged expired stored jobs"),
                    Err(e) => tracing::error!(error = %e, "Stored job purge failed"),
                }
            }
        }
    }
}
