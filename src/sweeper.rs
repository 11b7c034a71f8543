use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability::IDEMPOTENCY_PURGED_TOTAL;
use crate::service::ReservationService;

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Background task that marks missed reservations as no-shows.
pub async fn run_sweeper(service: Arc<ReservationService>, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        service.sweep_no_shows().await;
    }
}

/// Background task that drops expired idempotency records.
pub async fn run_idempotency_cleanup(service: Arc<ReservationService>, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        let purged = service.purge_idempotency();
        if purged > 0 {
            metrics::counter!(IDEMPOTENCY_PURGED_TOTAL).increment(purged as u64);
            debug!(purged, "idempotency records purged");
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = ticker(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => warn!(error = %e, "WAL compaction failed"),
        }
    }
}
