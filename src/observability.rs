use std::net::SocketAddr;

// ── Request-driven ───────────────────────────────────────────────

/// Counter: reservation operations. Labels: op, outcome.
pub const RESERVATIONS_TOTAL: &str = "deskbook_reservations_total";

/// Counter: availability rejections. Labels: phase (`fast` | `authoritative`).
pub const CONFLICTS_TOTAL: &str = "deskbook_conflicts_total";

/// Counter: policy rejections. Labels: reason.
pub const VALIDATION_FAILURES_TOTAL: &str = "deskbook_validation_failures_total";

/// Counter: creations answered from the idempotency cache.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "deskbook_idempotent_replays_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: reservations transitioned to no_show.
pub const NO_SHOWS_TOTAL: &str = "deskbook_no_shows_total";

/// Histogram: duration of one no-show sweep in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "deskbook_sweep_duration_seconds";

/// Counter: idempotency records dropped by cleanup.
pub const IDEMPOTENCY_PURGED_TOTAL: &str = "deskbook_idempotency_purged_total";

/// Counter: reservations force-cancelled by a maintenance cascade.
pub const MAINTENANCE_CANCELLATIONS_TOTAL: &str = "deskbook_maintenance_cancellations_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
