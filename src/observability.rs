use std::net::SocketAddr;

// ── Allocation ──────────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "loadout_reservations_created_total";

/// Counter: reservations deleted by shrink/release.
pub const RESERVATIONS_RELEASED_TOTAL: &str = "loadout_reservations_released_total";

/// Counter: failed allocation or lifecycle operations. Labels: operation, reason.
pub const ALLOCATION_FAILURES_TOTAL: &str = "loadout_allocation_failures_total";

/// Counter: availability checks. Labels: severity.
pub const AVAILABILITY_CHECKS_TOTAL: &str = "loadout_availability_checks_total";

// ── Workflow ────────────────────────────────────────────────────

/// Counter: scan-lists completed. Labels: direction.
pub const SCAN_LISTS_COMPLETED_TOTAL: &str = "loadout_scan_lists_completed_total";

/// Counter: tasks completed.
pub const TASKS_COMPLETED_TOTAL: &str = "loadout_tasks_completed_total";

/// Counter: notification intents the dispatcher refused. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "loadout_notifications_failed_total";

// ── Persistence ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "loadout_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "loadout_wal_flush_batch_size";

/// Gauge: organizations with a loaded engine.
pub const ORGS_ACTIVE: &str = "loadout_orgs_active";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record a failed engine operation.
pub fn record_failure(operation: &'static str, err: &crate::engine::EngineError) {
    metrics::counter!(
        ALLOCATION_FAILURES_TOTAL,
        "operation" => operation,
        "reason" => err.label()
    )
    .increment(1);
}
