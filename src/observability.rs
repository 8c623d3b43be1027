use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: façade operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "scheduler_operations_total";

/// Histogram: façade operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "scheduler_operation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots currently claimed by scheduled appointments.
pub const ACTIVE_CLAIMS: &str = "scheduler_active_claims";

/// Counter: claims released because the operation that took them did not commit.
pub const CLAIM_ROLLBACKS_TOTAL: &str = "scheduler_claim_rollbacks_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "scheduler_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "scheduler_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install the fmt subscriber. A subscriber already set by the host is kept.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}
