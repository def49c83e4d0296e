use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

// ── Booking lifecycle ───────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "roombook_bookings_created_total";

pub const APPROVALS_TOTAL: &str = "roombook_approvals_total";

/// Counter: requests refused because of approved overlaps. Labels: operation.
pub const CONFLICTS_DETECTED_TOTAL: &str = "roombook_conflicts_detected_total";

/// Counter: approved bookings cancelled by a priority override.
pub const OVERRIDES_TOTAL: &str = "roombook_overrides_total";

// ── Retention cleanup ───────────────────────────────────────────

/// Counter: cleanup runs. Labels: outcome (completed, skipped, failed).
pub const CLEANUP_RUNS_TOTAL: &str = "roombook_cleanup_runs_total";

/// Counter: bookings purged by cleanup. Labels: status.
pub const CLEANUP_DELETED_TOTAL: &str = "roombook_cleanup_deleted_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking(_) => "insert_booking",
        Command::Approve { .. } => "approve",
        Command::Reject { .. } => "reject",
        Command::Cancel { .. } => "cancel",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectCleanupStatus => "select_cleanup_status",
        Command::SetCleanupEnabled { .. } => "set_cleanup_enabled",
        Command::RunCleanup { .. } => "run_cleanup",
    }
}
