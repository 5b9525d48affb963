use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "campusd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "campusd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "campusd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "campusd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "campusd_connections_rejected_total";

/// Gauge: number of open campuses (loaded ledgers).
pub const CAMPUSES_ACTIVE: &str = "campusd_campuses_active";

/// Counter: sessions whose user could not be resolved to a principal.
pub const AUTH_FAILURES_TOTAL: &str = "campusd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "campusd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "campusd_wal_flush_batch_size";

// ── Ledger ──────────────────────────────────────────────────────

/// Counter: committed ledger events. Labels: kind.
pub const LEDGER_EVENTS_TOTAL: &str = "campusd_ledger_events_total";

/// Counter: waitlist entries promoted by cancellations.
pub const PROMOTIONS_TOTAL: &str = "campusd_promotions_total";

/// Counter: audit records emitted. Labels: action.
pub const AUDIT_RECORDS_TOTAL: &str = "campusd_audit_records_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertApproval { .. } => "insert_approval",
        Command::DeleteWaitlist { .. } => "delete_waitlist",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectFacilities => "select_facilities",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
