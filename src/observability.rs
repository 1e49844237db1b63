use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bayflow_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bayflow_query_duration_seconds";

/// Counter: workflow errors by stable code. Labels: code.
pub const WORKFLOW_ERRORS_TOTAL: &str = "bayflow_workflow_errors_total";

/// Counter: two-write operations that stopped after the first write. Labels: operation.
pub const PARTIAL_SUCCESS_TOTAL: &str = "bayflow_partial_success_total";

// ── Workflow events ─────────────────────────────────────────────

/// Counter: appointments seated at a bay.
pub const BAY_ASSIGNMENTS_TOTAL: &str = "bayflow_bay_assignments_total";

/// Counter: bays released. Labels: cause (staff, completion, reconcile).
pub const BAY_RELEASES_TOTAL: &str = "bayflow_bay_releases_total";

/// Counter: appointment status changes. Labels: to.
pub const APPOINTMENT_TRANSITIONS_TOTAL: &str = "bayflow_appointment_transitions_total";

/// Counter: notifications that could not be stored.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "bayflow_notifications_failed_total";

/// Counter: mismatches healed by the reconciliation sweep. Labels: action.
pub const RECONCILE_HEALS_TOTAL: &str = "bayflow_reconcile_heals_total";

/// Gauge: in-progress appointments with no bay, older than the stale threshold.
pub const STUCK_APPOINTMENTS: &str = "bayflow_stuck_appointments";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bayflow_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bayflow_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bayflow_connections_rejected_total";

/// Counter: startup/auth failures. Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "bayflow_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bayflow_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bayflow_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::BookAppointment(_) => "book_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::GetAppointment { .. } => "get_appointment",
        Command::SetAppointmentStatus { .. } => "set_appointment_status",
        Command::InsertBay(_) => "insert_bay",
        Command::SelectBays { .. } => "select_bays",
        Command::GetBay { .. } => "get_bay",
        Command::UpdateBay { .. } => "update_bay",
        Command::DeleteBay { .. } => "delete_bay",
        Command::InsertProgress(_) => "insert_progress",
        Command::SelectProgress { .. } => "select_progress",
        Command::UpdateProgress { .. } => "update_progress",
        Command::DeleteProgress { .. } => "delete_progress",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::MarkNotificationRead { .. } => "mark_notification_read",
    }
}
