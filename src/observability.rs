use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "toolsync_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "toolsync_query_duration_seconds";

/// Counter: rejected operations. Labels: kind (validation, conflict, ...), reason.
pub const REJECTIONS_TOTAL: &str = "toolsync_rejections_total";

// ── Booking core ────────────────────────────────────────────────

/// Counter: events committed to the WAL. Labels: kind.
pub const EVENTS_COMMITTED_TOTAL: &str = "toolsync_events_committed_total";

/// Counter: derived tool status transitions. Labels: from, to.
pub const STATUS_CHANGES_TOTAL: &str = "toolsync_status_changes_total";

/// Counter: activation sweeps run.
pub const ACTIVATION_RUNS_TOTAL: &str = "toolsync_activation_runs_total";

/// Counter: per-reservation activation outcomes. Labels: outcome (activated, skipped).
pub const ACTIVATIONS_TOTAL: &str = "toolsync_activations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "toolsync_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "toolsync_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "toolsync_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "toolsync_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "toolsync_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "toolsync_wal_compactions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTool { .. } => "create_tool",
        Command::UpdateTool { .. } => "update_tool",
        Command::DeleteTool { .. } => "delete_tool",
        Command::SetMaintenance { .. } => "set_maintenance",
        Command::InsertUser { .. } => "register_user",
        Command::InsertAllocation { .. } => "borrow",
        Command::InsertReturn { .. } => "return",
        Command::InsertReturnRequest { .. } => "request_return",
        Command::DeleteReturnRequest { .. } => "decline_return",
        Command::InsertReservation { .. } => "reserve",
        Command::DeleteReservation { .. } => "cancel_reservation",
        Command::ApproveReservation { .. } => "approve_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::DeclineReservation { .. } => "decline_reservation",
        Command::Activate { .. } => "activate",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectTools { .. } => "select_tools",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUsers => "select_users",
        Command::SelectOverdue { .. } => "select_overdue",
        Command::SelectDashboard { .. } => "select_dashboard",
    }
}

/// Count a rejected operation and log it at debug.
pub fn record_rejection(command: &'static str, err: &EngineError) {
    let (kind, reason) = match err {
        EngineError::Validation(_) => ("validation", "invalid_input"),
        EngineError::NotFound { entity, .. } => ("not_found", *entity),
        EngineError::Conflict(reason) => ("conflict", reason.label()),
        EngineError::Unauthorized(_) => ("unauthorized", "role"),
        EngineError::LimitExceeded(what) => ("limit", *what),
        EngineError::WalError(_) => ("storage", "wal"),
    };
    metrics::counter!(REJECTIONS_TOTAL, "kind" => kind, "reason" => reason).increment(1);
    tracing::debug!(command, kind, reason, error = %err, "operation rejected");
}
