use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotkeeper_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotkeeper_wal_compactions_total";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "slotkeeper_reservations_created_total";

/// Counter: bookings refused because the slot was already held.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "slotkeeper_reservation_conflicts_total";

/// Counter: freshly drawn booking codes that were already issued.
pub const BOOKING_CODE_COLLISIONS_TOTAL: &str = "slotkeeper_booking_code_collisions_total";

/// Counter: applied status transitions. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "slotkeeper_status_transitions_total";

/// Counter: store reads retried after a transient failure. Labels: op.
pub const STORE_READ_RETRIES_TOTAL: &str = "slotkeeper_store_read_retries_total";

/// Counter: guest notifications that failed to deliver. Labels: channel.
pub const NOTIFY_FAILURES_TOTAL: &str = "slotkeeper_notify_failures_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is `None`.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterResource { .. } => "register_resource",
        Command::SetSchedule { .. } => "set_schedule",
        Command::AddPriceRanges { .. } => "add_price_ranges",
        Command::ClearSchedule { .. } => "clear_schedule",
        Command::SelectAvailability { .. } => "select_availability",
        Command::CreateReservation(_) => "create_reservation",
        Command::TransitionStatus { .. } => "transition_status",
        Command::FindReservation { .. } => "find_reservation",
        Command::GetReservation { .. } => "get_reservation",
        Command::ListReservations(_) => "list_reservations",
    }
}
