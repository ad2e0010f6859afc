use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "medbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "medbook_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`ok` or a rejection reason code).
pub const BOOKINGS_TOTAL: &str = "medbook_bookings_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "medbook_cancellations_total";

/// Counter: appointments moved to completed by the background task.
pub const APPOINTMENTS_COMPLETED_TOTAL: &str = "medbook_appointments_completed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "medbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "medbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "medbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "medbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None; a
/// failed install is logged and the server runs without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertClinic { .. } => "insert_clinic",
        Command::InsertProvider { .. } => "insert_provider",
        Command::InsertPatient { .. } => "insert_patient",
        Command::InsertService { .. } => "insert_service",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::InsertAppointment { .. } => "book",
        Command::DeleteAppointment { .. } => "cancel",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectClinics => "select_clinics",
        Command::SelectServices { .. } => "select_services",
        Command::SelectProviders { .. } => "select_providers",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectProviderSchedule { .. } => "select_provider_schedule",
        Command::SelectAppointmentsOn { .. } => "select_appointments_on",
        Command::SelectMyAppointments => "select_my_appointments",
    }
}
