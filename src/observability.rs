use std::net::SocketAddr;

use crate::wire::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotwise_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotwise_request_duration_seconds";

/// Counter: booking attempts. Labels: kind (single, recurring, class, enrollment), outcome.
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Histogram: occurrences written by one recurring booking or series mutation.
pub const SERIES_OCCURRENCES: &str = "slotwise_series_occurrences";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotwise_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

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

/// Outcome label for a booking-style result: "ok" or the error code.
pub fn outcome_label<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SetConfig { .. } => "set_config",
        Command::CreateBranch { .. } => "create_branch",
        Command::CreateService { .. } => "create_service",
        Command::CreateResource { .. } => "create_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SetWorkingHours { .. } => "set_working_hours",
        Command::AddTimeOff { .. } => "add_time_off",
        Command::RemoveTimeOff { .. } => "remove_time_off",
        Command::CreateCustomer { .. } => "create_customer",
        Command::CreatePlan { .. } => "create_plan",
        Command::StartSubscription { .. } => "start_subscription",
        Command::CancelSubscription { .. } => "cancel_subscription",
        Command::RecordPayment { .. } => "record_payment",
        Command::BookSingle { .. } => "book_single",
        Command::BookRecurring { .. } => "book_recurring",
        Command::RescheduleOrReassign { .. } => "reschedule_or_reassign",
        Command::CancelSeries { .. } => "cancel_series",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::RequestDeposit { .. } => "request_deposit",
        Command::ConfirmDeposit { .. } => "confirm_deposit",
        Command::ConfirmAppointment { .. } => "confirm_appointment",
        Command::CompleteAppointment { .. } => "complete_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::ScheduleClass { .. } => "schedule_class",
        Command::CancelClass { .. } => "cancel_class",
        Command::Enroll { .. } => "enroll",
        Command::CancelEnrollment { .. } => "cancel_enrollment",
        Command::MarkAttended { .. } => "mark_attended",
        Command::GetAppointment { .. } => "get_appointment",
        Command::ListAppointments { .. } => "list_appointments",
        Command::ComputeAvailability { .. } => "compute_availability",
        Command::ExpiredHolds { .. } => "expired_holds",
        Command::SeriesSnapshot { .. } => "series_snapshot",
    }
}
