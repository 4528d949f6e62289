//! JSON-lines front end: one request object per line in, one response
//! object per line out, answered in order on each connection.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::TenantConfig;
use crate::engine::{
    AccessContext, AppointmentChanges, AppointmentQuery, BookingRequest, ClassRequest, Engine,
    EngineError, SeriesScope,
};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{command_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::tenant::TenantManager;

/// One request line: `{"tenant": .., "context": {..}, "op": "..", ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub tenant: String,
    pub context: AccessContext,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    SetConfig { config: TenantConfig },
    CreateBranch { branch: Branch },
    CreateService { service: Service },
    CreateResource { resource: ResourceInfo },
    UpdateResource { resource: ResourceInfo },
    SetWorkingHours { resource_id: Ulid, schedule: WeeklySchedule },
    AddTimeOff { resource_id: Ulid, start: Ms, end: Ms },
    RemoveTimeOff { id: Ulid },
    CreateCustomer { customer: Customer },
    CreatePlan { plan: MembershipPlan },
    StartSubscription { customer_id: Ulid, plan_id: Ulid, started_at: Option<Ms> },
    CancelSubscription { customer_id: Ulid },
    RecordPayment { customer_id: Ulid, paid_at: Ms, next_charge_at: Option<Ms> },

    BookSingle { booking: BookingRequest },
    BookRecurring { booking: BookingRequest, rule: RecurrenceRule },
    RescheduleOrReassign { id: Ulid, changes: AppointmentChanges, scope: SeriesScope },
    CancelSeries { series_id: Ulid, scope: SeriesScope, pivot: Option<Ulid> },
    CancelAppointment { id: Ulid },
    RequestDeposit { id: Ulid, deposit_cents: i64 },
    ConfirmDeposit { id: Ulid },
    ConfirmAppointment { id: Ulid },
    CompleteAppointment { id: Ulid },
    DeleteAppointment { id: Ulid },

    ScheduleClass { class: ClassRequest },
    CancelClass { session_id: Ulid, scope: SeriesScope },
    Enroll {
        session_id: Ulid,
        customer_id: Ulid,
        #[serde(default)]
        repeat: bool,
    },
    CancelEnrollment { id: Ulid },
    MarkAttended { id: Ulid },

    GetAppointment { id: Ulid },
    ListAppointments {
        #[serde(default)]
        query: AppointmentQuery,
    },
    ComputeAvailability { resource_id: Ulid, date: NaiveDate, min_duration_ms: Option<Ms> },
    /// `now` defaults to the server clock.
    ExpiredHolds { now: Option<Ms> },
    SeriesSnapshot { series_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(result: Value) -> Self {
        Self { ok: true, result: Some(result), error: None }
    }

    fn failure(e: &RequestError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody { code: e.code().to_string(), message: e.to_string() }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(serde_json::Error),
    #[error("line longer than {} bytes", MAX_LINE_LEN)]
    LineTooLong,
    #[error("context tenant {context} does not match request tenant {tenant}")]
    TenantMismatch { tenant: String, context: String },
    #[error("tenant unavailable: {0}")]
    Tenant(io::Error),
    #[error("could not encode result: {0}")]
    Encode(serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RequestError {
    fn code(&self) -> &'static str {
        match self {
            RequestError::Malformed(_) => "BAD_REQUEST",
            RequestError::LineTooLong => "LINE_TOO_LONG",
            RequestError::TenantMismatch { .. } => "TENANT_MISMATCH",
            RequestError::Tenant(_) => "TENANT_UNAVAILABLE",
            RequestError::Encode(_) => "INTERNAL",
            RequestError::Engine(e) => e.code(),
        }
    }
}

fn encode<T: Serialize>(value: T) -> Result<Value, RequestError> {
    serde_json::to_value(value).map_err(RequestError::Encode)
}

fn server_now() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Run one command against a tenant's engine.
async fn dispatch(
    engine: &Engine,
    ctx: &AccessContext,
    command: Command,
) -> Result<Value, RequestError> {
    let value = match command {
        Command::SetConfig { config } => {
            ctx.require_full_access()?;
            encode(engine.set_config(config).await?)?
        }
        Command::CreateBranch { branch } => {
            ctx.require_full_access()?;
            let id = branch.id;
            engine.create_branch(branch).await?;
            encode(id)?
        }
        Command::CreateService { service } => {
            ctx.require_full_access()?;
            let id = service.id;
            engine.create_service(service).await?;
            encode(id)?
        }
        Command::CreateResource { resource } => {
            engine.require_branch_access(ctx, resource.branch_id)?;
            let id = resource.id;
            engine.create_resource(resource).await?;
            encode(id)?
        }
        Command::UpdateResource { resource } => {
            engine.require_resource_access(ctx, resource.id).await?;
            engine.require_branch_access(ctx, resource.branch_id)?;
            encode(engine.update_resource(resource).await?)?
        }
        Command::SetWorkingHours { resource_id, schedule } => {
            engine.require_resource_access(ctx, resource_id).await?;
            encode(engine.set_working_hours(resource_id, schedule).await?)?
        }
        Command::AddTimeOff { resource_id, start, end } => {
            engine.require_resource_access(ctx, resource_id).await?;
            encode(engine.add_time_off(resource_id, start, end).await?)?
        }
        Command::RemoveTimeOff { id } => {
            let resource_id =
                engine.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
            engine.require_resource_access(ctx, resource_id).await?;
            encode(engine.remove_time_off(id).await?)?
        }
        Command::CreateCustomer { customer } => {
            let id = customer.id;
            engine.create_customer(customer).await?;
            encode(id)?
        }
        Command::CreatePlan { plan } => {
            ctx.require_full_access()?;
            let id = plan.id;
            engine.create_plan(plan).await?;
            encode(id)?
        }
        Command::StartSubscription { customer_id, plan_id, started_at } => {
            encode(engine.start_subscription(customer_id, plan_id, started_at).await?)?
        }
        Command::CancelSubscription { customer_id } => {
            encode(engine.cancel_subscription(customer_id).await?)?
        }
        Command::RecordPayment { customer_id, paid_at, next_charge_at } => {
            encode(engine.record_payment(customer_id, paid_at, next_charge_at).await?)?
        }

        Command::BookSingle { booking } => encode(engine.book_single(ctx, booking).await?)?,
        Command::BookRecurring { booking, rule } => {
            encode(engine.book_recurring(ctx, booking, rule).await?)?
        }
        Command::RescheduleOrReassign { id, changes, scope } => {
            encode(engine.reschedule_or_reassign(ctx, id, changes, scope).await?)?
        }
        Command::CancelSeries { series_id, scope, pivot } => {
            encode(engine.cancel_series(ctx, series_id, scope, pivot).await?)?
        }
        Command::CancelAppointment { id } => encode(engine.cancel_appointment(ctx, id).await?)?,
        Command::RequestDeposit { id, deposit_cents } => {
            encode(engine.request_deposit(ctx, id, deposit_cents).await?)?
        }
        Command::ConfirmDeposit { id } => encode(engine.confirm_deposit(id).await?)?,
        Command::ConfirmAppointment { id } => encode(engine.confirm_appointment(ctx, id).await?)?,
        Command::CompleteAppointment { id } => {
            encode(engine.complete_appointment(ctx, id).await?)?
        }
        Command::DeleteAppointment { id } => encode(engine.delete_appointment(ctx, id).await?)?,

        Command::ScheduleClass { class } => encode(engine.schedule_class(ctx, class).await?)?,
        Command::CancelClass { session_id, scope } => {
            encode(engine.cancel_class(ctx, session_id, scope).await?)?
        }
        Command::Enroll { session_id, customer_id, repeat } => {
            encode(engine.enroll(ctx, session_id, customer_id, repeat).await?)?
        }
        Command::CancelEnrollment { id } => encode(engine.cancel_enrollment(ctx, id).await?)?,
        Command::MarkAttended { id } => encode(engine.mark_attended(ctx, id).await?)?,

        Command::GetAppointment { id } => encode(engine.get_appointment(ctx, id).await?)?,
        Command::ListAppointments { query } => {
            encode(engine.list_appointments(ctx, &query).await?)?
        }
        Command::ComputeAvailability { resource_id, date, min_duration_ms } => {
            engine.require_resource_access(ctx, resource_id).await?;
            encode(engine.compute_availability(resource_id, date, min_duration_ms).await?)?
        }
        Command::ExpiredHolds { now } => {
            encode(engine.expired_holds(now.unwrap_or_else(server_now)).await)?
        }
        Command::SeriesSnapshot { series_id } => encode(engine.series_snapshot(series_id).await?)?,
    };
    Ok(value)
}

/// Parse, route and run one request line.
pub async fn handle_line(tenants: &TenantManager, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            let err = RequestError::Malformed(e);
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => err.code()).increment(1);
            return Response::failure(&err);
        }
    };

    let op = command_label(&request.command);
    let started = Instant::now();
    let result = run(tenants, request).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

    match result {
        Ok(value) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            Response::success(value)
        }
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => e.code()).increment(1);
            debug!("{op} rejected: {} {e}", e.code());
            Response::failure(&e)
        }
    }
}

async fn run(tenants: &TenantManager, request: Request) -> Result<Value, RequestError> {
    if request.context.tenant_id != request.tenant {
        return Err(RequestError::TenantMismatch {
            tenant: request.tenant,
            context: request.context.tenant_id,
        });
    }
    let engine = tenants.get_or_create(&request.tenant).map_err(RequestError::Tenant)?;
    dispatch(&engine, &request.context, request.command).await
}

/// Serve one client until it disconnects. An oversized line is answered
/// with `LINE_TOO_LONG` and ends the connection.
pub async fn process_connection<S>(socket: S, tenants: Arc<TenantManager>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(next) = framed.next().await {
        let response = match next {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&tenants, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("dropping oversized request line");
                Response::failure(&RequestError::LineTooLong)
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        let encoded = serde_json::to_string(&response).map_err(io::Error::other)?;
        framed.send(encoded).await.map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            other => io::Error::other(other),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_wire").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn owner(tenant: &str) -> Value {
        json!({
            "tenant_id": tenant,
            "user_id": "u1",
            "role": "owner",
            "branch_access": { "mode": "all" }
        })
    }

    #[test]
    fn parse_flattened_command() {
        let line = json!({
            "tenant": "salon",
            "context": owner("salon"),
            "op": "cancel_series",
            "series_id": Ulid::nil(),
            "scope": "future",
        })
        .to_string();
        let req: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(req.tenant, "salon");
        assert_eq!(
            req.command,
            Command::CancelSeries { series_id: Ulid::nil(), scope: SeriesScope::Future, pivot: None }
        );
    }

    #[test]
    fn parse_custom_branch_access() {
        let branch = Ulid::new();
        let line = json!({
            "tenant": "salon",
            "context": {
                "tenant_id": "salon",
                "user_id": "u2",
                "role": "staff",
                "branch_access": { "mode": "custom", "branches": [branch] }
            },
            "op": "list_appointments",
        })
        .to_string();
        let req: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(req.context.branch_access, crate::engine::BranchAccess::Custom(vec![branch]));
        assert_eq!(req.command, Command::ListAppointments { query: AppointmentQuery::new() });
    }

    #[tokio::test]
    async fn connection_answers_line_by_line() {
        let tm = Arc::new(TenantManager::new(test_data_dir("conn"), 1000, TenantConfig::default()));
        let request = json!({
            "tenant": "salon",
            "context": owner("other"),
            "op": "expired_holds",
        })
        .to_string();
        let expected = concat!(
            r#"{"ok":false,"error":{"code":"TENANT_MISMATCH","#,
            r#""message":"context tenant other does not match request tenant salon"}}"#,
            "\n"
        );
        let mock = tokio_test::io::Builder::new()
            .read(format!("{request}\n\n").as_bytes())
            .write(expected.as_bytes())
            .build();
        process_connection(mock, tm).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_line_reports_bad_request() {
        let tm = TenantManager::new(test_data_dir("malformed"), 1000, TenantConfig::default());
        let resp = handle_line(&tm, "{not json").await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, "BAD_REQUEST");

        let resp = handle_line(&tm, r#"{"tenant":"a","context":{},"op":"nope"}"#).await;
        assert_eq!(resp.error.unwrap().code, "BAD_REQUEST");
    }

    #[tokio::test]
    async fn context_must_name_request_tenant() {
        let tm = TenantManager::new(test_data_dir("mismatch"), 1000, TenantConfig::default());
        let line = json!({
            "tenant": "salon",
            "context": owner("other"),
            "op": "expired_holds",
        })
        .to_string();
        let resp = handle_line(&tm, &line).await;
        assert_eq!(resp.error.unwrap().code, "TENANT_MISMATCH");
    }

    #[tokio::test]
    async fn engine_errors_carry_their_code() {
        let tm = TenantManager::new(test_data_dir("engine_err"), 1000, TenantConfig::default());
        let line = json!({
            "tenant": "salon",
            "context": owner("salon"),
            "op": "get_appointment",
            "id": Ulid::new(),
        })
        .to_string();
        let resp = handle_line(&tm, &line).await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, "NOT_FOUND");

        let line = json!({
            "tenant": "salon",
            "context": owner("salon"),
            "op": "expired_holds",
            "now": 0,
        })
        .to_string();
        let resp = handle_line(&tm, &line).await;
        assert!(resp.ok);
        assert_eq!(resp.result, Some(json!([])));
    }

    fn staff_of(tenant: &str, branch: Ulid) -> Value {
        json!({
            "tenant_id": tenant,
            "user_id": "clerk",
            "role": "staff",
            "branch_access": { "mode": "custom", "branches": [branch] }
        })
    }

    async fn call(tm: &TenantManager, context: Value, op: &str, args: Value) -> Response {
        let mut line = json!({ "tenant": "salon", "context": context, "op": op });
        if let (Some(obj), Value::Object(extra)) = (line.as_object_mut(), args) {
            obj.extend(extra);
        }
        handle_line(tm, &line.to_string()).await
    }

    #[tokio::test]
    async fn resource_writes_respect_branch_access() {
        let tm = TenantManager::new(test_data_dir("branch_scope"), 1000, TenantConfig::default());
        let (home, elsewhere, resource) = (Ulid::new(), Ulid::new(), Ulid::new());
        for branch in [home, elsewhere] {
            let branch = Branch { id: branch, name: "B".into(), primary: branch == home };
            assert!(call(&tm, owner("salon"), "create_branch", json!({ "branch": branch })).await.ok);
        }
        let info = ResourceInfo { id: resource, branch_id: Some(home), name: None, active: true };
        assert!(call(&tm, owner("salon"), "create_resource", json!({ "resource": info })).await.ok);

        let outsider = staff_of("salon", elsewhere);
        let (start, end): (Ms, Ms) = (1_893_974_400_000, 1_893_978_000_000);
        let schedule = WeeklySchedule::new();
        let denied = [
            ("set_working_hours", json!({ "resource_id": resource, "schedule": schedule })),
            ("add_time_off", json!({ "resource_id": resource, "start": start, "end": end })),
            ("update_resource", json!({ "resource": info })),
            ("compute_availability", json!({ "resource_id": resource, "date": "2030-01-07" })),
            ("set_config", json!({ "config": TenantConfig::default() })),
        ];
        for (op, args) in denied {
            let resp = call(&tm, outsider.clone(), op, args).await;
            assert_eq!(resp.error.map(|e| e.code), Some("FORBIDDEN_BRANCH".to_string()), "{op}");
        }

        let local = staff_of("salon", home);
        let resp = call(
            &tm,
            local,
            "compute_availability",
            json!({ "resource_id": resource, "date": "2030-01-07" }),
        )
        .await;
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.result, Some(json!([])));
    }
}
