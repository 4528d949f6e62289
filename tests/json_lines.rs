use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Weekday;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotwise::config::TenantConfig;
use slotwise::engine::AccessContext;
use slotwise::model::*;
use slotwise::tenant::TenantManager;
use slotwise::wire::{self, Response};

/// 2030-01-07T00:00:00Z, a Monday.
const MON: Ms = 1_893_974_400_000;
const HOUR: Ms = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn start_test_server(dir: PathBuf) -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, TenantConfig::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm).await;
            });
        }
    });

    (addr, tm)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    tenant: String,
    context: AccessContext,
}

impl Client {
    async fn connect(addr: SocketAddr, tenant: &str) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            tenant: tenant.to_string(),
            context: AccessContext::system(tenant),
        }
    }

    async fn call(&mut self, op: &str, args: Value) -> Response {
        let mut request = json!({ "tenant": self.tenant, "context": self.context, "op": op });
        if let (Some(obj), Value::Object(extra)) = (request.as_object_mut(), args) {
            obj.extend(extra);
        }
        self.framed.send(request.to_string()).await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("response timeout")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn ok(&mut self, op: &str, args: Value) -> Value {
        let resp = self.call(op, args).await;
        assert!(resp.ok, "{op} failed: {:?}", resp.error);
        resp.result.unwrap_or(Value::Null)
    }
}

struct Seeded {
    resource: Ulid,
    service: Ulid,
    customer: Ulid,
}

async fn seed(client: &mut Client) -> Seeded {
    let branch = Ulid::new();
    let resource = Ulid::new();
    let service = Ulid::new();
    let customer = Ulid::new();

    client
        .ok("create_branch", json!({ "branch": Branch { id: branch, name: "Centro".into(), primary: true } }))
        .await;
    client
        .ok(
            "create_resource",
            json!({ "resource": ResourceInfo { id: resource, branch_id: Some(branch), name: None, active: true } }),
        )
        .await;
    let mut week = WeeklySchedule::new();
    for day in [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri] {
        week = week.with_day(day, 9 * 60, 18 * 60);
    }
    client
        .ok("set_working_hours", json!({ "resource_id": resource, "schedule": week }))
        .await;
    client
        .ok(
            "create_service",
            json!({ "service": Service {
                id: service,
                name: "Corte".into(),
                duration_minutes: 60,
                price_cents: 5_000,
                deposit_percent: 0,
            } }),
        )
        .await;
    client
        .ok(
            "create_customer",
            json!({ "customer": Customer {
                id: customer,
                name: "Ana".into(),
                phone: "+54 11 4000-0000".into(),
                deposit_exempt: false,
            } }),
        )
        .await;

    Seeded { resource, service, customer }
}

fn booking(s: &Seeded, start: Ms) -> Value {
    json!({
        "resource_id": s.resource,
        "service_id": s.service,
        "customer_id": s.customer,
        "start": start,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_list_over_tcp() {
    let (addr, _tm) = start_test_server(test_dir()).await;
    let mut client = Client::connect(addr, "salon").await;
    let s = seed(&mut client).await;

    let booked = client
        .ok("book_single", json!({ "booking": booking(&s, MON + 10 * HOUR) }))
        .await;
    assert_eq!(booked["status"], json!(AppointmentStatus::Scheduled));
    let id = booked["id"].clone();

    let clash = client
        .call("book_single", json!({ "booking": booking(&s, MON + 10 * HOUR + 30 * 60_000) }))
        .await;
    assert!(!clash.ok);
    assert_eq!(clash.error.unwrap().code, "OVERLAP_CONFLICT");

    let listed = client.ok("list_appointments", json!({})).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], id);

    let free = client
        .ok("compute_availability", json!({ "resource_id": s.resource, "date": "2030-01-07" }))
        .await;
    assert_eq!(free.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn racing_connections_get_one_booking() {
    let (addr, _tm) = start_test_server(test_dir()).await;
    let mut setup = Client::connect(addr, "race").await;
    let s = seed(&mut setup).await;
    let request = json!({ "booking": booking(&s, MON + 14 * HOUR) });

    let mut handles = Vec::new();
    for _ in 0..8 {
        let request = request.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr, "race").await;
            client.call("book_single", request).await
        }));
    }

    let mut won = 0;
    for h in handles {
        let resp = h.await.unwrap();
        if resp.ok {
            won += 1;
        } else {
            assert_eq!(resp.error.unwrap().code, "OVERLAP_CONFLICT");
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test]
async fn recurring_failures_name_the_occurrence() {
    let (addr, _tm) = start_test_server(test_dir()).await;
    let mut client = Client::connect(addr, "series").await;
    let s = seed(&mut client).await;

    let too_many = client
        .call(
            "book_recurring",
            json!({ "booking": booking(&s, MON + 10 * HOUR), "rule": RecurrenceRule::weekly_count(27) }),
        )
        .await;
    assert_eq!(too_many.error.unwrap().code, "TOO_MANY_OCCURRENCES");

    client
        .ok(
            "add_time_off",
            json!({ "resource_id": s.resource, "start": MON + 14 * 24 * HOUR, "end": MON + 15 * 24 * HOUR }),
        )
        .await;
    let blocked = client
        .call(
            "book_recurring",
            json!({ "booking": booking(&s, MON + 10 * HOUR), "rule": RecurrenceRule::weekly_count(4) }),
        )
        .await;
    let err = blocked.error.unwrap();
    assert_eq!(err.code, "OVERLAP_CONFLICT");
    assert!(err.message.contains("occurrence #3"), "{}", err.message);

    let listed = client.ok("list_appointments", json!({})).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn committed_bookings_reach_listeners() {
    let (addr, tm) = start_test_server(test_dir()).await;
    let mut client = Client::connect(addr, "notify").await;
    let s = seed(&mut client).await;

    let engine = tm.get_or_create("notify").unwrap();
    let mut rx = engine.notify.subscribe(s.resource);

    client
        .ok("book_single", json!({ "booking": booking(&s, MON + 11 * HOUR) }))
        .await;
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification timeout")
        .unwrap();
    assert!(matches!(event, Event::AppointmentSaved { .. }));
}

#[tokio::test]
async fn tenants_survive_restart() {
    let dir = test_dir();
    let (addr, _tm) = start_test_server(dir.clone()).await;
    let mut client = Client::connect(addr, "durable").await;
    let s = seed(&mut client).await;
    let booked = client
        .ok("book_single", json!({ "booking": booking(&s, MON + 9 * HOUR) }))
        .await;

    // A second manager over the same directory replays the WAL.
    let (addr2, _tm2) = start_test_server(dir).await;
    let mut reopened = Client::connect(addr2, "durable").await;
    let fetched = reopened.ok("get_appointment", json!({ "id": booked["id"] })).await;
    assert_eq!(fetched["id"], booked["id"]);
    assert_eq!(fetched["span"]["start"], json!(MON + 9 * HOUR));
}

#[tokio::test]
async fn staff_limited_to_their_branch() {
    let (addr, _tm) = start_test_server(test_dir()).await;
    let mut owner = Client::connect(addr, "branches").await;
    let s = seed(&mut owner).await;
    owner
        .ok("book_single", json!({ "booking": booking(&s, MON + 10 * HOUR) }))
        .await;

    let mut clerk = Client::connect(addr, "branches").await;
    clerk.context = AccessContext {
        tenant_id: "branches".into(),
        user_id: "clerk".into(),
        role: slotwise::engine::Role::Staff,
        branch_access: slotwise::engine::BranchAccess::Custom(vec![Ulid::new()]),
    };
    let denied = clerk
        .call("book_single", json!({ "booking": booking(&s, MON + 12 * HOUR) }))
        .await;
    assert_eq!(denied.error.unwrap().code, "FORBIDDEN_BRANCH");
    let visible = clerk.ok("list_appointments", json!({})).await;
    assert!(visible.as_array().unwrap().is_empty());
}
