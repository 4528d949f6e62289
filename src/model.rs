use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::TenantConfig;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;
pub const WEEK_MS: Ms = 7 * DAY_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap test where both sides are padded by `buffer` of idle time.
    pub fn overlaps_with_buffer(&self, other: &Span, buffer: Ms) -> bool {
        other.start < self.end + buffer && other.end + buffer > self.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn shifted(&self, delta: Ms) -> Span {
        Span::new(self.start + delta, self.end + delta)
    }
}

// ── Weekly working hours ─────────────────────────────────────────

/// Opening window for one weekday, in minutes from local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub open_minute: u32,
    pub close_minute: u32,
}

/// At most one window per weekday; `None` is a day off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    days: [Option<DayWindow>; 7],
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, day: Weekday, open_minute: u32, close_minute: u32) -> Self {
        self.set(day, Some(DayWindow { open_minute, close_minute }));
        self
    }

    pub fn set(&mut self, day: Weekday, window: Option<DayWindow>) {
        self.days[day.num_days_from_monday() as usize] = window;
    }

    pub fn window(&self, day: Weekday) -> Option<DayWindow> {
        self.days[day.num_days_from_monday() as usize]
    }

    pub fn windows(&self) -> impl Iterator<Item = (Weekday, DayWindow)> + '_ {
        self.days.iter().enumerate().filter_map(|(i, w)| {
            w.map(|w| (Weekday::try_from(i as u8).unwrap_or(Weekday::Mon), w))
        })
    }
}

// ── Resource interval index ──────────────────────────────────────

/// What occupies a slice of a resource's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    /// Hard blackout window.
    TimeOff,
    /// An appointment in a blocking status.
    Appointment,
    /// A scheduled class session.
    Class,
}

/// A single blocking entry on a resource's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub branch_id: Option<Ulid>,
    pub name: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub info: ResourceInfo,
    pub working_hours: WeeklySchedule,
    /// Blocking entries only, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    pub appointments: HashMap<Ulid, Appointment>,
    pub sessions: HashMap<Ulid, ClassSession>,
    pub enrollments: HashMap<Ulid, Enrollment>,
}

impl ResourceState {
    pub fn new(info: ResourceInfo) -> Self {
        Self {
            info,
            working_hours: WeeklySchedule::default(),
            intervals: Vec::new(),
            appointments: HashMap::new(),
            sessions: HashMap::new(),
            enrollments: HashMap::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.info.id
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    /// Store an appointment record and keep the interval index in step with its status.
    pub fn upsert_appointment(&mut self, appointment: Appointment) {
        self.remove_interval(appointment.id);
        if appointment.status.is_blocking() {
            self.insert_interval(Interval {
                id: appointment.id,
                span: appointment.span,
                kind: IntervalKind::Appointment,
            });
        }
        self.appointments.insert(appointment.id, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        self.remove_interval(id);
        self.appointments.remove(&id)
    }

    pub fn upsert_session(&mut self, session: ClassSession) {
        self.remove_interval(session.id);
        if session.status == SessionStatus::Scheduled {
            self.insert_interval(Interval {
                id: session.id,
                span: session.span,
                kind: IntervalKind::Class,
            });
        }
        self.sessions.insert(session.id, session);
    }

    /// Enrollments that hold a seat (reserved or attended).
    pub fn seats_taken(&self, session_id: Ulid) -> u32 {
        self.enrollments
            .values()
            .filter(|e| e.session_id == session_id && e.status.holds_seat())
            .count() as u32
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Ulid,
    pub name: String,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
    /// Share of the price collected up front, 0–100.
    pub deposit_percent: u8,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    /// Normalized: digits with an optional leading `+`.
    pub phone: String,
    pub deposit_exempt: bool,
}

/// Strip formatting from a phone number so lookups are stable.
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut out = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        out.push('+');
    }
    out.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    out
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    PendingDeposit,
    DepositPaid,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Blocking statuses count toward overlap and quota checks.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::PendingDeposit | Self::DepositPaid | Self::Confirmed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::PendingDeposit => "pending_deposit",
            Self::DepositPaid => "deposit_paid",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub resource_id: Ulid,
    pub service_id: Ulid,
    pub branch_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub deposit_cents: i64,
    pub hold_until: Option<Ms>,
    pub series_id: Option<Ulid>,
    /// Only set on the first occurrence of a series.
    pub recurrence: Option<RecurrenceSnapshot>,
    pub created_at: Ms,
}

// ── Recurrence ───────────────────────────────────────────────────

/// Every `interval_weeks` weeks, until `count` occurrences or the local date `until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub interval_weeks: u32,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub until: Option<NaiveDate>,
}

impl RecurrenceRule {
    pub fn weekly_count(count: u32) -> Self {
        Self { interval_weeks: 1, count: Some(count), until: None }
    }
}

/// Self-describing recurrence parameters. Series mutations compute from this
/// value, never from whichever row happens to be edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceSnapshot {
    pub version: u32,
    pub rule: RecurrenceRule,
    /// Start of the first occurrence the current parameters apply from.
    pub anchor: Ms,
    pub weekday: Weekday,
    pub time_of_day_minute: u32,
    pub duration_ms: Ms,
    pub resource_id: Ulid,
    pub service_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    Appointments,
    Classes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesState {
    pub id: Ulid,
    pub kind: SeriesKind,
    pub customer_id: Option<Ulid>,
    pub snapshot: RecurrenceSnapshot,
    /// Occurrence ids in chronological order of creation.
    pub occurrences: Vec<Ulid>,
}

// ── Classes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub branch_id: Ulid,
    pub name: String,
    pub span: Span,
    pub capacity: u32,
    pub status: SessionStatus,
    pub series_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Reserved,
    Attended,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn holds_seat(self) -> bool {
        matches!(self, Self::Reserved | Self::Attended)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Ulid,
    pub session_id: Ulid,
    pub customer_id: Ulid,
    pub status: EnrollmentStatus,
    pub session_start: Ms,
}

// ── Memberships ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Months(u32),
    Days(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestPolicy {
    None,
    /// Whole percent of the plan price.
    Percent(u32),
    FixedCents(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPlan {
    pub id: Ulid,
    pub name: String,
    pub price_cents: i64,
    pub max_active_appointments: Option<u32>,
    pub max_classes_per_week: Option<u32>,
    pub max_classes_per_month: Option<u32>,
    pub billing: BillingCycle,
    /// Day of month charges fall on, for monthly cycles.
    pub billing_day: Option<u32>,
    pub grace_days: u32,
    pub interest: InterestPolicy,
    pub auto_block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub plan_id: Ulid,
    pub status: SubscriptionStatus,
    pub started_at: Ms,
    pub last_payment_at: Option<Ms>,
    pub next_charge_at: Option<Ms>,
}

/// Per-customer ledger read by the quota gate.
#[derive(Debug, Clone)]
pub struct CustomerState {
    pub customer: Customer,
    pub subscription: Option<Subscription>,
    /// Appointments currently in a blocking status.
    pub active_appointments: HashSet<Ulid>,
    /// Enrollment id → (session start, status).
    pub enrollments: HashMap<Ulid, (Ms, EnrollmentStatus)>,
}

impl CustomerState {
    pub fn new(customer: Customer) -> Self {
        Self {
            customer,
            subscription: None,
            active_appointments: HashSet::new(),
            enrollments: HashMap::new(),
        }
    }

    pub fn active_subscription(&self) -> Option<&Subscription> {
        self.subscription
            .as_ref()
            .filter(|s| s.status == SubscriptionStatus::Active)
    }

    pub fn track_appointment(&mut self, appointment: &Appointment) {
        if appointment.status.is_blocking() {
            self.active_appointments.insert(appointment.id);
        } else {
            self.active_appointments.remove(&appointment.id);
        }
    }
}

/// The event types: flat, no nesting. This is the WAL record format; one
/// committed transaction is written as one `Vec<Event>` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ConfigUpdated {
        config: TenantConfig,
    },
    BranchCreated {
        branch: Branch,
    },
    ServiceCreated {
        service: Service,
    },
    ResourceCreated {
        resource: ResourceInfo,
    },
    ResourceUpdated {
        resource: ResourceInfo,
    },
    WorkingHoursSet {
        resource_id: Ulid,
        schedule: WeeklySchedule,
    },
    TimeOffAdded {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
    },
    TimeOffRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    CustomerCreated {
        customer: Customer,
    },
    PlanCreated {
        plan: MembershipPlan,
    },
    SubscriptionSaved {
        subscription: Subscription,
    },
    SeriesSaved {
        series: SeriesState,
    },
    AppointmentSaved {
        appointment: Appointment,
        /// Set when the appointment moved off another resource.
        previous_resource: Option<Ulid>,
    },
    AppointmentDeleted {
        id: Ulid,
        resource_id: Ulid,
        customer_id: Ulid,
    },
    SessionSaved {
        session: ClassSession,
    },
    EnrollmentSaved {
        enrollment: Enrollment,
        resource_id: Ulid,
    },
}

impl Event {
    /// Resource whose listeners care about this event.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::ResourceCreated { resource } | Event::ResourceUpdated { resource } => {
                Some(resource.id)
            }
            Event::WorkingHoursSet { resource_id, .. }
            | Event::TimeOffAdded { resource_id, .. }
            | Event::TimeOffRemoved { resource_id, .. }
            | Event::AppointmentDeleted { resource_id, .. }
            | Event::EnrollmentSaved { resource_id, .. } => Some(*resource_id),
            Event::AppointmentSaved { appointment, .. } => Some(appointment.resource_id),
            Event::SessionSaved { session } => Some(session.resource_id),
            Event::ConfigUpdated { .. }
            | Event::BranchCreated { .. }
            | Event::ServiceCreated { .. }
            | Event::CustomerCreated { .. }
            | Event::PlanCreated { .. }
            | Event::SubscriptionSaved { .. }
            | Event::SeriesSaved { .. } => None,
        }
    }
}
