use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar;
use crate::limits::MAX_INTERVALS_PER_RESOURCE;
use crate::model::*;
use crate::observability::{outcome_label, BOOKINGS_TOTAL, SERIES_OCCURRENCES};

use super::conflict::{check_slot, now_ms, validate_instant, validate_span};
use super::lifecycle::initial_state;
use super::quota::{self, active_plan, MembershipStanding, QuotaTracker, UsageKind};
use super::recurrence::expand;
use super::scope::AccessContext;
use super::txn::Txn;
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub resource_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub start: Ms,
    /// Defaults to `start` plus the service duration.
    #[serde(default)]
    pub end: Option<Ms>,
    /// Explicit branch override.
    #[serde(default)]
    pub branch_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingOutcome {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub status: AppointmentStatus,
    pub deposit_cents: i64,
    pub hold_until: Option<Ms>,
    pub membership: Option<MembershipStanding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccurrenceInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecurringOutcome {
    pub series_id: Ulid,
    pub branch_id: Ulid,
    pub occurrences: Vec<OccurrenceInfo>,
    pub deposit_cents: i64,
    pub hold_until: Option<Ms>,
    pub membership: Option<MembershipStanding>,
}

impl BookingRequest {
    fn span(&self, service: &Service) -> Result<Span, EngineError> {
        let start = validate_instant(self.start)?;
        let end = match self.end {
            Some(end) => end,
            None => start + service.duration_ms(),
        };
        validate_span(start, end)
    }
}

impl Engine {
    /// Book one appointment: scope, then the availability guard, then the
    /// membership quota, all under the resource and customer locks.
    pub async fn book_single(
        &self,
        ctx: &AccessContext,
        req: BookingRequest,
    ) -> Result<BookingOutcome, EngineError> {
        let result = self.book_single_inner(ctx, req).await;
        metrics::counter!(BOOKINGS_TOTAL, "kind" => "single", "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn book_single_inner(
        &self,
        ctx: &AccessContext,
        req: BookingRequest,
    ) -> Result<BookingOutcome, EngineError> {
        let service = self.service(req.service_id)?;
        let span = req.span(&service)?;
        let cfg = self.config();
        let now = now_ms();

        let mut txn = Txn::new();
        txn.lock_resources(self, [req.resource_id]).await?;
        txn.lock_customers(self, [req.customer_id]).await?;

        let rs = txn.resource(req.resource_id)?;
        let branch_id = self.resolve_branch(ctx, req.branch_id, rs.info.branch_id)?;
        if rs.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        check_slot(&cfg, rs, &span, &[])?;

        let cs = txn.customer(req.customer_id)?;
        let membership = match active_plan(&cfg, cs, &self.plans, UsageKind::Appointment)? {
            Some((subscription, plan)) => {
                let standing = quota::standing(&plan, &subscription, now, cfg.utc_offset_minutes);
                quota::enforce_standing(&plan, &standing)?;
                QuotaTracker::new().admit_appointment(&plan, cs)?;
                Some(standing)
            }
            None => None,
        };

        let initial = initial_state(&cfg, &service, &cs.customer, now);
        let appointment = Appointment {
            id: Ulid::new(),
            customer_id: req.customer_id,
            resource_id: req.resource_id,
            service_id: req.service_id,
            branch_id,
            span,
            status: initial.status,
            deposit_cents: initial.deposit_cents,
            hold_until: initial.hold_until,
            series_id: None,
            recurrence: None,
            created_at: now,
        };
        let id = appointment.id;
        txn.stage(Event::AppointmentSaved { appointment, previous_resource: None });
        txn.commit(self).await?;

        info!(
            "booked {id} on {} [{}, {}) as {}",
            req.resource_id,
            span.start,
            span.end,
            initial.status.as_str()
        );
        Ok(BookingOutcome {
            id,
            branch_id,
            status: initial.status,
            deposit_cents: initial.deposit_cents,
            hold_until: initial.hold_until,
            membership,
        })
    }

    /// Book a weekly series. Every occurrence passes the same checks as a
    /// single booking inside one transaction; the first failure aborts the
    /// whole series and names the occurrence (1-based) that caused it.
    pub async fn book_recurring(
        &self,
        ctx: &AccessContext,
        req: BookingRequest,
        rule: RecurrenceRule,
    ) -> Result<RecurringOutcome, EngineError> {
        let result = self.book_recurring_inner(ctx, req, rule).await;
        metrics::counter!(BOOKINGS_TOTAL, "kind" => "recurring", "outcome" => outcome_label(&result))
            .increment(1);
        if let Ok(outcome) = &result {
            metrics::histogram!(SERIES_OCCURRENCES).record(outcome.occurrences.len() as f64);
        }
        result
    }

    async fn book_recurring_inner(
        &self,
        ctx: &AccessContext,
        req: BookingRequest,
        rule: RecurrenceRule,
    ) -> Result<RecurringOutcome, EngineError> {
        let service = self.service(req.service_id)?;
        let first = req.span(&service)?;
        let duration = first.duration_ms();
        let cfg = self.config();
        let offset = cfg.utc_offset_minutes;
        let buffer = cfg.buffer_ms();
        let now = now_ms();

        // Expansion happens before any lock: an oversized series fails with nothing touched.
        let starts = expand(first.start, &rule, cfg.max_occurrences, offset)?;

        let mut txn = Txn::new();
        txn.lock_resources(self, [req.resource_id]).await?;
        txn.lock_customers(self, [req.customer_id]).await?;

        let rs = txn.resource(req.resource_id)?;
        let branch_id = self.resolve_branch(ctx, req.branch_id, rs.info.branch_id)?;
        if rs.intervals.len() + starts.len() > MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        let cs = txn.customer(req.customer_id)?;
        let plan = active_plan(&cfg, cs, &self.plans, UsageKind::Appointment)?;
        let membership = match &plan {
            Some((subscription, plan)) => {
                let standing = quota::standing(plan, subscription, now, offset);
                quota::enforce_standing(plan, &standing)?;
                Some(standing)
            }
            None => None,
        };

        let ids: Vec<Ulid> = starts.iter().map(|_| Ulid::new()).collect();
        let mut spans: Vec<Span> = Vec::with_capacity(starts.len());
        let mut tracker = QuotaTracker::new();
        for (i, &start) in starts.iter().enumerate() {
            let at = |e: EngineError| e.at_occurrence(i + 1, start);
            let span = validate_span(start, start + duration).map_err(at)?;
            check_slot(&cfg, rs, &span, &[]).map_err(at)?;
            if let Some(prev) = spans.iter().position(|s| s.overlaps_with_buffer(&span, buffer)) {
                return Err(at(EngineError::OverlapConflict {
                    resource_id: req.resource_id,
                    conflicting_id: ids[prev],
                    start: spans[prev].start,
                }));
            }
            if let Some((_, plan)) = &plan {
                tracker.admit_appointment(plan, cs).map_err(at)?;
            }
            spans.push(span);
        }

        let series_id = Ulid::new();
        let snapshot = RecurrenceSnapshot {
            version: 1,
            rule,
            anchor: first.start,
            weekday: calendar::weekday(first.start, offset),
            time_of_day_minute: calendar::minute_of_day(first.start, offset),
            duration_ms: duration,
            resource_id: req.resource_id,
            service_id: Some(req.service_id),
        };
        let initial = initial_state(&cfg, &service, &cs.customer, now);

        // The series goes in first so every occurrence can reference it.
        txn.stage(Event::SeriesSaved {
            series: SeriesState {
                id: series_id,
                kind: SeriesKind::Appointments,
                customer_id: Some(req.customer_id),
                snapshot: snapshot.clone(),
                occurrences: ids.clone(),
            },
        });
        let mut occurrences = Vec::with_capacity(spans.len());
        for (i, (&id, &span)) in ids.iter().zip(&spans).enumerate() {
            txn.stage(Event::AppointmentSaved {
                appointment: Appointment {
                    id,
                    customer_id: req.customer_id,
                    resource_id: req.resource_id,
                    service_id: req.service_id,
                    branch_id,
                    span,
                    status: initial.status,
                    deposit_cents: initial.deposit_cents,
                    hold_until: initial.hold_until,
                    series_id: Some(series_id),
                    recurrence: (i == 0).then(|| snapshot.clone()),
                    created_at: now,
                },
                previous_resource: None,
            });
            occurrences.push(OccurrenceInfo { id, start: span.start, end: span.end, status: initial.status });
        }
        debug!("series {series_id}: staged {} events", txn.staged());
        txn.commit(self).await?;

        info!("booked series {series_id} with {} occurrences on {}", occurrences.len(), req.resource_id);
        Ok(RecurringOutcome {
            series_id,
            branch_id,
            occurrences,
            deposit_cents: initial.deposit_cents,
            hold_until: initial.hold_until,
            membership,
        })
    }
}
