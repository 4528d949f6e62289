use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::calendar;
use crate::limits::{MAX_CLASS_CAPACITY, MAX_INTERVALS_PER_RESOURCE, MAX_NAME_LEN};
use crate::model::*;
use crate::observability::{outcome_label, BOOKINGS_TOTAL};

use super::conflict::{check_slot, now_ms, validate_span};
use super::quota::{self, active_plan, MembershipStanding, QuotaTracker, UsageKind};
use super::recurrence::expand;
use super::scope::AccessContext;
use super::series::SeriesScope;
use super::txn::Txn;
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRequest {
    pub resource_id: Ulid,
    pub name: String,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    #[serde(default)]
    pub branch_id: Option<Ulid>,
    #[serde(default)]
    pub recurrence: Option<RecurrenceRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassOutcome {
    pub series_id: Option<Ulid>,
    pub branch_id: Ulid,
    pub session_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollOutcome {
    pub enrollment_ids: Vec<Ulid>,
    pub membership: Option<MembershipStanding>,
}

impl Engine {
    /// Put a class on a resource's calendar, optionally as a weekly series.
    /// Sessions obey the same working-hours and overlap guard as appointments.
    pub async fn schedule_class(
        &self,
        ctx: &AccessContext,
        req: ClassRequest,
    ) -> Result<ClassOutcome, EngineError> {
        if req.capacity == 0 || req.capacity > MAX_CLASS_CAPACITY {
            return Err(EngineError::LimitExceeded("class capacity out of range"));
        }
        if req.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("class name too long"));
        }
        let first = validate_span(req.start, req.end)?;
        let cfg = self.config();
        let offset = cfg.utc_offset_minutes;
        let buffer = cfg.buffer_ms();

        let starts = match &req.recurrence {
            Some(rule) => expand(first.start, rule, cfg.max_occurrences, offset)?,
            None => vec![first.start],
        };
        let recurring = req.recurrence.is_some();

        let mut txn = Txn::new();
        txn.lock_resources(self, [req.resource_id]).await?;
        let rs = txn.resource(req.resource_id)?;
        let branch_id = self.resolve_branch(ctx, req.branch_id, rs.info.branch_id)?;
        if rs.intervals.len() + starts.len() > MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }

        let ids: Vec<Ulid> = starts.iter().map(|_| Ulid::new()).collect();
        let mut spans: Vec<Span> = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let at = |e: EngineError| if recurring { e.at_occurrence(i + 1, start) } else { e };
            let span = validate_span(start, start + first.duration_ms()).map_err(at)?;
            check_slot(&cfg, rs, &span, &[]).map_err(at)?;
            if let Some(prev) = spans.iter().position(|s| s.overlaps_with_buffer(&span, buffer)) {
                return Err(at(EngineError::OverlapConflict {
                    resource_id: req.resource_id,
                    conflicting_id: ids[prev],
                    start: spans[prev].start,
                }));
            }
            spans.push(span);
        }

        let series_id = req.recurrence.map(|rule| {
            let id = Ulid::new();
            txn.stage(Event::SeriesSaved {
                series: SeriesState {
                    id,
                    kind: SeriesKind::Classes,
                    customer_id: None,
                    snapshot: RecurrenceSnapshot {
                        version: 1,
                        rule,
                        anchor: first.start,
                        weekday: calendar::weekday(first.start, offset),
                        time_of_day_minute: calendar::minute_of_day(first.start, offset),
                        duration_ms: first.duration_ms(),
                        resource_id: req.resource_id,
                        service_id: None,
                    },
                    occurrences: ids.clone(),
                },
            });
            id
        });
        for (&id, &span) in ids.iter().zip(&spans) {
            txn.stage(Event::SessionSaved {
                session: ClassSession {
                    id,
                    resource_id: req.resource_id,
                    branch_id,
                    name: req.name.clone(),
                    span,
                    capacity: req.capacity,
                    status: SessionStatus::Scheduled,
                    series_id,
                },
            });
        }
        txn.commit(self).await?;

        info!("scheduled {} session(s) of '{}' on {}", ids.len(), req.name, req.resource_id);
        Ok(ClassOutcome { series_id, branch_id, session_ids: ids })
    }

    /// Cancel a session, or sessions of its series per `scope`, releasing
    /// their reserved seats. Returns the number of sessions cancelled.
    pub async fn cancel_class(
        &self,
        ctx: &AccessContext,
        session_id: Ulid,
        scope: SeriesScope,
    ) -> Result<usize, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let series_id = {
            let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.read().await;
            guard.sessions.get(&session_id).ok_or(EngineError::NotFound(session_id))?.series_id
        };

        let mut txn = Txn::new();
        let members = match series_id {
            Some(sid) if scope != SeriesScope::This => {
                txn.lock_series(self, sid).await?;
                txn.series(sid)?.occurrences.clone()
            }
            _ => vec![session_id],
        };
        let mut resource_ids: Vec<Ulid> =
            members.iter().filter_map(|m| self.get_resource_for_entity(m)).collect();
        resource_ids.push(resource_id);
        txn.lock_resources(self, resource_ids.clone()).await?;

        let mut sessions: Vec<ClassSession> = Vec::new();
        for rid in &resource_ids {
            let rs = txn.resource(*rid)?;
            sessions.extend(members.iter().filter_map(|m| rs.sessions.get(m).cloned()));
        }
        sessions.sort_by_key(|s| s.span.start);
        sessions.dedup_by_key(|s| s.id);
        let pivot_start = sessions
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.span.start)
            .ok_or(EngineError::NotFound(session_id))?;
        sessions.retain(|s| {
            s.status == SessionStatus::Scheduled
                && match scope {
                    SeriesScope::This => s.id == session_id,
                    SeriesScope::Future => s.span.start >= pivot_start,
                    SeriesScope::All => true,
                }
        });

        let mut released: Vec<(Enrollment, Ulid)> = Vec::new();
        for session in &sessions {
            ctx.require_access(session.branch_id)?;
            let rs = txn.resource(session.resource_id)?;
            released.extend(
                rs.enrollments
                    .values()
                    .filter(|e| e.session_id == session.id && e.status == EnrollmentStatus::Reserved)
                    .map(|e| (e.clone(), session.resource_id)),
            );
        }
        txn.lock_customers(self, released.iter().map(|(e, _)| e.customer_id)).await?;

        let count = sessions.len();
        for mut session in sessions {
            session.status = SessionStatus::Cancelled;
            txn.stage(Event::SessionSaved { session });
        }
        for (mut enrollment, resource_id) in released {
            enrollment.status = EnrollmentStatus::Cancelled;
            txn.stage(Event::EnrollmentSaved { enrollment, resource_id });
        }
        txn.commit(self).await?;

        if count > 0 {
            info!("cancelled {count} class session(s) starting from {session_id}");
        }
        Ok(count)
    }

    /// Reserve a seat for `customer_id`. With `repeat`, also every later
    /// scheduled session of the same class series, all or nothing.
    pub async fn enroll(
        &self,
        ctx: &AccessContext,
        session_id: Ulid,
        customer_id: Ulid,
        repeat: bool,
    ) -> Result<EnrollOutcome, EngineError> {
        let result = self.enroll_inner(ctx, session_id, customer_id, repeat).await;
        metrics::counter!(BOOKINGS_TOTAL, "kind" => "enrollment", "outcome" => outcome_label(&result))
            .increment(1);
        result
    }

    async fn enroll_inner(
        &self,
        ctx: &AccessContext,
        session_id: Ulid,
        customer_id: Ulid,
        repeat: bool,
    ) -> Result<EnrollOutcome, EngineError> {
        let cfg = self.config();
        let now = now_ms();
        let resource_id = self
            .get_resource_for_entity(&session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        let series_id = {
            let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.read().await;
            guard.sessions.get(&session_id).ok_or(EngineError::NotFound(session_id))?.series_id
        };

        let mut txn = Txn::new();
        let members = match series_id {
            Some(sid) if repeat => {
                txn.lock_series(self, sid).await?;
                txn.series(sid)?.occurrences.clone()
            }
            _ => vec![session_id],
        };
        txn.lock_resources(self, [resource_id]).await?;
        txn.lock_customers(self, [customer_id]).await?;

        let rs = txn.resource(resource_id)?;
        let pivot = rs.sessions.get(&session_id).ok_or(EngineError::NotFound(session_id))?;
        if pivot.status != SessionStatus::Scheduled {
            return Err(EngineError::NotFound(session_id));
        }
        let mut targets: Vec<&ClassSession> = members
            .iter()
            .filter_map(|m| rs.sessions.get(m))
            .filter(|s| {
                s.id == session_id
                    || (s.status == SessionStatus::Scheduled && s.span.start > pivot.span.start)
            })
            .collect();
        targets.sort_by_key(|s| s.span.start);

        let cs = txn.customer(customer_id)?;
        let plan = active_plan(&cfg, cs, &self.plans, UsageKind::Class)?;
        let membership = match &plan {
            Some((subscription, plan)) => {
                let standing = quota::standing(plan, subscription, now, cfg.utc_offset_minutes);
                quota::enforce_standing(plan, &standing)?;
                Some(standing)
            }
            None => None,
        };

        let mut tracker = QuotaTracker::new();
        let mut enrollments = Vec::with_capacity(targets.len());
        for (i, session) in targets.iter().enumerate() {
            let at = |e: EngineError| {
                if targets.len() > 1 { e.at_occurrence(i + 1, session.span.start) } else { e }
            };
            ctx.require_access(session.branch_id).map_err(at)?;
            let already = rs.enrollments.values().any(|e| {
                e.session_id == session.id && e.customer_id == customer_id && e.status.holds_seat()
            });
            if already {
                return Err(at(EngineError::AlreadyEnrolled(session.id)));
            }
            if rs.seats_taken(session.id) >= session.capacity {
                return Err(at(EngineError::CapacityExceeded(session.capacity)));
            }
            if let Some((_, plan)) = &plan {
                tracker
                    .admit_class(plan, cs, session.span.start, cfg.utc_offset_minutes)
                    .map_err(at)?;
            }
            enrollments.push(Enrollment {
                id: Ulid::new(),
                session_id: session.id,
                customer_id,
                status: EnrollmentStatus::Reserved,
                session_start: session.span.start,
            });
        }

        let enrollment_ids: Vec<Ulid> = enrollments.iter().map(|e| e.id).collect();
        for enrollment in enrollments {
            txn.stage(Event::EnrollmentSaved { enrollment, resource_id });
        }
        txn.commit(self).await?;

        info!("customer {customer_id} enrolled in {} session(s) from {session_id}", enrollment_ids.len());
        Ok(EnrollOutcome { enrollment_ids, membership })
    }

    /// Give a reserved seat back. Cancelling twice is a no-op.
    pub async fn cancel_enrollment(&self, ctx: &AccessContext, id: Ulid) -> Result<bool, EngineError> {
        self.set_enrollment_status(ctx, id, EnrollmentStatus::Cancelled).await
    }

    pub async fn mark_attended(&self, ctx: &AccessContext, id: Ulid) -> Result<bool, EngineError> {
        self.set_enrollment_status(ctx, id, EnrollmentStatus::Attended).await
    }

    async fn set_enrollment_status(
        &self,
        ctx: &AccessContext,
        id: Ulid,
        next: EnrollmentStatus,
    ) -> Result<bool, EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let customer_id = {
            let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.read().await;
            guard.enrollments.get(&id).ok_or(EngineError::NotFound(id))?.customer_id
        };

        let mut txn = Txn::new();
        txn.lock_resources(self, [resource_id]).await?;
        txn.lock_customers(self, [customer_id]).await?;
        let rs = txn.resource(resource_id)?;
        let mut enrollment = rs.enrollments.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let branch_id = rs
            .sessions
            .get(&enrollment.session_id)
            .map(|s| s.branch_id)
            .ok_or(EngineError::NotFound(enrollment.session_id))?;
        ctx.require_access(branch_id)?;

        if enrollment.status == next {
            return Ok(false);
        }
        // Only a live reservation can be attended or cancelled.
        if enrollment.status != EnrollmentStatus::Reserved {
            return Err(EngineError::InvalidScope("enrollment is no longer reserved"));
        }
        enrollment.status = next;
        txn.stage(Event::EnrollmentSaved { enrollment, resource_id });
        txn.commit(self).await?;
        Ok(true)
    }
}
