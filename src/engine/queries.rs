use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::availability::{free_spans, working_window};
use super::conflict::validate_instant;
use super::scope::AccessContext;
use super::{Engine, EngineError};

/// Typed branch predicate for read paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchFilter {
    #[default]
    Any,
    Only(Ulid),
    AnyOf(Vec<Ulid>),
}

impl BranchFilter {
    pub fn matches(&self, branch_id: Ulid) -> bool {
        match self {
            BranchFilter::Any => true,
            BranchFilter::Only(id) => *id == branch_id,
            BranchFilter::AnyOf(ids) => ids.contains(&branch_id),
        }
    }
}

/// Predicate for `list_appointments`. Unset fields match everything; the
/// window matches appointments overlapping `[from, to)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppointmentQuery {
    pub branch: BranchFilter,
    pub resource_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub series_id: Option<Ulid>,
    pub statuses: Vec<AppointmentStatus>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl AppointmentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, filter: BranchFilter) -> Self {
        self.branch = filter;
        self
    }

    pub fn resource(mut self, id: Ulid) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn customer(mut self, id: Ulid) -> Self {
        self.customer_id = Some(id);
        self
    }

    pub fn series(mut self, id: Ulid) -> Self {
        self.series_id = Some(id);
        self
    }

    pub fn status(mut self, status: AppointmentStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn window(mut self, from: Ms, to: Ms) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, a: &Appointment) -> bool {
        self.branch.matches(a.branch_id)
            && self.resource_id.is_none_or(|id| id == a.resource_id)
            && self.customer_id.is_none_or(|id| id == a.customer_id)
            && self.series_id.is_none_or(|id| a.series_id == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&a.status))
            && self.from.is_none_or(|from| a.span.end > from)
            && self.to.is_none_or(|to| a.span.start < to)
    }
}

/// A pending deposit whose hold has lapsed, for an external sweeper to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredHold {
    pub appointment_id: Ulid,
    pub resource_id: Ulid,
    pub customer_id: Ulid,
    pub hold_until: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesInfo {
    pub id: Ulid,
    pub kind: SeriesKind,
    pub customer_id: Option<Ulid>,
    pub snapshot: RecurrenceSnapshot,
    pub occurrences: Vec<Ulid>,
}

impl Engine {
    pub async fn get_appointment(&self, ctx: &AccessContext, id: Ulid) -> Result<Appointment, EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        let appointment = guard.appointments.get(&id).ok_or(EngineError::NotFound(id))?;
        ctx.require_access(appointment.branch_id)?;
        Ok(appointment.clone())
    }

    /// Appointments matching `query` that the caller may see, ordered by start.
    pub async fn list_appointments(
        &self,
        ctx: &AccessContext,
        query: &AppointmentQuery,
    ) -> Result<Vec<Appointment>, EngineError> {
        let from = query.from.map(validate_instant).transpose()?;
        let to = query.to.map(validate_instant).transpose()?;
        if let (Some(from), Some(to)) = (from, to)
            && to - from > MAX_QUERY_WINDOW_MS
        {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let visible = ctx.branch_filter();
        let resources: Vec<_> = match query.resource_id {
            Some(id) => self.get_resource(&id).into_iter().collect(),
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(
                guard
                    .appointments
                    .values()
                    .filter(|a| visible.matches(a.branch_id) && query.matches(a))
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.span.start, a.id));
        Ok(out)
    }

    /// Bookable gaps on one local calendar day. An inactive resource has none.
    pub async fn compute_availability(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let cfg = self.config();
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if !guard.info.active {
            return Ok(vec![]);
        }
        let Some(window) = working_window(&guard, date, cfg.utc_offset_minutes) else {
            return Ok(vec![]);
        };

        let mut free = free_spans(&guard, &window, cfg.buffer_ms());
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }

    /// Pending deposits whose hold ended at or before `now`. Such slots keep
    /// blocking until something cancels or confirms them.
    pub async fn expired_holds(&self, now: Ms) -> Vec<ExpiredHold> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            for a in guard.appointments.values() {
                if a.status != AppointmentStatus::PendingDeposit {
                    continue;
                }
                if let Some(hold_until) = a.hold_until
                    && hold_until <= now
                {
                    out.push(ExpiredHold {
                        appointment_id: a.id,
                        resource_id: a.resource_id,
                        customer_id: a.customer_id,
                        hold_until,
                    });
                }
            }
        }
        out.sort_by_key(|h| (h.hold_until, h.appointment_id));
        out
    }

    pub async fn series_snapshot(&self, series_id: Ulid) -> Result<SeriesInfo, EngineError> {
        let series = self
            .series
            .get(&series_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(series_id))?;
        let guard = series.lock().await;
        Ok(SeriesInfo {
            id: guard.id,
            kind: guard.kind,
            customer_id: guard.customer_id,
            snapshot: guard.snapshot.clone(),
            occurrences: guard.occurrences.clone(),
        })
    }
}
