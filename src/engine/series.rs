use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar;
use crate::model::*;
use crate::observability::{outcome_label, BOOKINGS_TOTAL, SERIES_OCCURRENCES};

use super::conflict::{
    check_slot, first_collision_in_batch, now_ms, validate_instant, validate_span,
};
use super::scope::AccessContext;
use super::txn::Txn;
use super::{Engine, EngineError};

/// Requested change to one occurrence. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppointmentChanges {
    pub start: Option<Ms>,
    pub resource_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
}

impl AppointmentChanges {
    fn is_empty(&self) -> bool {
        self.start.is_none()
            && self.resource_id.is_none()
            && self.service_id.is_none()
            && self.branch_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesScope {
    This,
    Future,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// Appointments rewritten, in chronological order.
    pub updated: Vec<Ulid>,
    /// New snapshot version when the series parameters changed.
    pub series_version: Option<u32>,
}

/// Where each member of a series (or a lone appointment) currently lives.
/// Stable while the series lock is held: only series mutations move members.
fn locate(engine: &Engine, members: &[Ulid]) -> Vec<(Ulid, Ulid)> {
    members
        .iter()
        .filter_map(|m| engine.get_resource_for_entity(m).map(|r| (*m, r)))
        .collect()
}

fn load(txn: &Txn, locations: &[(Ulid, Ulid)]) -> Result<Vec<Appointment>, EngineError> {
    let mut out = Vec::with_capacity(locations.len());
    for (id, resource_id) in locations {
        if let Some(a) = txn.resource(*resource_id)?.appointments.get(id) {
            out.push(a.clone());
        }
    }
    out.sort_by_key(|a| a.span.start);
    Ok(out)
}

fn in_scope(scope: SeriesScope, appointment: &Appointment, pivot: Ulid, from: Ms) -> bool {
    match scope {
        SeriesScope::This => appointment.id == pivot,
        SeriesScope::Future => appointment.span.start >= from,
        SeriesScope::All => true,
    }
}

impl Engine {
    /// Move and/or reassign an appointment, propagating to the rest of its
    /// series per `scope`. Every moved occurrence is shifted by the same delta
    /// and re-validated against other bookings, against siblings left in
    /// place, and against the other moved occurrences. Only occurrences still
    /// in a blocking status move; completed and cancelled ones stay put.
    pub async fn reschedule_or_reassign(
        &self,
        ctx: &AccessContext,
        id: Ulid,
        changes: AppointmentChanges,
        scope: SeriesScope,
    ) -> Result<MutationOutcome, EngineError> {
        let result = self.reschedule_inner(ctx, id, changes, scope).await;
        metrics::counter!(BOOKINGS_TOTAL, "kind" => "reschedule", "outcome" => outcome_label(&result))
            .increment(1);
        if let Ok(outcome) = &result {
            metrics::histogram!(SERIES_OCCURRENCES).record(outcome.updated.len() as f64);
        }
        result
    }

    async fn reschedule_inner(
        &self,
        ctx: &AccessContext,
        id: Ulid,
        changes: AppointmentChanges,
        scope: SeriesScope,
    ) -> Result<MutationOutcome, EngineError> {
        if changes.is_empty() {
            return Ok(MutationOutcome { updated: vec![], series_version: None });
        }
        let new_service = changes.service_id.map(|s| self.service(s)).transpose()?;
        let cfg = self.config();
        let offset = cfg.utc_offset_minutes;

        let series_id = {
            let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
            let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.read().await;
            guard.appointments.get(&id).ok_or(EngineError::NotFound(id))?.series_id
        };

        let mut txn = Txn::new();
        let members = match series_id {
            Some(sid) => {
                txn.lock_series(self, sid).await?;
                txn.series(sid)?.occurrences.clone()
            }
            None => vec![id],
        };
        let locations = locate(self, &members);
        let mut resource_ids: Vec<Ulid> = locations.iter().map(|(_, r)| *r).collect();
        resource_ids.extend(changes.resource_id);
        txn.lock_resources(self, resource_ids).await?;

        let current = load(&txn, &locations)?;
        let pivot = current
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !pivot.status.is_blocking() {
            return Err(EngineError::InvalidTransition {
                from: pivot.status,
                to: AppointmentStatus::Scheduled,
            });
        }
        txn.lock_customers(self, [pivot.customer_id]).await?;

        // A lone appointment has no siblings; scope does not apply.
        let scope = if series_id.is_some() { scope } else { SeriesScope::This };
        let delta = match changes.start {
            Some(start) => validate_instant(start)? - pivot.span.start,
            None => 0,
        };
        let target_branch = if changes.resource_id.is_some() || changes.branch_id.is_some() {
            let target = changes.resource_id.unwrap_or(pivot.resource_id);
            let home = txn.resource(target)?.info.branch_id;
            Some(self.resolve_branch(ctx, changes.branch_id, home)?)
        } else {
            None
        };

        let moving: Vec<&Appointment> = current
            .iter()
            .filter(|a| a.status.is_blocking() && in_scope(scope, a, id, pivot.span.start))
            .collect();
        let exclude: Vec<Ulid> = moving.iter().map(|a| a.id).collect();

        let mut moved: Vec<(usize, Appointment, Ulid)> = Vec::with_capacity(moving.len());
        for a in moving {
            ctx.require_access(a.branch_id)?;
            let index = members.iter().position(|m| *m == a.id).map_or(1, |p| p + 1);
            let resource_id = changes.resource_id.unwrap_or(a.resource_id);
            let duration = new_service
                .as_ref()
                .map_or(a.span.duration_ms(), |s| s.duration_ms());
            let start = a.span.start + delta;
            let at = |e: EngineError| e.at_occurrence(index, start);

            let span = validate_span(start, start + duration).map_err(at)?;
            check_slot(&cfg, txn.resource(resource_id)?, &span, &exclude).map_err(at)?;

            let mut next = a.clone();
            next.span = span;
            next.resource_id = resource_id;
            if let Some(service) = &new_service {
                next.service_id = service.id;
            }
            if let Some(branch_id) = target_branch {
                next.branch_id = branch_id;
            }
            moved.push((index, next, a.resource_id));
        }

        // Moved occurrences landing on the same resource must clear each other.
        let mut by_resource: BTreeMap<Ulid, Vec<&(usize, Appointment, Ulid)>> = BTreeMap::new();
        for entry in &moved {
            by_resource.entry(entry.1.resource_id).or_default().push(entry);
        }
        for (resource_id, entries) in &by_resource {
            let spans: Vec<Span> = entries.iter().map(|e| e.1.span).collect();
            if let Some(j) = first_collision_in_batch(&spans, cfg.buffer_ms()) {
                let (index, later, _) = entries[j];
                let earlier = entries[..j]
                    .iter()
                    .find(|e| e.1.span.overlaps_with_buffer(&later.span, cfg.buffer_ms()))
                    .map_or(later.id, |e| e.1.id);
                return Err(EngineError::OverlapConflict {
                    resource_id: *resource_id,
                    conflicting_id: earlier,
                    start: later.span.start,
                }
                .at_occurrence(*index, later.span.start));
            }
        }

        let mut series_version = None;
        if let Some(sid) = series_id
            && scope != SeriesScope::This
        {
            let mut series = txn.series(sid)?.clone();
            let Some((_, new_pivot, _)) = moved.iter().find(|(_, a, _)| a.id == id) else {
                return Err(EngineError::NotFound(id));
            };
            let anchor = moved.iter().map(|(_, a, _)| a.span.start).min().unwrap_or(new_pivot.span.start);
            series.snapshot = RecurrenceSnapshot {
                version: series.snapshot.version + 1,
                rule: series.snapshot.rule.clone(),
                anchor,
                weekday: calendar::weekday(new_pivot.span.start, offset),
                time_of_day_minute: calendar::minute_of_day(new_pivot.span.start, offset),
                duration_ms: new_pivot.span.duration_ms(),
                resource_id: new_pivot.resource_id,
                service_id: Some(new_pivot.service_id),
            };
            series_version = Some(series.snapshot.version);

            // The first occurrence carries the snapshot.
            if let Some(first) = members.first() {
                match moved.iter_mut().find(|(_, a, _)| a.id == *first) {
                    Some((_, a, _)) => a.recurrence = Some(series.snapshot.clone()),
                    None => {
                        if let Some(a) = current.iter().find(|a| a.id == *first) {
                            let mut a = a.clone();
                            a.recurrence = Some(series.snapshot.clone());
                            txn.stage(Event::AppointmentSaved { appointment: a, previous_resource: None });
                        }
                    }
                }
            }
            txn.stage(Event::SeriesSaved { series });
        }

        let updated: Vec<Ulid> = moved.iter().map(|(_, a, _)| a.id).collect();
        for (_, appointment, previous) in moved {
            let previous_resource = (previous != appointment.resource_id).then_some(previous);
            txn.stage(Event::AppointmentSaved { appointment, previous_resource });
        }
        txn.commit(self).await?;

        info!("rescheduled {} occurrence(s) from {id} (delta {delta}ms)", updated.len());
        Ok(MutationOutcome { updated, series_version })
    }

    /// Soft-cancel the occurrences of an appointment series in scope and
    /// return how many were actually cancelled. `This` needs a pivot; `Future`
    /// without one means from now on.
    pub async fn cancel_series(
        &self,
        ctx: &AccessContext,
        series_id: Ulid,
        scope: SeriesScope,
        pivot: Option<Ulid>,
    ) -> Result<usize, EngineError> {
        let mut txn = Txn::new();
        txn.lock_series(self, series_id).await?;
        let series = txn.series(series_id)?.clone();
        if series.kind != SeriesKind::Appointments {
            return Err(EngineError::InvalidScope("class series are cancelled through cancel_class"));
        }
        let locations = locate(self, &series.occurrences);
        txn.lock_resources(self, locations.iter().map(|(_, r)| *r)).await?;
        txn.lock_customers(self, series.customer_id).await?;

        let current = load(&txn, &locations)?;
        let from = match (scope, pivot) {
            (SeriesScope::This, None) => {
                return Err(EngineError::InvalidScope("scope this needs an occurrence"));
            }
            (_, Some(p)) => {
                current
                    .iter()
                    .find(|a| a.id == p)
                    .ok_or(EngineError::InvalidScope("occurrence is not part of the series"))?
                    .span
                    .start
            }
            (_, None) => now_ms(),
        };
        let pivot = pivot.unwrap_or(Ulid::nil());

        for a in current.iter().filter(|a| a.status.is_blocking() && in_scope(scope, a, pivot, from)) {
            ctx.require_access(a.branch_id)?;
            let mut cancelled = a.clone();
            cancelled.status = AppointmentStatus::Cancelled;
            cancelled.hold_until = None;
            txn.stage(Event::AppointmentSaved { appointment: cancelled, previous_resource: None });
        }
        let count = txn.staged();
        txn.commit(self).await?;

        if count > 0 {
            info!("cancelled {count} occurrence(s) of series {series_id}");
        } else {
            debug!("series {series_id}: nothing left to cancel");
        }
        Ok(count)
    }
}
