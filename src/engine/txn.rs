use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// A unit of work over one tenant. Locks are taken in a fixed order (series,
/// then resources by id, then customers by id), checks run against the locked
/// state, and `commit` writes every staged event to the WAL as one frame before
/// applying it. Dropping a `Txn` without committing is a rollback: nothing was
/// applied.
pub(super) struct Txn {
    series: BTreeMap<Ulid, OwnedMutexGuard<SeriesState>>,
    resources: BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>,
    customers: BTreeMap<Ulid, OwnedMutexGuard<CustomerState>>,
    events: Vec<Event>,
}

impl Txn {
    pub fn new() -> Self {
        Self {
            series: BTreeMap::new(),
            resources: BTreeMap::new(),
            customers: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub async fn lock_series(&mut self, engine: &Engine, id: Ulid) -> Result<(), EngineError> {
        debug_assert!(self.resources.is_empty() && self.customers.is_empty());
        if self.series.contains_key(&id) {
            return Ok(());
        }
        let arc = engine
            .series
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.series.insert(id, arc.lock_owned().await);
        Ok(())
    }

    /// Lock every listed resource in id order. Call once per transaction.
    pub async fn lock_resources(
        &mut self,
        engine: &Engine,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<(), EngineError> {
        debug_assert!(self.customers.is_empty());
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        for id in ids {
            if self.resources.contains_key(&id) {
                continue;
            }
            let arc = engine.get_resource(&id).ok_or(EngineError::NotFound(id))?;
            self.resources.insert(id, arc.write_owned().await);
        }
        Ok(())
    }

    /// Lock every listed customer in id order. Call once per transaction, last.
    pub async fn lock_customers(
        &mut self,
        engine: &Engine,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<(), EngineError> {
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        for id in ids {
            if self.customers.contains_key(&id) {
                continue;
            }
            let arc = engine
                .customers
                .get(&id)
                .map(|e| e.value().clone())
                .ok_or(EngineError::NotFound(id))?;
            self.customers.insert(id, arc.lock_owned().await);
        }
        Ok(())
    }

    pub fn resource(&self, id: Ulid) -> Result<&ResourceState, EngineError> {
        self.resources.get(&id).map(|g| &**g).ok_or(EngineError::NotFound(id))
    }

    pub fn customer(&self, id: Ulid) -> Result<&CustomerState, EngineError> {
        self.customers.get(&id).map(|g| &**g).ok_or(EngineError::NotFound(id))
    }

    pub fn series(&self, id: Ulid) -> Result<&SeriesState, EngineError> {
        self.series.get(&id).map(|g| &**g).ok_or(EngineError::NotFound(id))
    }

    pub fn stage(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn staged(&self) -> usize {
        self.events.len()
    }

    /// Persist all staged events, then apply them to the locked state and
    /// notify listeners.
    pub async fn commit(mut self, engine: &Engine) -> Result<(), EngineError> {
        if self.events.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.events);
        let gate = engine.commit_gate.read().await;
        engine.wal_append(events.clone()).await?;
        for event in &events {
            self.apply(engine, event);
        }
        drop(gate);
        for event in &events {
            if let Some(resource_id) = event.resource_id() {
                engine.notify.send(resource_id, event);
            }
        }
        Ok(())
    }

    /// Take whatever locks `event` needs without waiting. Only valid while
    /// nothing else can hold them (replay).
    pub fn lock_for_replay(&mut self, engine: &Engine, event: &Event) {
        let (resources, customer, series): (Vec<Ulid>, Option<Ulid>, Option<Ulid>) = match event {
            Event::ResourceUpdated { resource } => (vec![resource.id], None, None),
            Event::WorkingHoursSet { resource_id, .. }
            | Event::TimeOffAdded { resource_id, .. }
            | Event::TimeOffRemoved { resource_id, .. } => (vec![*resource_id], None, None),
            Event::SubscriptionSaved { subscription } => {
                (vec![], Some(subscription.customer_id), None)
            }
            Event::SeriesSaved { series } => (vec![], None, Some(series.id)),
            Event::AppointmentSaved { appointment, previous_resource } => {
                let mut ids = vec![appointment.resource_id];
                ids.extend(*previous_resource);
                (ids, Some(appointment.customer_id), None)
            }
            Event::AppointmentDeleted { resource_id, customer_id, .. } => {
                (vec![*resource_id], Some(*customer_id), None)
            }
            Event::SessionSaved { session } => (vec![session.resource_id], None, None),
            Event::EnrollmentSaved { enrollment, resource_id } => {
                (vec![*resource_id], Some(enrollment.customer_id), None)
            }
            _ => (vec![], None, None),
        };
        if let Some(id) = series
            && let Some(arc) = engine.series.get(&id).map(|e| e.value().clone())
            && let Ok(guard) = arc.try_lock_owned()
        {
            self.series.insert(id, guard);
        }
        for id in resources {
            if let Some(arc) = engine.get_resource(&id)
                && let Ok(guard) = arc.try_write_owned()
            {
                self.resources.insert(id, guard);
            }
        }
        if let Some(id) = customer
            && let Some(arc) = engine.customers.get(&id).map(|e| e.value().clone())
            && let Ok(guard) = arc.try_lock_owned()
        {
            self.customers.insert(id, guard);
        }
    }

    /// Apply a persisted event. Entities created by the event are inserted into
    /// the engine maps; existing ones must be locked by this transaction.
    pub fn apply(&mut self, engine: &Engine, event: &Event) {
        match event {
            Event::ConfigUpdated { config } => {
                engine.config.send_replace(config.clone());
            }
            Event::BranchCreated { branch } => {
                if branch.primary {
                    for mut other in engine.branches.iter_mut() {
                        other.primary = false;
                    }
                }
                engine.branches.insert(branch.id, branch.clone());
            }
            Event::ServiceCreated { service } => {
                engine.services.insert(service.id, service.clone());
            }
            Event::PlanCreated { plan } => {
                engine.plans.insert(plan.id, plan.clone());
            }
            Event::CustomerCreated { customer } => {
                engine.phones.insert(customer.phone.clone(), customer.id);
                engine
                    .customers
                    .insert(customer.id, Arc::new(Mutex::new(CustomerState::new(customer.clone()))));
            }
            Event::ResourceCreated { resource } => {
                engine
                    .resources
                    .insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource.clone()))));
            }
            Event::ResourceUpdated { resource } => {
                if let Some(rs) = self.resource_mut(resource.id) {
                    rs.info = resource.clone();
                }
            }
            Event::WorkingHoursSet { resource_id, schedule } => {
                if let Some(rs) = self.resource_mut(*resource_id) {
                    rs.working_hours = schedule.clone();
                }
            }
            Event::TimeOffAdded { id, resource_id, span } => {
                if let Some(rs) = self.resource_mut(*resource_id) {
                    rs.insert_interval(Interval { id: *id, span: *span, kind: IntervalKind::TimeOff });
                    engine.entity_to_resource.insert(*id, *resource_id);
                }
            }
            Event::TimeOffRemoved { id, resource_id } => {
                if let Some(rs) = self.resource_mut(*resource_id) {
                    rs.remove_interval(*id);
                    engine.entity_to_resource.remove(id);
                }
            }
            Event::SubscriptionSaved { subscription } => {
                if let Some(cs) = self.customer_mut(subscription.customer_id) {
                    cs.subscription = Some(subscription.clone());
                }
            }
            Event::SeriesSaved { series } => match self.series.get_mut(&series.id) {
                Some(guard) => **guard = series.clone(),
                None => {
                    engine
                        .series
                        .insert(series.id, Arc::new(Mutex::new(series.clone())));
                }
            },
            Event::AppointmentSaved { appointment, previous_resource } => {
                if let Some(prev) = previous_resource
                    && *prev != appointment.resource_id
                    && let Some(rs) = self.resource_mut(*prev)
                {
                    rs.remove_appointment(appointment.id);
                }
                if let Some(rs) = self.resource_mut(appointment.resource_id) {
                    rs.upsert_appointment(appointment.clone());
                    engine.entity_to_resource.insert(appointment.id, appointment.resource_id);
                }
                if let Some(cs) = self.customer_mut(appointment.customer_id) {
                    cs.track_appointment(appointment);
                }
            }
            Event::AppointmentDeleted { id, resource_id, customer_id } => {
                if let Some(rs) = self.resource_mut(*resource_id) {
                    rs.remove_appointment(*id);
                }
                if let Some(cs) = self.customer_mut(*customer_id) {
                    cs.active_appointments.remove(id);
                }
                engine.entity_to_resource.remove(id);
            }
            Event::SessionSaved { session } => {
                if let Some(rs) = self.resource_mut(session.resource_id) {
                    rs.upsert_session(session.clone());
                    engine.entity_to_resource.insert(session.id, session.resource_id);
                }
            }
            Event::EnrollmentSaved { enrollment, resource_id } => {
                if let Some(rs) = self.resource_mut(*resource_id) {
                    rs.enrollments.insert(enrollment.id, enrollment.clone());
                    engine.entity_to_resource.insert(enrollment.id, *resource_id);
                }
                if let Some(cs) = self.customer_mut(enrollment.customer_id) {
                    cs.enrollments
                        .insert(enrollment.id, (enrollment.session_start, enrollment.status));
                }
            }
        }
    }

    fn resource_mut(&mut self, id: Ulid) -> Option<&mut ResourceState> {
        let found = self.resources.get_mut(&id).map(|g| &mut **g);
        if found.is_none() {
            warn!("apply: resource {id} not locked by transaction");
        }
        found
    }

    fn customer_mut(&mut self, id: Ulid) -> Option<&mut CustomerState> {
        let found = self.customers.get_mut(&id).map(|g| &mut **g);
        if found.is_none() {
            warn!("apply: customer {id} not locked by transaction");
        }
        found
    }
}
