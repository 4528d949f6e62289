use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::TenantConfig;
use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_instant};
use super::txn::Txn;
use super::{Engine, EngineError, WalCommand};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    async fn commit_one(&self, event: Event) -> Result<(), EngineError> {
        let mut txn = Txn::new();
        txn.stage(event);
        txn.commit(self).await
    }

    pub async fn set_config(&self, config: TenantConfig) -> Result<(), EngineError> {
        if config.max_occurrences == 0 || config.max_occurrences > MAX_OCCURRENCES_CEILING {
            return Err(EngineError::LimitExceeded("max_occurrences out of range"));
        }
        if config.deposit_hold_minutes > MAX_HOLD_MINUTES {
            return Err(EngineError::LimitExceeded("deposit hold too long"));
        }
        if config.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(EngineError::LimitExceeded("utc offset out of range"));
        }
        if config.buffer_minutes >= 24 * 60 {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }
        self.commit_one(Event::ConfigUpdated { config }).await
    }

    /// The first branch of a tenant is always its primary one.
    pub async fn create_branch(&self, mut branch: Branch) -> Result<(), EngineError> {
        check_name(&branch.name, "branch name too long")?;
        let _catalog = self.catalog.lock().await;
        if self.branches.contains_key(&branch.id) {
            return Err(EngineError::AlreadyExists(format!("branch {}", branch.id)));
        }
        if self.branches.is_empty() {
            branch.primary = true;
        }
        self.commit_one(Event::BranchCreated { branch }).await
    }

    pub async fn create_service(&self, service: Service) -> Result<(), EngineError> {
        check_name(&service.name, "service name too long")?;
        if service.duration_minutes == 0 || service.duration_ms() > MAX_SPAN_DURATION_MS {
            return Err(EngineError::LimitExceeded("service duration out of range"));
        }
        if service.deposit_percent > 100 || service.price_cents < 0 {
            return Err(EngineError::LimitExceeded("invalid service pricing"));
        }
        let _catalog = self.catalog.lock().await;
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(format!("service {}", service.id)));
        }
        self.commit_one(Event::ServiceCreated { service }).await
    }

    pub async fn create_resource(&self, resource: ResourceInfo) -> Result<(), EngineError> {
        if let Some(ref n) = resource.name {
            check_name(n, "resource name too long")?;
        }
        let _catalog = self.catalog.lock().await;
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(format!("resource {}", resource.id)));
        }
        if let Some(branch_id) = resource.branch_id
            && !self.branches.contains_key(&branch_id)
        {
            return Err(EngineError::NotFound(branch_id));
        }
        self.commit_one(Event::ResourceCreated { resource }).await
    }

    /// Rename, move to another branch, or (de)activate a resource. Existing
    /// bookings are left alone; an inactive resource only refuses new ones.
    pub async fn update_resource(&self, resource: ResourceInfo) -> Result<(), EngineError> {
        if let Some(ref n) = resource.name {
            check_name(n, "resource name too long")?;
        }
        if let Some(branch_id) = resource.branch_id
            && !self.branches.contains_key(&branch_id)
        {
            return Err(EngineError::NotFound(branch_id));
        }
        let mut txn = Txn::new();
        txn.lock_resources(self, [resource.id]).await?;
        txn.stage(Event::ResourceUpdated { resource });
        txn.commit(self).await
    }

    pub async fn set_working_hours(
        &self,
        resource_id: Ulid,
        schedule: WeeklySchedule,
    ) -> Result<(), EngineError> {
        for (day, w) in schedule.windows() {
            if w.open_minute >= w.close_minute || w.close_minute > 24 * 60 {
                return Err(EngineError::InvalidTimeRange(format!(
                    "{day}: {}..{} is not a valid opening window",
                    w.open_minute, w.close_minute
                )));
            }
        }
        let mut txn = Txn::new();
        txn.lock_resources(self, [resource_id]).await?;
        txn.stage(Event::WorkingHoursSet { resource_id, schedule });
        txn.commit(self).await
    }

    /// Black out `[start, end)` on a resource. May span several days and may
    /// cover existing bookings, which stay as they are.
    pub async fn add_time_off(&self, resource_id: Ulid, start: Ms, end: Ms) -> Result<Ulid, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidTimeRange(format!("end {end} is not after start {start}")));
        }
        if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::InvalidTimeRange("timestamp out of range".into()));
        }
        let mut txn = Txn::new();
        txn.lock_resources(self, [resource_id]).await?;
        if txn.resource(resource_id)?.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        let id = Ulid::new();
        txn.stage(Event::TimeOffAdded { id, resource_id, span: Span::new(start, end) });
        txn.commit(self).await?;
        Ok(id)
    }

    pub async fn remove_time_off(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let mut txn = Txn::new();
        txn.lock_resources(self, [resource_id]).await?;
        let is_time_off = txn
            .resource(resource_id)?
            .intervals
            .iter()
            .any(|i| i.id == id && i.kind == IntervalKind::TimeOff);
        if !is_time_off {
            return Err(EngineError::NotFound(id));
        }
        txn.stage(Event::TimeOffRemoved { id, resource_id });
        txn.commit(self).await?;
        Ok(resource_id)
    }

    /// Register a customer. Phone numbers are normalized and unique per tenant.
    pub async fn create_customer(&self, mut customer: Customer) -> Result<(), EngineError> {
        check_name(&customer.name, "customer name too long")?;
        customer.phone = normalize_phone(&customer.phone);
        if customer.phone.trim_start_matches('+').is_empty() {
            return Err(EngineError::LimitExceeded("phone number has no digits"));
        }
        let _catalog = self.catalog.lock().await;
        if self.customers.contains_key(&customer.id) {
            return Err(EngineError::AlreadyExists(format!("customer {}", customer.id)));
        }
        if self.phones.contains_key(&customer.phone) {
            return Err(EngineError::AlreadyExists(format!("phone {}", customer.phone)));
        }
        self.commit_one(Event::CustomerCreated { customer }).await
    }

    pub fn customer_by_phone(&self, raw: &str) -> Option<Ulid> {
        self.phones.get(&normalize_phone(raw)).map(|e| *e.value())
    }

    pub async fn create_plan(&self, plan: MembershipPlan) -> Result<(), EngineError> {
        check_name(&plan.name, "plan name too long")?;
        match plan.billing {
            BillingCycle::Months(0) | BillingCycle::Days(0) => {
                return Err(EngineError::LimitExceeded("billing cycle must be positive"));
            }
            _ => {}
        }
        if plan.billing_day.is_some_and(|d| d == 0 || d > 31) {
            return Err(EngineError::LimitExceeded("billing day out of range"));
        }
        let _catalog = self.catalog.lock().await;
        if self.plans.contains_key(&plan.id) {
            return Err(EngineError::AlreadyExists(format!("plan {}", plan.id)));
        }
        self.commit_one(Event::PlanCreated { plan }).await
    }

    /// A customer holds at most one active membership.
    pub async fn start_subscription(
        &self,
        customer_id: Ulid,
        plan_id: Ulid,
        started_at: Option<Ms>,
    ) -> Result<Subscription, EngineError> {
        if !self.plans.contains_key(&plan_id) {
            return Err(EngineError::NotFound(plan_id));
        }
        let started_at = started_at.map(validate_instant).transpose()?.unwrap_or_else(now_ms);
        let mut txn = Txn::new();
        txn.lock_customers(self, [customer_id]).await?;
        if let Some(active) = txn.customer(customer_id)?.active_subscription() {
            return Err(EngineError::AlreadyExists(format!("active subscription {}", active.id)));
        }
        let subscription = Subscription {
            id: Ulid::new(),
            customer_id,
            plan_id,
            status: SubscriptionStatus::Active,
            started_at,
            last_payment_at: None,
            next_charge_at: None,
        };
        txn.stage(Event::SubscriptionSaved { subscription: subscription.clone() });
        txn.commit(self).await?;
        info!("customer {customer_id} subscribed to plan {plan_id}");
        Ok(subscription)
    }

    pub async fn cancel_subscription(&self, customer_id: Ulid) -> Result<bool, EngineError> {
        let mut txn = Txn::new();
        txn.lock_customers(self, [customer_id]).await?;
        let Some(active) = txn.customer(customer_id)?.active_subscription() else {
            return Ok(false);
        };
        let mut subscription = active.clone();
        subscription.status = SubscriptionStatus::Cancelled;
        txn.stage(Event::SubscriptionSaved { subscription });
        txn.commit(self).await?;
        Ok(true)
    }

    /// Record a membership charge. Without an explicit next charge date the
    /// next one is derived from the billing cycle.
    pub async fn record_payment(
        &self,
        customer_id: Ulid,
        paid_at: Ms,
        next_charge_at: Option<Ms>,
    ) -> Result<Subscription, EngineError> {
        validate_instant(paid_at)?;
        let next_charge_at = next_charge_at.map(validate_instant).transpose()?;
        let mut txn = Txn::new();
        txn.lock_customers(self, [customer_id]).await?;
        let mut subscription = txn
            .customer(customer_id)?
            .active_subscription()
            .cloned()
            .ok_or(EngineError::NotFound(customer_id))?;
        subscription.last_payment_at = Some(paid_at);
        subscription.next_charge_at = next_charge_at;
        txn.stage(Event::SubscriptionSaved { subscription: subscription.clone() });
        txn.commit(self).await?;
        debug!("payment recorded for {customer_id} at {paid_at}");
        Ok(subscription)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds the current
    /// state. Returns false when some entity was busy; the caller retries later.
    pub async fn compact_wal(&self) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.write().await;
        let Some(events) = self.snapshot_events() else {
            return Ok(false);
        };
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(true)
    }

    /// Must be called with the commit gate held exclusively: nothing can be
    /// applied meanwhile, but a transaction still validating may hold an
    /// entity lock, in which case there is no snapshot this time.
    fn snapshot_events(&self) -> Option<Vec<Event>> {
        let mut events = vec![Event::ConfigUpdated { config: self.config() }];

        let mut branches: Vec<Branch> = self.branches.iter().map(|b| b.value().clone()).collect();
        branches.sort_by_key(|b| (b.primary, b.id));
        events.extend(branches.into_iter().map(|branch| Event::BranchCreated { branch }));
        events.extend(self.services.iter().map(|s| Event::ServiceCreated { service: s.value().clone() }));
        events.extend(self.plans.iter().map(|p| Event::PlanCreated { plan: p.value().clone() }));

        let customers: Vec<_> = self.customers.iter().map(|e| e.value().clone()).collect();
        for cs in customers {
            let guard = cs.try_lock().ok()?;
            events.push(Event::CustomerCreated { customer: guard.customer.clone() });
            if let Some(subscription) = &guard.subscription {
                events.push(Event::SubscriptionSaved { subscription: subscription.clone() });
            }
        }

        let all_series: Vec<_> = self.series.iter().map(|e| e.value().clone()).collect();
        for series in all_series {
            let guard = series.try_lock().ok()?;
            events.push(Event::SeriesSaved { series: guard.clone() });
        }

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut bookings = Vec::new();
        for rs in resources {
            let guard = rs.try_read().ok()?;
            let resource_id = guard.id();
            events.push(Event::ResourceCreated { resource: guard.info.clone() });
            events.push(Event::WorkingHoursSet {
                resource_id,
                schedule: guard.working_hours.clone(),
            });
            for interval in guard.intervals.iter().filter(|i| i.kind == IntervalKind::TimeOff) {
                events.push(Event::TimeOffAdded { id: interval.id, resource_id, span: interval.span });
            }
            for appointment in guard.appointments.values() {
                bookings.push(Event::AppointmentSaved {
                    appointment: appointment.clone(),
                    previous_resource: None,
                });
            }
            for session in guard.sessions.values() {
                bookings.push(Event::SessionSaved { session: session.clone() });
            }
            for enrollment in guard.enrollments.values() {
                bookings.push(Event::EnrollmentSaved { enrollment: enrollment.clone(), resource_id });
            }
        }
        events.extend(bookings);
        Some(events)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
