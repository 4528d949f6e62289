use tracing::{debug, info};
use ulid::Ulid;

use crate::config::TenantConfig;
use crate::model::*;

use super::conflict::now_ms;
use super::scope::AccessContext;
use super::txn::Txn;
use super::{Engine, EngineError};

impl AppointmentStatus {
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Scheduled, PendingDeposit | Confirmed | Cancelled | Completed)
                | (PendingDeposit, DepositPaid | Confirmed | Cancelled)
                | (DepositPaid, Confirmed | Completed | Cancelled)
                | (Confirmed, Completed | Cancelled)
        )
    }
}

/// Status, deposit and hold a new reservation starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InitialState {
    pub status: AppointmentStatus,
    pub deposit_cents: i64,
    pub hold_until: Option<Ms>,
}

/// Deposit policy: a priced deposit puts the slot on hold; exempt customers
/// skip it entirely whatever the service asks for.
pub(crate) fn initial_state(
    cfg: &TenantConfig,
    service: &Service,
    customer: &Customer,
    now: Ms,
) -> InitialState {
    let deposit = if cfg.deposits_enabled {
        service.price_cents * service.deposit_percent.min(100) as i64 / 100
    } else {
        0
    };
    if customer.deposit_exempt || deposit <= 0 {
        return InitialState { status: AppointmentStatus::Scheduled, deposit_cents: 0, hold_until: None };
    }
    InitialState {
        status: AppointmentStatus::PendingDeposit,
        deposit_cents: deposit,
        hold_until: Some(now + cfg.hold_ms()),
    }
}

impl Engine {
    /// Move one appointment to `next`. Returns false when it was already there
    /// (idempotent repeat), and `INVALID_TRANSITION` when the move is not allowed.
    async fn transition(
        &self,
        ctx: &AccessContext,
        id: Ulid,
        next: AppointmentStatus,
        edit: impl FnOnce(&mut Appointment),
    ) -> Result<bool, EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let customer_id = {
            let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.read().await;
            guard.appointments.get(&id).ok_or(EngineError::NotFound(id))?.customer_id
        };

        let mut txn = Txn::new();
        txn.lock_resources(self, [resource_id]).await?;
        txn.lock_customers(self, [customer_id]).await?;

        let mut appointment = txn
            .resource(resource_id)?
            .appointments
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        ctx.require_access(appointment.branch_id)?;

        let from = appointment.status;
        if from == next {
            return Ok(false);
        }
        if !from.can_transition_to(next) {
            return Err(EngineError::InvalidTransition { from, to: next });
        }
        appointment.status = next;
        if next != AppointmentStatus::PendingDeposit {
            appointment.hold_until = None;
        }
        edit(&mut appointment);

        txn.stage(Event::AppointmentSaved { appointment, previous_resource: None });
        txn.commit(self).await?;
        info!("appointment {id}: {} -> {}", from.as_str(), next.as_str());
        Ok(true)
    }

    /// Cancel from any non-terminal state. Cancelling twice is a no-op.
    pub async fn cancel_appointment(&self, ctx: &AccessContext, id: Ulid) -> Result<bool, EngineError> {
        self.transition(ctx, id, AppointmentStatus::Cancelled, |_| {}).await
    }

    /// Put a scheduled appointment on hold pending a deposit of `deposit_cents`.
    pub async fn request_deposit(
        &self,
        ctx: &AccessContext,
        id: Ulid,
        deposit_cents: i64,
    ) -> Result<bool, EngineError> {
        if deposit_cents <= 0 {
            return Err(EngineError::LimitExceeded("deposit must be positive"));
        }
        let hold_until = now_ms() + self.config().hold_ms();
        self.transition(ctx, id, AppointmentStatus::PendingDeposit, |a| {
            a.deposit_cents = deposit_cents;
            a.hold_until = Some(hold_until);
        })
        .await
    }

    /// Payment confirmation from the payment collaborator.
    pub async fn confirm_deposit(&self, id: Ulid) -> Result<bool, EngineError> {
        let ctx = AccessContext::system("payments");
        let changed = self.transition(&ctx, id, AppointmentStatus::DepositPaid, |_| {}).await?;
        debug!("deposit confirmed for {id}");
        Ok(changed)
    }

    pub async fn confirm_appointment(&self, ctx: &AccessContext, id: Ulid) -> Result<bool, EngineError> {
        self.transition(ctx, id, AppointmentStatus::Confirmed, |_| {}).await
    }

    pub async fn complete_appointment(&self, ctx: &AccessContext, id: Ulid) -> Result<bool, EngineError> {
        self.transition(ctx, id, AppointmentStatus::Completed, |_| {}).await
    }

    /// Administrative hard delete. Series occurrences are only ever cancelled.
    pub async fn delete_appointment(&self, ctx: &AccessContext, id: Ulid) -> Result<(), EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let customer_id = {
            let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.read().await;
            guard.appointments.get(&id).ok_or(EngineError::NotFound(id))?.customer_id
        };

        let mut txn = Txn::new();
        txn.lock_resources(self, [resource_id]).await?;
        txn.lock_customers(self, [customer_id]).await?;
        let appointment = txn
            .resource(resource_id)?
            .appointments
            .get(&id)
            .ok_or(EngineError::NotFound(id))?;
        ctx.require_access(appointment.branch_id)?;
        if appointment.series_id.is_some() {
            return Err(EngineError::SeriesMember(id));
        }

        txn.stage(Event::AppointmentDeleted { id, resource_id, customer_id });
        txn.commit(self).await?;
        info!("appointment {id} deleted");
        Ok(())
    }
}
