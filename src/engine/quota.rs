use std::collections::HashMap;

use serde::Serialize;
use ulid::Ulid;

use crate::calendar;
use crate::config::TenantConfig;
use crate::model::*;

use super::EngineError;

/// What a reservation consumes from a membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Appointment,
    Class,
}

/// Membership state returned to the caller alongside an accepted booking.
/// Interest is reported for display and billing, never charged here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipStanding {
    pub plan_id: Ulid,
    pub due_at: Ms,
    pub due_with_grace: Ms,
    pub is_overdue: bool,
    pub interest_due_cents: i64,
}

/// Running usage for the reservations admitted so far in one operation.
///
/// Storage only knows about committed rows; a batch being validated has to
/// count its own earlier occurrences, so the tracker travels with the batch
/// and is dropped with it.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    pending_active: u32,
    weekly: HashMap<(i32, u32), u32>,
    monthly: HashMap<(i32, u32), u32>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one more blocking appointment against `plan.max_active_appointments`.
    pub fn admit_appointment(
        &mut self,
        plan: &MembershipPlan,
        customer: &CustomerState,
    ) -> Result<(), EngineError> {
        if let Some(limit) = plan.max_active_appointments {
            let in_use = customer.active_appointments.len() as u32 + self.pending_active;
            if in_use >= limit {
                return Err(EngineError::QuotaExceeded { quota: "active_appointments", limit });
            }
        }
        self.pending_active += 1;
        Ok(())
    }

    /// Admit one more class seat in the ISO week and calendar month of `session_start`.
    pub fn admit_class(
        &mut self,
        plan: &MembershipPlan,
        customer: &CustomerState,
        session_start: Ms,
        utc_offset_minutes: i32,
    ) -> Result<(), EngineError> {
        let week = calendar::iso_week_key(session_start, utc_offset_minutes);
        let month = calendar::month_key(session_start, utc_offset_minutes);

        let (mut in_week, mut in_month) = (0u32, 0u32);
        for (start, status) in customer.enrollments.values() {
            if !status.holds_seat() {
                continue;
            }
            if calendar::iso_week_key(*start, utc_offset_minutes) == week {
                in_week += 1;
            }
            if calendar::month_key(*start, utc_offset_minutes) == month {
                in_month += 1;
            }
        }
        in_week += self.weekly.get(&week).copied().unwrap_or(0);
        in_month += self.monthly.get(&month).copied().unwrap_or(0);

        if let Some(limit) = plan.max_classes_per_week
            && in_week >= limit
        {
            return Err(EngineError::QuotaExceeded { quota: "classes_per_week", limit });
        }
        if let Some(limit) = plan.max_classes_per_month
            && in_month >= limit
        {
            return Err(EngineError::QuotaExceeded { quota: "classes_per_month", limit });
        }
        *self.weekly.entry(week).or_default() += 1;
        *self.monthly.entry(month).or_default() += 1;
        Ok(())
    }
}

/// The customer's active plan, if the gate applies to them at all.
///
/// A tenant that requires a membership for `kind` rejects customers without one.
pub(crate) fn active_plan(
    cfg: &TenantConfig,
    customer: &CustomerState,
    plans: &dashmap::DashMap<Ulid, MembershipPlan>,
    kind: UsageKind,
) -> Result<Option<(Subscription, MembershipPlan)>, EngineError> {
    let required = match kind {
        UsageKind::Appointment => cfg.membership_required_for_appointments,
        UsageKind::Class => cfg.membership_required_for_classes,
    };
    let Some(subscription) = customer.active_subscription() else {
        return if required { Err(EngineError::MembershipRequired) } else { Ok(None) };
    };
    let plan = plans
        .get(&subscription.plan_id)
        .map(|p| p.value().clone())
        .ok_or(EngineError::NotFound(subscription.plan_id))?;
    Ok(Some((subscription.clone(), plan)))
}

/// When the next charge falls due: the explicit next charge date, else one
/// billing cycle after the last payment (or after the start when never paid).
pub fn due_at(plan: &MembershipPlan, subscription: &Subscription, utc_offset_minutes: i32) -> Ms {
    if let Some(next) = subscription.next_charge_at {
        return next;
    }
    let base = subscription.last_payment_at.unwrap_or(subscription.started_at);
    match plan.billing {
        BillingCycle::Days(days) => calendar::add_days(base, days),
        BillingCycle::Months(months) => {
            let due = calendar::add_months(base, months, utc_offset_minutes);
            match plan.billing_day {
                Some(day) => calendar::snap_to_day_of_month(due, day, utc_offset_minutes),
                None => due,
            }
        }
    }
}

pub fn interest_due(plan: &MembershipPlan) -> i64 {
    match plan.interest {
        InterestPolicy::None => 0,
        InterestPolicy::Percent(pct) => plan.price_cents * pct as i64 / 100,
        InterestPolicy::FixedCents(cents) => cents,
    }
}

pub fn standing(
    plan: &MembershipPlan,
    subscription: &Subscription,
    now: Ms,
    utc_offset_minutes: i32,
) -> MembershipStanding {
    let due = due_at(plan, subscription, utc_offset_minutes);
    let due_with_grace = calendar::add_days(due, plan.grace_days);
    let is_overdue = now > due_with_grace;
    MembershipStanding {
        plan_id: plan.id,
        due_at: due,
        due_with_grace,
        is_overdue,
        interest_due_cents: if is_overdue { interest_due(plan) } else { 0 },
    }
}

/// Overdue members of auto-blocking plans may not book; everyone else is
/// let through with their standing attached.
pub fn enforce_standing(
    plan: &MembershipPlan,
    standing: &MembershipStanding,
) -> Result<(), EngineError> {
    if standing.is_overdue && plan.auto_block {
        return Err(EngineError::MembershipOverdue { due_with_grace: standing.due_with_grace });
    }
    Ok(())
}
