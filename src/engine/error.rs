use chrono::Weekday;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resource {resource_id} already booked by {conflicting_id} around {start}")]
    OverlapConflict {
        resource_id: Ulid,
        conflicting_id: Ulid,
        start: Ms,
    },
    #[error("[{start}, {end}) is outside working hours on {weekday}")]
    OutsideWorkingHours { weekday: Weekday, start: Ms, end: Ms },
    #[error("resource has no schedule on {0}")]
    NoScheduleForDay(Weekday),
    #[error("quota exceeded: {quota} limit is {limit}")]
    QuotaExceeded { quota: &'static str, limit: u32 },
    #[error("membership overdue since {due_with_grace}")]
    MembershipOverdue { due_with_grace: Ms },
    #[error("an active membership is required")]
    MembershipRequired,
    #[error("{requested} occurrences requested, at most {max} allowed")]
    TooManyOccurrences { requested: u32, max: u32 },
    #[error("recurrence needs a count or an end date")]
    MissingTermination,
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(&'static str),
    #[error("branch {0} is outside the caller's access")]
    ForbiddenBranch(Ulid),
    #[error("operation needs access to every branch")]
    AllBranchesRequired,
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),
    #[error("invalid scope: {0}")]
    InvalidScope(&'static str),
    #[error("cannot move from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("resource {0} is inactive")]
    InactiveResource(Ulid),
    #[error("capacity {0} exceeded: all seats taken")]
    CapacityExceeded(u32),
    #[error("customer already enrolled in session {0}")]
    AlreadyEnrolled(Ulid),
    #[error("appointment {0} belongs to a series; cancel it instead")]
    SeriesMember(Ulid),
    #[error("tenant has no primary branch")]
    NoPrimaryBranch,
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("occurrence #{index} at {start}: {source}")]
    Occurrence {
        index: usize,
        start: Ms,
        #[source]
        source: Box<EngineError>,
    },
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable taxonomy code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::OverlapConflict { .. } => "OVERLAP_CONFLICT",
            EngineError::OutsideWorkingHours { .. } => "OUTSIDE_WORKING_HOURS",
            EngineError::NoScheduleForDay(_) => "NO_SCHEDULE_FOR_DAY",
            EngineError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            EngineError::MembershipOverdue { .. } => "MEMBERSHIP_OVERDUE",
            EngineError::MembershipRequired => "MEMBERSHIP_REQUIRED",
            EngineError::TooManyOccurrences { .. } => "TOO_MANY_OCCURRENCES",
            EngineError::MissingTermination => "MISSING_TERMINATION",
            EngineError::InvalidRecurrence(_) => "INVALID_RECURRENCE",
            EngineError::ForbiddenBranch(_) | EngineError::AllBranchesRequired => {
                "FORBIDDEN_BRANCH"
            }
            EngineError::InvalidTimeRange(_) => "INVALID_TIME_RANGE",
            EngineError::InvalidScope(_) => "INVALID_SCOPE",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::InactiveResource(_) => "INACTIVE_RESOURCE",
            EngineError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            EngineError::AlreadyEnrolled(_) => "ALREADY_ENROLLED",
            EngineError::SeriesMember(_) => "SERIES_MEMBER",
            EngineError::NoPrimaryBranch | EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::Occurrence { source, .. } => source.code(),
            EngineError::WalError(_) => "WAL_ERROR",
        }
    }

    /// The cause with any occurrence wrapper peeled off.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Occurrence { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn at_occurrence(self, index: usize, start: Ms) -> EngineError {
        EngineError::Occurrence {
            index,
            start,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occurrence_wrapper_keeps_cause_code() {
        let err = EngineError::QuotaExceeded { quota: "active_appointments", limit: 2 }
            .at_occurrence(2, 1_000);
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
        assert!(matches!(err.root(), EngineError::QuotaExceeded { limit: 2, .. }));
        assert!(err.to_string().starts_with("occurrence #2 at 1000"));
    }

    #[test]
    fn branch_errors_are_distinct() {
        assert_eq!(EngineError::ForbiddenBranch(Ulid::new()).code(), "FORBIDDEN_BRANCH");
        assert_eq!(EngineError::NoPrimaryBranch.code(), "NOT_FOUND");
    }
}
