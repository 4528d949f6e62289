use ulid::Ulid;

use crate::calendar;
use crate::config::TenantConfig;
use crate::limits::{MAX_SPAN_DURATION_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Caller-supplied instants are range-checked before any arithmetic touches them.
pub(crate) fn validate_instant(t: Ms) -> Result<Ms, EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::InvalidTimeRange(format!("timestamp {t} out of range")));
    }
    Ok(t)
}

/// Reject malformed or out-of-range spans before any lock is taken.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidTimeRange(format!(
            "end {end} is not after start {start}"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidTimeRange("timestamp out of range".into()));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::InvalidTimeRange("span longer than a day".into()));
    }
    Ok(Span::new(start, end))
}

/// The availability guard: the span must sit inside the resource's working
/// window for its weekday and clear every blocking entry by the buffer.
/// Entries listed in `exclude` are ignored (they are being moved).
pub(crate) fn check_slot(
    cfg: &TenantConfig,
    rs: &ResourceState,
    span: &Span,
    exclude: &[Ulid],
) -> Result<(), EngineError> {
    if !rs.info.active {
        return Err(EngineError::InactiveResource(rs.id()));
    }
    check_working_hours(cfg, rs, span)?;
    check_no_overlap(rs, span, cfg.buffer_ms(), exclude)
}

pub(crate) fn check_working_hours(
    cfg: &TenantConfig,
    rs: &ResourceState,
    span: &Span,
) -> Result<(), EngineError> {
    let offset = cfg.utc_offset_minutes;
    let weekday = calendar::weekday(span.start, offset);
    let window = rs
        .working_hours
        .window(weekday)
        .ok_or(EngineError::NoScheduleForDay(weekday))?;

    let day_start = calendar::midnight(calendar::local_date(span.start, offset), offset);
    let open = Span::new(
        day_start + window.open_minute as Ms * MINUTE_MS,
        day_start + window.close_minute as Ms * MINUTE_MS,
    );
    // Partial overlap is rejected, never clipped.
    if !open.contains_span(span) {
        return Err(EngineError::OutsideWorkingHours {
            weekday,
            start: span.start,
            end: span.end,
        });
    }
    Ok(())
}

pub(crate) fn check_no_overlap(
    rs: &ResourceState,
    span: &Span,
    buffer: Ms,
    exclude: &[Ulid],
) -> Result<(), EngineError> {
    // Widen the search so entries within `buffer` on either side are seen.
    let search = Span::new(span.start - buffer, span.end + buffer);
    for interval in rs.overlapping(&search) {
        if exclude.contains(&interval.id) {
            continue;
        }
        if interval.span.overlaps_with_buffer(span, buffer) {
            return Err(EngineError::OverlapConflict {
                resource_id: rs.id(),
                conflicting_id: interval.id,
                start: interval.span.start,
            });
        }
    }
    Ok(())
}

/// Spans written by the same transaction on one resource must clear each other too.
/// Returns the index of the later span of the first colliding pair.
pub(crate) fn first_collision_in_batch(spans: &[Span], buffer: Ms) -> Option<usize> {
    for j in 1..spans.len() {
        for i in 0..j {
            if spans[i].overlaps_with_buffer(&spans[j], buffer) {
                return Some(j);
            }
        }
    }
    None
}
