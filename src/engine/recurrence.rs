use crate::calendar;
use crate::limits::{MAX_INTERVAL_WEEKS, MAX_OCCURRENCES_CEILING, MAX_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::EngineError;

/// Expand a weekly rule into occurrence start times, first occurrence included.
///
/// `count` wins over `until` when both are given. `until` is a local calendar
/// date and is inclusive. Nothing is produced unless the whole series fits
/// under `ceiling`.
pub fn expand(
    first_start: Ms,
    rule: &RecurrenceRule,
    ceiling: u32,
    utc_offset_minutes: i32,
) -> Result<Vec<Ms>, EngineError> {
    if rule.interval_weeks == 0 {
        return Err(EngineError::InvalidRecurrence("interval must be at least one week"));
    }
    if rule.interval_weeks > MAX_INTERVAL_WEEKS {
        return Err(EngineError::InvalidRecurrence("interval longer than a year"));
    }
    let ceiling = ceiling.min(MAX_OCCURRENCES_CEILING);
    let step = WEEK_MS * rule.interval_weeks as Ms;

    match (rule.count, rule.until) {
        (Some(0), _) => Err(EngineError::InvalidRecurrence("count must be positive")),
        (Some(count), _) => {
            if count > ceiling {
                return Err(EngineError::TooManyOccurrences { requested: count, max: ceiling });
            }
            Ok((0..count as Ms).map(|k| first_start + k * step).collect())
        }
        (None, Some(until)) => {
            if until > calendar::local_date(MAX_VALID_TIMESTAMP_MS, utc_offset_minutes) {
                return Err(EngineError::InvalidTimeRange(format!(
                    "end date {until} out of range"
                )));
            }
            if calendar::local_date(first_start, utc_offset_minutes) > until {
                return Err(EngineError::InvalidRecurrence("end date precedes first occurrence"));
            }
            let mut starts = Vec::new();
            let mut t = first_start;
            while calendar::local_date(t, utc_offset_minutes) <= until {
                if starts.len() as u32 == ceiling {
                    // Count the rest only to report how far over the ceiling we are.
                    let mut requested = ceiling;
                    while calendar::local_date(t, utc_offset_minutes) <= until {
                        requested += 1;
                        t += step;
                    }
                    return Err(EngineError::TooManyOccurrences { requested, max: ceiling });
                }
                starts.push(t);
                t += step;
            }
            Ok(starts)
        }
        (None, None) => Err(EngineError::MissingTermination),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // 2024-03-04T10:00:00Z, a Monday.
    const START: Ms = 1_709_510_400_000 + 10 * HOUR_MS;

    fn rule(interval_weeks: u32, count: Option<u32>, until: Option<NaiveDate>) -> RecurrenceRule {
        RecurrenceRule { interval_weeks, count, until }
    }

    #[test]
    fn weekly_count() {
        let starts = expand(START, &rule(1, Some(4), None), 26, 0).unwrap();
        assert_eq!(starts, vec![START, START + WEEK_MS, START + 2 * WEEK_MS, START + 3 * WEEK_MS]);
    }

    #[test]
    fn every_other_week() {
        let starts = expand(START, &rule(2, Some(3), None), 26, 0).unwrap();
        assert_eq!(starts, vec![START, START + 2 * WEEK_MS, START + 4 * WEEK_MS]);
    }

    #[test]
    fn count_at_ceiling_accepted_above_rejected() {
        assert_eq!(expand(START, &rule(1, Some(26), None), 26, 0).unwrap().len(), 26);
        let err = expand(START, &rule(1, Some(27), None), 26, 0).unwrap_err();
        assert!(matches!(err, EngineError::TooManyOccurrences { requested: 27, max: 26 }));
    }

    #[test]
    fn until_is_inclusive() {
        let until = NaiveDate::from_ymd_opt(2024, 3, 25).unwrap();
        let starts = expand(START, &rule(1, None, Some(until)), 26, 0).unwrap();
        assert_eq!(starts.len(), 4);
        assert_eq!(*starts.last().unwrap(), START + 3 * WEEK_MS);
    }

    #[test]
    fn until_past_ceiling_rejected() {
        let until = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let err = expand(START, &rule(1, None, Some(until)), 26, 0).unwrap_err();
        assert!(matches!(err, EngineError::TooManyOccurrences { requested: 53, max: 26 }));
    }

    #[test]
    fn missing_termination() {
        let err = expand(START, &rule(1, None, None), 26, 0).unwrap_err();
        assert_eq!(err.code(), "MISSING_TERMINATION");
    }

    #[test]
    fn degenerate_rules() {
        assert_eq!(expand(START, &rule(0, Some(2), None), 26, 0).unwrap_err().code(), "INVALID_RECURRENCE");
        assert_eq!(expand(START, &rule(1, Some(0), None), 26, 0).unwrap_err().code(), "INVALID_RECURRENCE");
        let before = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            expand(START, &rule(1, None, Some(before)), 26, 0).unwrap_err().code(),
            "INVALID_RECURRENCE"
        );
    }

    #[test]
    fn out_of_range_rules_rejected() {
        let err = expand(START, &rule(u32::MAX, Some(26), None), 26, 0).unwrap_err();
        assert_eq!(err.code(), "INVALID_RECURRENCE");
        assert_eq!(expand(START, &rule(52, Some(3), None), 26, 0).unwrap().len(), 3);

        let err = expand(START, &rule(1, None, Some(NaiveDate::MAX)), 26, 0).unwrap_err();
        assert_eq!(err.code(), "INVALID_TIME_RANGE");
    }
}
