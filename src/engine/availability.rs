use chrono::NaiveDate;

use crate::calendar;
use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Open window of `resource` on the local calendar day `date`, if it works that day.
pub fn working_window(resource: &ResourceState, date: NaiveDate, utc_offset_minutes: i32) -> Option<Span> {
    use chrono::Datelike;
    let window = resource.working_hours.window(date.weekday())?;
    if window.close_minute <= window.open_minute {
        return None;
    }
    let midnight = calendar::midnight(date, utc_offset_minutes);
    Some(Span::new(
        midnight + window.open_minute as Ms * MINUTE_MS,
        midnight + window.close_minute as Ms * MINUTE_MS,
    ))
}

/// Free time inside `window`: every blocking entry is widened by `buffer` on
/// both sides and carved out, so any gap returned here can be booked whole.
pub fn free_spans(resource: &ResourceState, window: &Span, buffer: Ms) -> Vec<Span> {
    let search = Span::new(window.start - buffer, window.end + buffer);
    // Padding every entry by the same amount keeps the index order.
    let padded: Vec<Span> = resource
        .overlapping(&search)
        .map(|i| Span::new(i.span.start - buffer, i.span.end + buffer))
        .collect();
    if padded.is_empty() {
        return vec![*window];
    }
    subtract_intervals(&[*window], &merge_overlapping(&padded))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;
    // 2024-03-04T00:00:00Z, a Monday.
    const MON: Ms = 1_709_510_400_000;

    fn make_resource(intervals: Vec<Interval>) -> ResourceState {
        let mut rs = ResourceState::new(ResourceInfo {
            id: Ulid::new(),
            branch_id: None,
            name: None,
            active: true,
        });
        rs.working_hours = WeeklySchedule::new().with_day(Weekday::Mon, 9 * 60, 17 * 60);
        for i in intervals {
            rs.insert_interval(i);
        }
        rs
    }

    fn busy(start: Ms, end: Ms, kind: IntervalKind) -> Interval {
        Interval { id: Ulid::new(), span: Span::new(start, end), kind }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        let result = subtract_intervals(&base, &remove);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_partial_left() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 150)];
        assert_eq!(subtract_intervals(&base, &remove), vec![Span::new(150, 200)]);
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(
            result,
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── free_spans ───────────────────────────────────────

    #[test]
    fn working_window_follows_weekday() {
        let rs = make_resource(vec![]);
        assert_eq!(working_window(&rs, monday(), 0), Some(Span::new(MON + 9 * H, MON + 17 * H)));
        assert_eq!(working_window(&rs, monday().succ_opt().unwrap(), 0), None);
        // At UTC-3 local 09:00 is 12:00 UTC.
        assert_eq!(
            working_window(&rs, monday(), -180),
            Some(Span::new(MON + 12 * H, MON + 20 * H))
        );
    }

    #[test]
    fn free_spans_carve_out_bookings_and_time_off() {
        let rs = make_resource(vec![
            busy(MON + 10 * H, MON + 10 * H + 30 * M, IntervalKind::Appointment),
            busy(MON + 13 * H, MON + 14 * H, IntervalKind::TimeOff),
        ]);
        let window = working_window(&rs, monday(), 0).unwrap();
        assert_eq!(
            free_spans(&rs, &window, 0),
            vec![
                Span::new(MON + 9 * H, MON + 10 * H),
                Span::new(MON + 10 * H + 30 * M, MON + 13 * H),
                Span::new(MON + 14 * H, MON + 17 * H),
            ]
        );
    }

    #[test]
    fn free_spans_pad_by_buffer() {
        let rs = make_resource(vec![busy(MON + 10 * H, MON + 11 * H, IntervalKind::Class)]);
        let window = working_window(&rs, monday(), 0).unwrap();
        assert_eq!(
            free_spans(&rs, &window, 15 * M),
            vec![
                Span::new(MON + 9 * H, MON + 9 * H + 45 * M),
                Span::new(MON + 11 * H + 15 * M, MON + 17 * H),
            ]
        );
    }

    #[test]
    fn free_spans_sees_entries_just_outside_window() {
        // Ends at opening; the buffer still eats into the morning.
        let rs = make_resource(vec![busy(MON + 8 * H, MON + 9 * H, IntervalKind::TimeOff)]);
        let window = working_window(&rs, monday(), 0).unwrap();
        assert_eq!(free_spans(&rs, &window, 10 * M), vec![Span::new(MON + 9 * H + 10 * M, MON + 17 * H)]);
    }
}
