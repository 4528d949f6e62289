//! Local-calendar views of `Ms` instants under a tenant's fixed UTC offset.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, Offset, Timelike, Utc, Weekday,
};

use crate::model::{Ms, MINUTE_MS};

pub fn offset(utc_offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| Utc.fix())
}

pub fn to_local(t: Ms, utc_offset_minutes: i32) -> DateTime<FixedOffset> {
    DateTime::<Utc>::from_timestamp_millis(t)
        .unwrap_or_default()
        .with_timezone(&offset(utc_offset_minutes))
}

pub fn weekday(t: Ms, utc_offset_minutes: i32) -> Weekday {
    to_local(t, utc_offset_minutes).weekday()
}

pub fn local_date(t: Ms, utc_offset_minutes: i32) -> NaiveDate {
    to_local(t, utc_offset_minutes).date_naive()
}

pub fn minute_of_day(t: Ms, utc_offset_minutes: i32) -> u32 {
    let local = to_local(t, utc_offset_minutes);
    local.hour() * 60 + local.minute()
}

/// Instant of local midnight starting `date`.
pub fn midnight(date: NaiveDate, utc_offset_minutes: i32) -> Ms {
    let utc_midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp_millis();
    utc_midnight - utc_offset_minutes as Ms * MINUTE_MS
}

/// Local (ISO year, ISO week) of an instant.
pub fn iso_week_key(t: Ms, utc_offset_minutes: i32) -> (i32, u32) {
    let week = to_local(t, utc_offset_minutes).iso_week();
    (week.year(), week.week())
}

/// Local (year, month) of an instant.
pub fn month_key(t: Ms, utc_offset_minutes: i32) -> (i32, u32) {
    let local = to_local(t, utc_offset_minutes);
    (local.year(), local.month())
}

pub fn add_days(t: Ms, days: u32) -> Ms {
    t + Duration::days(days as i64).num_milliseconds()
}

/// Add calendar months in local time; day-of-month clamps to the target month.
pub fn add_months(t: Ms, months: u32, utc_offset_minutes: i32) -> Ms {
    let local = to_local(t, utc_offset_minutes);
    local
        .checked_add_months(Months::new(months))
        .map(|d| d.timestamp_millis())
        .unwrap_or(t)
}

/// Move an instant to `day` of its local month, clamped to the month's length.
pub fn snap_to_day_of_month(t: Ms, day: u32, utc_offset_minutes: i32) -> Ms {
    let local = to_local(t, utc_offset_minutes);
    let last = days_in_month(local.year(), local.month());
    local
        .with_day(day.clamp(1, last))
        .map(|d| d.timestamp_millis())
        .unwrap_or(t)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
