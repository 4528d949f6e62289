use crate::model::{Ms, DAY_MS};

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;

/// Default ceiling on occurrences produced by one recurrence rule.
pub const DEFAULT_MAX_OCCURRENCES: u32 = 26;
/// Hard ceiling no tenant setting can exceed.
pub const MAX_OCCURRENCES_CEILING: u32 = 104;
/// Widest gap between two occurrences of a weekly rule.
pub const MAX_INTERVAL_WEEKS: u32 = 52;
pub const MAX_HOLD_MINUTES: u32 = 24 * 60;
pub const MAX_CLASS_CAPACITY: u32 = 1_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_SPAN_DURATION_MS: Ms = DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 92 * DAY_MS;

/// Longest JSON request line accepted by the wire front end.
pub const MAX_LINE_LEN: usize = 64 * 1024;
