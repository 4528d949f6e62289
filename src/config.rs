use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::limits::{DEFAULT_MAX_OCCURRENCES, MAX_HOLD_MINUTES};

/// Per-tenant scheduling settings. Seeded from the process defaults and
/// changed through `Engine::set_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Idle minutes required between two bookings on the same resource.
    pub buffer_minutes: u32,
    /// How long a pending deposit keeps the slot on hold.
    pub deposit_hold_minutes: u32,
    pub deposits_enabled: bool,
    pub membership_required_for_appointments: bool,
    pub membership_required_for_classes: bool,
    pub max_occurrences: u32,
    /// Fixed offset used for weekdays, working hours and quota periods.
    pub utc_offset_minutes: i32,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            buffer_minutes: 0,
            deposit_hold_minutes: 30,
            deposits_enabled: true,
            membership_required_for_appointments: false,
            membership_required_for_classes: false,
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
            utc_offset_minutes: 0,
        }
    }
}

impl TenantConfig {
    pub fn buffer_ms(&self) -> i64 {
        self.buffer_minutes as i64 * crate::model::MINUTE_MS
    }

    /// Hold length actually granted, capped at the engine maximum.
    pub fn hold_ms(&self) -> i64 {
        self.deposit_hold_minutes.min(MAX_HOLD_MINUTES) as i64 * crate::model::MINUTE_MS
    }
}

/// Process configuration, read from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tenant_defaults: TenantConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let base = TenantConfig::default();
        let tenant_defaults = TenantConfig {
            buffer_minutes: parsed(&lookup, "SLOTWISE_BUFFER_MINUTES").unwrap_or(base.buffer_minutes),
            deposit_hold_minutes: parsed(&lookup, "SLOTWISE_HOLD_MINUTES")
                .unwrap_or(base.deposit_hold_minutes),
            utc_offset_minutes: parsed(&lookup, "SLOTWISE_UTC_OFFSET_MINUTES")
                .unwrap_or(base.utc_offset_minutes),
            ..base
        };

        Self {
            bind: lookup("SLOTWISE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "SLOTWISE_PORT").unwrap_or(7433),
            data_dir: PathBuf::from(lookup("SLOTWISE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parsed(&lookup, "SLOTWISE_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "SLOTWISE_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&lookup, "SLOTWISE_METRICS_PORT"),
            tenant_defaults,
        }
    }
}
