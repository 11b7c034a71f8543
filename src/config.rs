use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{Ms, HOUR, MINUTE};
use crate::settings::{OpeningHours, Settings};

/// Process configuration, read once at startup from `DESKBOOK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub idempotency_cleanup_interval: Duration,
    pub idempotency_ttl: Duration,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// How long a caller waits for a resource lock before giving up.
    pub store_timeout: Duration,
    /// Initial policy settings; replaceable at runtime.
    pub settings: Settings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str, default: u64| parse_or(lookup(key), default);

        let defaults = Settings::default();
        let minutes = |key: &str, default: Ms| parse_or(lookup(key), default / MINUTE) * MINUTE;
        let hours = |key: &str, default: Ms| parse_or(lookup(key), default / HOUR) * HOUR;

        let open: Option<u32> = lookup("DESKBOOK_OPEN_HOUR").and_then(|s| s.parse().ok());
        let close: Option<u32> = lookup("DESKBOOK_CLOSE_HOUR").and_then(|s| s.parse().ok());
        let opening_hours = match (open, close) {
            (Some(open), Some(close)) => OpeningHours::new(open.saturating_mul(60), close.saturating_mul(60)),
            _ => None,
        };

        let utc_offset_minutes: i32 = parse_or(lookup("DESKBOOK_UTC_OFFSET_MINUTES"), 0);
        let settings = Settings {
            min_duration_ms: minutes("DESKBOOK_MIN_DURATION_MINUTES", defaults.min_duration_ms),
            max_duration_ms: hours("DESKBOOK_MAX_DURATION_HOURS", defaults.max_duration_ms),
            daily_limit_ms: hours("DESKBOOK_DAILY_LIMIT_HOURS", defaults.daily_limit_ms),
            grace_window_ms: minutes("DESKBOOK_GRACE_MINUTES", defaults.grace_window_ms),
            utc_offset_secs: utc_offset_minutes.saturating_mul(60),
            opening_hours,
        };

        Self {
            data_dir: lookup("DESKBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: lookup("DESKBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
            sweep_interval: Duration::from_secs(parsed("DESKBOOK_SWEEP_INTERVAL_SECS", 60)),
            idempotency_cleanup_interval: Duration::from_secs(parsed(
                "DESKBOOK_IDEMPOTENCY_CLEANUP_SECS",
                3600,
            )),
            idempotency_ttl: Duration::from_secs(parsed("DESKBOOK_IDEMPOTENCY_TTL_SECS", 86_400)),
            compact_threshold: parsed("DESKBOOK_COMPACT_THRESHOLD", 1000),
            store_timeout: Duration::from_millis(parsed("DESKBOOK_STORE_TIMEOUT_MS", 500)),
            settings,
        }
    }

    pub fn idempotency_ttl_ms(&self) -> Ms {
        Ms::try_from(self.idempotency_ttl.as_millis()).unwrap_or(Ms::MAX)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
