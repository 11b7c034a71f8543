use std::sync::RwLock;

use chrono::{FixedOffset, Offset, Utc};

use crate::model::{Ms, HOUR, MINUTE};

/// Local time-of-day bounds within which reservations must lie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpeningHours {
    /// Minutes after local midnight.
    pub open_minute: u32,
    /// Minutes after local midnight; at most 24 * 60.
    pub close_minute: u32,
}

impl OpeningHours {
    pub fn new(open_minute: u32, close_minute: u32) -> Option<Self> {
        (open_minute < close_minute && close_minute <= 24 * 60).then_some(Self {
            open_minute,
            close_minute,
        })
    }

    pub fn open_offset_ms(&self) -> Ms {
        Ms::from(self.open_minute) * MINUTE
    }

    pub fn close_offset_ms(&self) -> Ms {
        Ms::from(self.close_minute) * MINUTE
    }
}

/// Mutable policy parameters. Read fresh for every validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub min_duration_ms: Ms,
    pub max_duration_ms: Ms,
    pub daily_limit_ms: Ms,
    /// Check-in is accepted this long either side of the start.
    pub grace_window_ms: Ms,
    /// The single fixed zone used for weeks and days, in seconds east of UTC.
    pub utc_offset_secs: i32,
    pub opening_hours: Option<OpeningHours>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_duration_ms: 30 * MINUTE,
            max_duration_ms: 12 * HOUR,
            daily_limit_ms: 10 * HOUR,
            grace_window_ms: 15 * MINUTE,
            utc_offset_secs: 0,
            opening_hours: None,
        }
    }
}

impl Settings {
    pub fn zone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }
}

/// The settings collaborator.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> Settings;
}

/// Settings held in memory and replaceable at runtime by an admin workflow.
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<Settings>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn replace(&self, settings: Settings) {
        match self.inner.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

impl SettingsSource for SharedSettings {
    fn current(&self) -> Settings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
