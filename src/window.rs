//! Calendar arithmetic in the single fixed zone: days, weeks and the
//! rolling booking window (current week plus next week, Monday to Sunday).

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

use crate::model::{Ms, Span, DAY};

/// The range in which a new reservation may start: `[opens, closes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingWindow {
    pub opens: Ms,
    /// Monday 00:00 after next week; the last bookable instant is
    /// Sunday 23:59:59.999 of next week.
    pub closes: Ms,
}

impl BookingWindow {
    pub fn admits(&self, start: Ms) -> bool {
        self.opens <= start && start < self.closes
    }
}

fn local(t: Ms, zone: FixedOffset) -> DateTime<FixedOffset> {
    DateTime::<Utc>::from_timestamp_millis(t)
        .unwrap_or_default()
        .with_timezone(&zone)
}

/// Local midnight at or before `t`.
pub fn start_of_day(t: Ms, zone: FixedOffset) -> Ms {
    let at = local(t, zone);
    let into_day = Ms::from(at.num_seconds_from_midnight()) * 1000
        + Ms::from(at.timestamp_subsec_millis());
    t - into_day
}

/// The calendar day containing `t`, `[00:00, 24:00)` local.
pub fn day_span(t: Ms, zone: FixedOffset) -> Span {
    let start = start_of_day(t, zone);
    Span::new(start, start + DAY)
}

/// Monday 00:00 local at or before `t`. An instant exactly on Monday 00:00
/// starts its own week.
pub fn start_of_week(t: Ms, zone: FixedOffset) -> Ms {
    let weekday = local(t, zone).weekday().num_days_from_monday();
    start_of_day(t, zone) - Ms::from(weekday) * DAY
}

pub fn booking_window(now: Ms, zone: FixedOffset) -> BookingWindow {
    BookingWindow {
        opens: now,
        closes: start_of_week(now, zone) + 14 * DAY,
    }
}
