//! Booking rules. Everything here is pure: the caller passes `now`, the
//! current settings and (for the daily budget) the holder's usage. None of
//! these checks is authoritative under races; overlap exclusion belongs to
//! the engine's atomic insert.

use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, ReservationStatus, Span};
use crate::settings::Settings;
use crate::window::{booking_window, day_span};

/// A rejection the caller can fix by changing the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("cannot book in the past")]
    StartInPast,
    #[error("start is beyond the booking window (closes at {closes})")]
    BeyondWindow { closes: Ms },
    #[error("duration {duration_ms}ms is shorter than the minimum {min_ms}ms")]
    TooShort { duration_ms: Ms, min_ms: Ms },
    #[error("duration {duration_ms}ms is longer than the maximum {max_ms}ms")]
    TooLong { duration_ms: Ms, max_ms: Ms },
    #[error("reservation must lie within opening hours")]
    OutsideOpeningHours,
    #[error("daily limit exceeded: {used_ms}ms booked + {requested_ms}ms requested > {limit_ms}ms")]
    DailyLimitExceeded {
        used_ms: Ms,
        requested_ms: Ms,
        limit_ms: Ms,
    },
    #[error("too early to check in (opens at {opens_at})")]
    CheckInTooEarly { opens_at: Ms },
    #[error("too late to check in (closed at {closed_at})")]
    CheckInTooLate { closed_at: Ms },
    #[error("reservation has already started and can no longer be cancelled")]
    CancelAfterStart,
    #[error("reservation can only be ended early while in progress")]
    NotInProgress,
    #[error("reservation is {0}, not confirmed")]
    NotConfirmed(ReservationStatus),
    #[error("invalid input: {0}")]
    Limit(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(Ulid),
    #[error("a reason is required")]
    ReasonRequired,
}

impl Violation {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Violation::StartInPast => "start_in_past",
            Violation::BeyondWindow { .. } => "beyond_window",
            Violation::TooShort { .. } => "too_short",
            Violation::TooLong { .. } => "too_long",
            Violation::OutsideOpeningHours => "outside_opening_hours",
            Violation::DailyLimitExceeded { .. } => "daily_limit",
            Violation::CheckInTooEarly { .. } => "check_in_too_early",
            Violation::CheckInTooLate { .. } => "check_in_too_late",
            Violation::CancelAfterStart => "cancel_after_start",
            Violation::NotInProgress => "not_in_progress",
            Violation::NotConfirmed(_) => "not_confirmed",
            Violation::Limit(_) => "limit",
            Violation::AlreadyExists(_) => "already_exists",
            Violation::ReasonRequired => "reason_required",
        }
    }
}

/// The request-shape checks, in order; first failure wins. The daily budget
/// needs a storage read and is checked separately by `check_daily_limit`.
pub fn validate(span: &Span, now: Ms, settings: &Settings) -> Result<(), Violation> {
    if span.start < now {
        return Err(Violation::StartInPast);
    }
    let window = booking_window(now, settings.zone());
    if !window.admits(span.start) {
        return Err(Violation::BeyondWindow {
            closes: window.closes,
        });
    }
    let duration_ms = span.duration_ms();
    if duration_ms < settings.min_duration_ms {
        return Err(Violation::TooShort {
            duration_ms,
            min_ms: settings.min_duration_ms,
        });
    }
    if duration_ms > settings.max_duration_ms {
        return Err(Violation::TooLong {
            duration_ms,
            max_ms: settings.max_duration_ms,
        });
    }
    if let Some(open) = opening_span(span.start, settings)
        && !open.contains_span(span)
    {
        return Err(Violation::OutsideOpeningHours);
    }
    Ok(())
}

/// Opening hours on the day containing `t`, if configured.
pub fn opening_span(t: Ms, settings: &Settings) -> Option<Span> {
    let hours = settings.opening_hours?;
    let day = day_span(t, settings.zone());
    Span::try_new(
        day.start + hours.open_offset_ms(),
        day.start + hours.close_offset_ms(),
    )
}

/// `used_ms` is the holder's active time already booked on the day
/// containing `span.start`, clipped to that day.
pub fn check_daily_limit(span: &Span, used_ms: Ms, settings: &Settings) -> Result<(), Violation> {
    let requested_ms = span.duration_ms();
    if used_ms + requested_ms > settings.daily_limit_ms {
        return Err(Violation::DailyLimitExceeded {
            used_ms,
            requested_ms,
            limit_ms: settings.daily_limit_ms,
        });
    }
    Ok(())
}

/// Check-in is accepted within `[start - grace, start + grace]`.
pub fn check_in_window(span: &Span, now: Ms, settings: &Settings) -> Result<(), Violation> {
    let opens_at = span.start - settings.grace_window_ms;
    let closed_at = span.start + settings.grace_window_ms;
    if now < opens_at {
        return Err(Violation::CheckInTooEarly { opens_at });
    }
    if now > closed_at {
        return Err(Violation::CheckInTooLate { closed_at });
    }
    Ok(())
}

pub fn end_early_window(span: &Span, now: Ms) -> Result<(), Violation> {
    if span.contains_instant(now) {
        Ok(())
    } else {
        Err(Violation::NotInProgress)
    }
}
