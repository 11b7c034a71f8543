use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::audit::AuditEntry;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Portion of `self` inside `bounds`, if any.
    pub fn clip(&self, bounds: &Span) -> Option<Span> {
        Span::try_new(self.start.max(bounds.start), self.end.min(bounds.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Confirmed)
    }

    /// Still occupies capacity on its resource.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Confirmed | ReservationStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim by one holder on one resource for a time interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub holder_id: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub checked_in_at: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn new(id: Ulid, resource_id: Ulid, holder_id: String, span: Span, now: Ms) -> Self {
        Self {
            id,
            resource_id,
            holder_id,
            span,
            status: ReservationStatus::Confirmed,
            checked_in_at: None,
            actual_end: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// The part of the resource's timeline this reservation blocks.
    /// Terminal-inactive rows block nothing; a reservation ended early
    /// blocks only `[start, actual_end)` once it has left `confirmed`.
    pub fn occupied(&self) -> Option<Span> {
        match self.status {
            ReservationStatus::Cancelled | ReservationStatus::NoShow => None,
            ReservationStatus::Confirmed => Some(self.span),
            ReservationStatus::Completed => match self.actual_end {
                Some(end) => Span::try_new(self.span.start, end.min(self.span.end)),
                None => Some(self.span),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Available,
    Maintenance,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Available => "available",
            ResourceStatus::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    /// Grouping used to rank suggestions (e.g. a wing or floor).
    pub group: Option<String>,
    pub status: ResourceStatus,
    /// Every reservation ever made on this resource, sorted by `span.start`.
    /// Terminal rows are kept for history and skipped by overlap checks.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, group: Option<String>) -> Self {
        Self {
            id,
            name,
            group,
            status: ResourceStatus::Available,
            reservations: Vec::new(),
        }
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            group: self.group.clone(),
            status: self.status,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    /// Remove reservation by id (used only when a row moves to another resource).
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn find(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Replace a row in place, re-sorting if its start moved.
    pub fn replace_reservation(&mut self, reservation: Reservation) {
        self.remove_reservation(reservation.id);
        self.insert_reservation(reservation);
    }

    /// Active reservations whose occupied span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = (&Reservation, Span)> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound].iter().filter_map(move |r| {
            let occupied = r.occupied()?;
            occupied.overlaps(query).then_some((r, occupied))
        })
    }
}

/// The event types. Flat, no nesting. Every reservation mutation is
/// recorded as the full resulting row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: String,
        group: Option<String>,
    },
    ResourceStatusChanged {
        id: Ulid,
        status: ResourceStatus,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        previous_resource_id: Ulid,
        reservation: Reservation,
    },
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A state change and its audit entry, committed together.
    Commit { event: Event, audit: AuditEntry },
    /// Snapshot record written by compaction.
    State(Event),
    /// Audit history carried across compaction.
    Audit(AuditEntry),
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub group: Option<String>,
    pub status: ResourceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub holder_id: Option<String>,
    pub resource_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
    /// Only reservations starting at or after this instant.
    pub from: Option<Ms>,
    /// Only reservations ending at or before this instant.
    pub to: Option<Ms>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.holder_id.as_deref().is_none_or(|h| h == r.holder_id)
            && self.resource_id.is_none_or(|id| id == r.resource_id)
            && self.status.is_none_or(|s| s == r.status)
            && self.from.is_none_or(|t| r.span.start >= t)
            && self.to.is_none_or(|t| r.span.end <= t)
    }
}
