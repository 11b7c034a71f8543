//! Alternatives offered when a request loses on availability.

use crate::engine::free_gaps;
use crate::model::{Ms, ResourceInfo, ResourceStatus, Span};

pub const MAX_ALTERNATIVE_RESOURCES: usize = 5;
pub const MAX_ALTERNATIVE_SLOTS: usize = 3;

/// Either list may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suggestions {
    /// Resources free for the exact requested interval.
    pub alternative_resources: Vec<ResourceInfo>,
    /// Same-length intervals on the requested resource, same day.
    pub alternative_slots: Vec<Span>,
}

impl Suggestions {
    pub fn is_empty(&self) -> bool {
        self.alternative_resources.is_empty() && self.alternative_slots.is_empty()
    }
}

/// Order candidates that are already known to be free: same group as the
/// requested resource first, then the rest, each by id. Resources under
/// maintenance are dropped.
pub fn rank_resources(group: Option<&str>, candidates: Vec<ResourceInfo>) -> Vec<ResourceInfo> {
    let mut ranked: Vec<ResourceInfo> = candidates
        .into_iter()
        .filter(|r| r.status == ResourceStatus::Available)
        .collect();
    ranked.sort_by_key(|r| {
        let same_group = group.is_some() && r.group.as_deref() == group;
        (!same_group, r.id)
    });
    ranked.truncate(MAX_ALTERNATIVE_RESOURCES);
    ranked
}

/// Free intervals with the requested duration inside `bounds`, closest start
/// to the requested one first. `bounds` is the bookable part of the day: the
/// calendar day cut to opening hours and to `now`.
pub fn alternative_slots(requested: &Span, bounds: &Span, occupied: &[Span]) -> Vec<Span> {
    let duration = requested.duration_ms();
    let mut starts: Vec<Ms> = Vec::new();
    for gap in free_gaps(bounds, occupied) {
        if gap.duration_ms() < duration {
            continue;
        }
        let latest = gap.end - duration;
        // Nearest placement to the requested start, plus both gap edges.
        starts.push(requested.start.clamp(gap.start, latest));
        starts.push(gap.start);
        starts.push(latest);
    }
    starts.sort_by_key(|s| ((s - requested.start).abs(), *s));
    starts.dedup();

    let mut slots = Vec::with_capacity(MAX_ALTERNATIVE_SLOTS);
    for start in starts {
        let slot = Span::new(start, start + duration);
        if slot == *requested || slots.contains(&slot) {
            continue;
        }
        slots.push(slot);
        if slots.len() == MAX_ALTERNATIVE_SLOTS {
            break;
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HOUR, MINUTE};
    use ulid::Ulid;

    fn resource(group: Option<&str>, status: ResourceStatus) -> ResourceInfo {
        ResourceInfo {
            id: Ulid::new(),
            name: "desk".into(),
            group: group.map(String::from),
            status,
        }
    }

    #[test]
    fn same_group_ranks_first_then_by_id() {
        let north_a = resource(Some("north"), ResourceStatus::Available);
        let south = resource(Some("south"), ResourceStatus::Available);
        let north_b = resource(Some("north"), ResourceStatus::Available);
        let loose = resource(None, ResourceStatus::Available);

        let ranked = rank_resources(
            Some("north"),
            vec![south.clone(), north_b.clone(), loose.clone(), north_a.clone()],
        );

        let mut north = vec![north_a.id, north_b.id];
        north.sort();
        let mut rest = vec![south.id, loose.id];
        rest.sort();
        let expected: Vec<Ulid> = north.into_iter().chain(rest).collect();
        assert_eq!(ranked.iter().map(|r| r.id).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn maintenance_excluded_and_capped_at_five() {
        let mut candidates: Vec<ResourceInfo> = (0..7)
            .map(|_| resource(None, ResourceStatus::Available))
            .collect();
        let broken = resource(None, ResourceStatus::Maintenance);
        candidates.push(broken.clone());

        let ranked = rank_resources(None, candidates);
        assert_eq!(ranked.len(), MAX_ALTERNATIVE_RESOURCES);
        assert!(ranked.iter().all(|r| r.id != broken.id));
    }

    #[test]
    fn slots_around_an_afternoon_booking() {
        // Booked 14:00–16:00; asked for 14:30–16:30.
        let day = Span::new(0, 24 * HOUR);
        let booked = [Span::new(14 * HOUR, 16 * HOUR)];
        let requested = Span::new(14 * HOUR + 30 * MINUTE, 16 * HOUR + 30 * MINUTE);

        let slots = alternative_slots(&requested, &day, &booked);
        assert_eq!(
            slots,
            vec![
                Span::new(16 * HOUR, 18 * HOUR),
                Span::new(12 * HOUR, 14 * HOUR),
                Span::new(22 * HOUR, 24 * HOUR),
            ]
        );
        assert!(slots.iter().all(|s| !s.overlaps(&booked[0])));
    }

    #[test]
    fn slots_respect_bounds() {
        // Opening hours 08:00–18:00, and it is already 15:00.
        let bounds = Span::new(15 * HOUR, 18 * HOUR);
        let requested = Span::new(16 * HOUR, 17 * HOUR);
        let booked = [Span::new(16 * HOUR, 17 * HOUR)];
        let slots = alternative_slots(&requested, &bounds, &booked);
        assert_eq!(
            slots,
            vec![Span::new(15 * HOUR, 16 * HOUR), Span::new(17 * HOUR, 18 * HOUR)]
        );
    }

    #[test]
    fn no_slots_when_day_is_full() {
        let day = Span::new(0, 24 * HOUR);
        let requested = Span::new(9 * HOUR, 10 * HOUR);
        assert!(alternative_slots(&requested, &day, &[day]).is_empty());
    }

    #[test]
    fn gaps_shorter_than_request_are_skipped() {
        let day = Span::new(0, 10 * HOUR);
        let booked = [Span::new(0, 4 * HOUR), Span::new(5 * HOUR, 10 * HOUR)];
        let requested = Span::new(4 * HOUR, 6 * HOUR);
        assert!(alternative_slots(&requested, &day, &booked).is_empty());
    }
}
