use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::find_conflict;
use super::{Engine, EngineError, MAX_RELOCK_ATTEMPTS};

impl Engine {
    pub async fn resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        Ok(self.read_resource(id).await?.info())
    }

    /// All resources, ordered by id.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, EngineError> {
        let mut out = Vec::with_capacity(self.state.len());
        for id in self.resource_ids() {
            match self.read_resource(id).await {
                Ok(guard) => out.push(guard.info()),
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// The id of an active reservation on `resource_id` overlapping `span`,
    /// if there is one. Advisory: the answer can be stale by the time the
    /// caller acts on it.
    pub async fn conflicting(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, EngineError> {
        let guard = self.read_resource(resource_id).await?;
        Ok(find_conflict(&guard, &span, exclude))
    }

    pub async fn is_available(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        Ok(self.conflicting(resource_id, span, exclude).await?.is_none())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let rid = self
                .resource_for_reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            let guard = self.read_resource(rid).await?;
            if let Some(r) = guard.find(id) {
                return Ok(r.clone());
            }
        }
        Err(EngineError::NotFound(id))
    }

    /// Matching reservations, newest start first, then paged.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        let ids = match filter.resource_id {
            Some(id) => vec![id],
            None => self.resource_ids(),
        };
        let mut out = Vec::new();
        for rid in ids {
            let guard = match self.read_resource(rid).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
        let limit = filter.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT);
        Ok(out.into_iter().skip(filter.offset).take(limit).collect())
    }

    /// Active reservations on a resource overlapping `span`, by start.
    pub async fn reservations_in_range(
        &self,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Reservation>, EngineError> {
        let guard = self.read_resource(resource_id).await?;
        Ok(guard.overlapping(&span).map(|(r, _)| r.clone()).collect())
    }

    /// Occupied spans on a resource that touch `within`, unclipped.
    pub async fn occupied_spans(
        &self,
        resource_id: Ulid,
        within: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Span>, EngineError> {
        let guard = self.read_resource(resource_id).await?;
        Ok(guard
            .overlapping(&within)
            .filter(|(r, _)| Some(r.id) != exclude)
            .map(|(_, occupied)| occupied)
            .collect())
    }

    /// Milliseconds of `day` the holder already occupies across all
    /// resources. Each reservation counts only its part inside the day.
    pub async fn holder_active_ms(
        &self,
        holder_id: &str,
        day: Span,
        exclude: Option<Ulid>,
    ) -> Result<Ms, EngineError> {
        let ids = self
            .by_holder
            .get(holder_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut by_resource: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for id in ids.into_iter().filter(|id| Some(*id) != exclude) {
            if let Some(rid) = self.resource_for_reservation(&id) {
                by_resource.entry(rid).or_default().push(id);
            }
        }

        let mut total = 0;
        for (rid, ids) in by_resource {
            let guard = self.read_resource(rid).await?;
            total += ids
                .iter()
                .filter_map(|id| guard.find(*id))
                .filter_map(Reservation::occupied)
                .filter_map(|occupied| occupied.clip(&day))
                .map(|s| s.duration_ms())
                .sum::<Ms>();
        }
        Ok(total)
    }

    /// Confirmed reservations nobody checked in to whose grace window has
    /// closed. Resources whose lock is busy are skipped; the next sweep
    /// picks them up.
    pub fn collect_no_show_candidates(&self, now: Ms, grace_ms: Ms) -> Vec<Ulid> {
        let mut candidates = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            let Ok(guard) = rs.try_read() else {
                continue;
            };
            let due = guard
                .reservations
                .partition_point(|r| r.span.start + grace_ms <= now);
            candidates.extend(
                guard.reservations[..due]
                    .iter()
                    .filter(|r| r.status == ReservationStatus::Confirmed && r.checked_in_at.is_none())
                    .map(|r| r.id),
            );
        }
        candidates
    }
}
