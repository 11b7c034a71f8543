//! Admin-side operations: the resource registry, the maintenance cascade,
//! and the no-show sweep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEntry};
use crate::engine::{EngineError, Transition, UpdateOutcome};
use crate::limits::{MAX_REASON_LEN, MAX_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::notify::Notice;
use crate::observability::{MAINTENANCE_CANCELLATIONS_TOTAL, NO_SHOWS_TOTAL, SWEEP_DURATION_SECONDS};
use crate::policy::Violation;

use super::{
    detached, invalid, record, require_admin, Actor, ReservationService, ServiceError, SYSTEM_ACTOR,
};

/// What one pass of the no-show sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub marked: usize,
    /// Checked in, cancelled or otherwise changed since selection.
    pub skipped: usize,
    pub failed: usize,
}

impl ReservationService {
    pub async fn register_resource(
        &self,
        actor: &Actor,
        id: Ulid,
        name: String,
        group: Option<String>,
    ) -> Result<ResourceInfo, ServiceError> {
        require_admin(actor)?;
        let now = self.clock.now_ms();
        let engine = Arc::clone(&self.engine);
        let actor_id = actor.holder_id.clone();
        detached(async move {
            engine
                .register_resource(id, name, group, &actor_id, now)
                .await
                .map_err(ServiceError::from)
        })
        .await
    }

    /// Change a resource's status. Taking it into maintenance requires a
    /// reason and cancels everything on it that has not yet ended.
    ///
    /// The status change and the cascade run on their own task, so a caller
    /// that gives up cannot leave one without the other. Putting a resource
    /// that is already in maintenance into maintenance again reruns the
    /// cascade, which picks up rows an earlier run left behind.
    pub async fn set_resource_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: ResourceStatus,
        reason: Option<String>,
    ) -> Result<ResourceInfo, ServiceError> {
        require_admin(actor)?;
        let reason = reason.filter(|r| !r.trim().is_empty());
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(invalid(Violation::Limit("reason too long")));
        }
        let reason = match (status, reason) {
            (ResourceStatus::Maintenance, None) => return Err(invalid(Violation::ReasonRequired)),
            (_, reason) => reason,
        };

        let this = self.clone();
        let actor = actor.clone();
        detached(async move { this.change_status(&actor, id, status, reason).await }).await
    }

    async fn change_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: ResourceStatus,
        reason: Option<String>,
    ) -> Result<ResourceInfo, ServiceError> {
        let now = self.clock.now_ms();
        let (info, changed) = self
            .engine
            .set_resource_status(id, status, &actor.holder_id, now, reason.as_deref())
            .await?;
        if !changed {
            debug!(resource = %id, status = status.as_str(), "resource status unchanged");
        }
        if let (ResourceStatus::Maintenance, Some(reason)) = (status, reason.as_deref()) {
            self.recorded_cascade(actor, id, reason).await?;
        }
        Ok(info)
    }

    /// Cancel every confirmed reservation on the resource that has not yet
    /// ended, and tell each affected holder once. A row that fails to
    /// cancel is logged and left for a rerun; rerunning is harmless.
    pub async fn on_resource_unavailable(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        reason: &str,
    ) -> Result<Vec<Reservation>, ServiceError> {
        let this = self.clone();
        let actor = actor.clone();
        let reason = reason.to_string();
        detached(async move { this.recorded_cascade(&actor, resource_id, &reason).await }).await
    }

    async fn recorded_cascade(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        reason: &str,
    ) -> Result<Vec<Reservation>, ServiceError> {
        let result = self.cascade(actor, resource_id, reason).await;
        record("maintenance_cancel", &result);
        result
    }

    async fn cascade(
        &self,
        actor: &Actor,
        resource_id: Ulid,
        reason: &str,
    ) -> Result<Vec<Reservation>, ServiceError> {
        require_admin(actor)?;
        if reason.trim().is_empty() {
            return Err(invalid(Violation::ReasonRequired));
        }

        let now = self.clock.now_ms();
        let Some(ahead) = Span::try_new(now, MAX_VALID_TIMESTAMP_MS) else {
            return Ok(Vec::new());
        };
        let affected: Vec<Ulid> = self
            .engine
            .reservations_in_range(resource_id, ahead)
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Confirmed)
            .map(|r| r.id)
            .collect();

        let mut cancelled = Vec::with_capacity(affected.len());
        for id in affected {
            let actor_id = actor.holder_id.clone();
            let reason = reason.to_string();
            let result = self
                .engine
                .update_reservation(id, None, move |cur: &Reservation| {
                    if cur.status != ReservationStatus::Confirmed || cur.span.end <= now {
                        return Ok::<_, EngineError>(None);
                    }
                    let mut next = cur.clone();
                    next.status = ReservationStatus::Cancelled;
                    next.cancelled_at = Some(now);
                    next.updated_at = now;
                    let audit = AuditEntry::reservation(actor_id, Some(cur), &next, AuditAction::AutoCancelled)
                        .with_meta("reason", reason);
                    Ok(Some(Transition {
                        reservation: next,
                        audit,
                    }))
                })
                .await;
            match result {
                Ok(UpdateOutcome::Updated { after, .. }) => cancelled.push(after),
                Ok(UpdateOutcome::Unchanged(_)) => {}
                Err(e) => warn!(reservation = %id, error = %e, "maintenance cancellation failed"),
            }
        }

        let mut by_holder: BTreeMap<String, Vec<Reservation>> = BTreeMap::new();
        for r in &cancelled {
            by_holder.entry(r.holder_id.clone()).or_default().push(r.clone());
        }
        for (holder_id, reservations) in by_holder {
            self.notifier.notify(Notice::AutoCancelled {
                holder_id,
                resource_id,
                reason: reason.to_string(),
                reservations,
            });
        }

        metrics::counter!(MAINTENANCE_CANCELLATIONS_TOTAL).increment(cancelled.len() as u64);
        info!(resource = %resource_id, cancelled = cancelled.len(), reason, "maintenance cascade");
        Ok(cancelled)
    }

    /// One pass of the no-show sweep. Candidates are selected without
    /// holding locks; each transition re-checks the row under its lock, so
    /// a check-in that lands in between wins.
    pub async fn sweep_no_shows(&self) -> SweepReport {
        let started = Instant::now();
        let grace = self.settings.current().grace_window_ms;
        let now = self.clock.now_ms();
        let candidates = self.engine.collect_no_show_candidates(now, grace);
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for id in candidates {
            // Each mark commits on its own task, so stopping the sweeper
            // between rows never cuts a commit in half.
            let engine = Arc::clone(&self.engine);
            let result = detached(async move {
                engine
                    .update_reservation(id, None, move |cur: &Reservation| {
                        if cur.status != ReservationStatus::Confirmed
                            || cur.checked_in_at.is_some()
                            || cur.span.start + grace > now
                        {
                            return Ok::<_, EngineError>(None);
                        }
                        let mut next = cur.clone();
                        next.status = ReservationStatus::NoShow;
                        next.updated_at = now;
                        let audit = AuditEntry::reservation(
                            SYSTEM_ACTOR,
                            Some(cur),
                            &next,
                            AuditAction::MarkedNoShow,
                        );
                        Ok(Some(Transition {
                            reservation: next,
                            audit,
                        }))
                    })
                    .await
            })
            .await;
            match result {
                Ok(UpdateOutcome::Updated { after, .. }) => {
                    report.marked += 1;
                    metrics::counter!(NO_SHOWS_TOTAL).increment(1);
                    info!(reservation = %id, holder = %after.holder_id, "marked no-show");
                    self.notifier.notify(Notice::NoShow(after));
                }
                Ok(UpdateOutcome::Unchanged(_)) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(reservation = %id, error = %e, "no-show transition failed");
                }
            }
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report.marked > 0 || report.failed > 0 {
            info!(
                examined = report.examined,
                marked = report.marked,
                skipped = report.skipped,
                failed = report.failed,
                "no-show sweep"
            );
        } else {
            debug!(examined = report.examined, "no-show sweep: nothing to do");
        }
        report
    }
}
