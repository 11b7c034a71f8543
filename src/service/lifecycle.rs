use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEntry};
use crate::engine::{validate_span, Transition, UpdateOutcome};
use crate::limits::{MAX_HOLDER_ID_LEN, MAX_IDEMPOTENCY_KEY_LEN, MAX_REASON_LEN};
use crate::model::*;
use crate::notify::Notice;
use crate::observability::IDEMPOTENT_REPLAYS_TOTAL;
use crate::policy::{self, Violation};

use super::{
    authorize, detached, invalid, record, Actor, CreateRequest, ModifyRequest,
    ReservationService, ServiceError,
};

impl ReservationService {
    /// Book a resource. With an idempotency key, a repeat of a successful
    /// call by the same holder returns the first result unchanged.
    ///
    /// Runs on its own task: once started, the insert and the key's cached
    /// result land even if the caller stops waiting, so a retry with the
    /// same key replays instead of colliding with its own booking.
    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateRequest,
    ) -> Result<Reservation, ServiceError> {
        let this = self.clone();
        let actor = actor.clone();
        let result = detached(async move { this.create_keyed(&actor, request).await }).await;
        record("create", &result);
        result
    }

    async fn create_keyed(
        &self,
        actor: &Actor,
        request: CreateRequest,
    ) -> Result<Reservation, ServiceError> {
        let holder_id = request
            .holder_id
            .clone()
            .unwrap_or_else(|| actor.holder_id.clone());
        if !actor.may_act_for(&holder_id) {
            return Err(ServiceError::Unauthorized);
        }

        let Some(key) = request.idempotency_key.as_deref() else {
            return self
                .create_once(actor, holder_id, request.resource_id, request.span)
                .await;
        };
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(invalid(Violation::Limit("idempotency key empty or too long")));
        }

        // Keys are only unique per holder.
        let scoped = format!("{holder_id}\u{1f}{key}");
        let (reservation, replayed) = self
            .idempotency
            .get_or_try_insert_with(&scoped, self.clock.now_ms(), || {
                self.create_once(actor, holder_id.clone(), request.resource_id, request.span)
            })
            .await?;
        if replayed {
            metrics::counter!(IDEMPOTENT_REPLAYS_TOTAL).increment(1);
            debug!(reservation = %reservation.id, holder = %holder_id, "replayed create");
        }
        Ok(reservation)
    }

    async fn create_once(
        &self,
        actor: &Actor,
        holder_id: String,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Reservation, ServiceError> {
        if holder_id.is_empty() || holder_id.len() > MAX_HOLDER_ID_LEN {
            return Err(invalid(Violation::Limit("holder id empty or too long")));
        }
        validate_span(&span)?;
        let settings = self.settings.current();
        let now = self.clock.now_ms();
        policy::validate(&span, now, &settings).map_err(invalid)?;
        self.check_daily_limit(&holder_id, &span, None, &settings).await?;
        self.fast_check(resource_id, span, None).await?;

        let row = Reservation::new(Ulid::new(), resource_id, holder_id, span, now);
        let audit = AuditEntry::reservation(actor.holder_id.clone(), None, &row, AuditAction::Created);
        let reservation = match self.engine.insert_reservation(row, audit).await {
            Ok(r) => r,
            Err(e) => {
                return Err(self
                    .with_suggestions(e.into(), resource_id, span, None, "authoritative")
                    .await)
            }
        };

        info!(
            reservation = %reservation.id,
            resource = %resource_id,
            holder = %reservation.holder_id,
            "reservation confirmed"
        );
        self.notifier.notify(Notice::Confirmed(reservation.clone()));
        Ok(reservation)
    }

    /// Move a confirmed reservation in time, to another resource, or both.
    /// The new interval goes through the same checks as a creation, with the
    /// reservation itself excluded from overlap and daily usage.
    pub async fn modify(
        &self,
        actor: &Actor,
        id: Ulid,
        request: ModifyRequest,
    ) -> Result<Reservation, ServiceError> {
        let result = self.modify_inner(actor, id, request).await;
        record("modify", &result);
        result
    }

    async fn modify_inner(
        &self,
        actor: &Actor,
        id: Ulid,
        request: ModifyRequest,
    ) -> Result<Reservation, ServiceError> {
        let current = self.engine.get_reservation(id).await?;
        authorize(actor, &current)?;
        if current.status != ReservationStatus::Confirmed {
            return Err(invalid(Violation::NotConfirmed(current.status)));
        }

        let target = request.resource_id.unwrap_or(current.resource_id);
        let span = Span::try_new(
            request.start.unwrap_or(current.span.start),
            request.end.unwrap_or(current.span.end),
        )
        .ok_or_else(|| invalid(Violation::Limit("interval must end after it starts")))?;
        if target == current.resource_id && span == current.span {
            return Ok(current);
        }

        validate_span(&span)?;
        let settings = self.settings.current();
        let now = self.clock.now_ms();
        policy::validate(&span, now, &settings).map_err(invalid)?;
        self.check_daily_limit(&current.holder_id, &span, Some(id), &settings)
            .await?;
        self.fast_check(target, span, Some(id)).await?;

        let engine = Arc::clone(&self.engine);
        let actor_id = actor.holder_id.clone();
        let outcome = detached(async move {
            engine
                .update_reservation(id, Some(target), move |cur: &Reservation| {
                    if cur.status != ReservationStatus::Confirmed {
                        return Err(invalid(Violation::NotConfirmed(cur.status)));
                    }
                    let mut next = cur.clone();
                    next.resource_id = target;
                    next.span = span;
                    next.updated_at = now;
                    let audit = AuditEntry::reservation(actor_id, Some(cur), &next, AuditAction::Modified);
                    Ok(Some(Transition {
                        reservation: next,
                        audit,
                    }))
                })
                .await
        })
        .await;

        match outcome {
            Ok(UpdateOutcome::Updated { before, after }) => {
                info!(
                    reservation = %id,
                    resource = %after.resource_id,
                    start = after.span.start,
                    end = after.span.end,
                    "reservation modified"
                );
                self.notifier.notify(Notice::Modified {
                    before,
                    after: after.clone(),
                });
                Ok(after)
            }
            Ok(UpdateOutcome::Unchanged(r)) => Ok(r),
            Err(e) => Err(self
                .with_suggestions(e, target, span, Some(id), "authoritative")
                .await),
        }
    }

    /// Cancel before the start. Cancelling a reservation that is already in
    /// a terminal state succeeds without changing it.
    pub async fn cancel(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, ServiceError> {
        let result = self.cancel_inner(actor, id, reason).await;
        record("cancel", &result);
        result
    }

    async fn cancel_inner(
        &self,
        actor: &Actor,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, ServiceError> {
        let current = self.engine.get_reservation(id).await?;
        authorize(actor, &current)?;
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(invalid(Violation::Limit("reason too long")));
        }

        let now = self.clock.now_ms();
        let engine = Arc::clone(&self.engine);
        let actor_id = actor.holder_id.clone();
        let outcome = detached(async move {
            engine
                .update_reservation(id, None, move |cur: &Reservation| {
                    if cur.status.is_terminal() {
                        return Ok(None);
                    }
                    if now > cur.span.start {
                        return Err(invalid(Violation::CancelAfterStart));
                    }
                    let mut next = cur.clone();
                    next.status = ReservationStatus::Cancelled;
                    next.cancelled_at = Some(now);
                    next.updated_at = now;
                    let mut audit =
                        AuditEntry::reservation(actor_id, Some(cur), &next, AuditAction::Cancelled);
                    if let Some(reason) = reason {
                        audit = audit.with_meta("reason", reason);
                    }
                    Ok(Some(Transition {
                        reservation: next,
                        audit,
                    }))
                })
                .await
        })
        .await?;

        if let UpdateOutcome::Updated { after, .. } = &outcome {
            info!(reservation = %id, "reservation cancelled");
            self.notifier.notify(Notice::Cancelled(after.clone()));
        }
        Ok(outcome.into_reservation())
    }

    /// Record arrival. Accepted within the grace window either side of the
    /// start; a second check-in is a no-op.
    pub async fn check_in(&self, actor: &Actor, id: Ulid) -> Result<Reservation, ServiceError> {
        let result = self.check_in_inner(actor, id).await;
        record("check_in", &result);
        result
    }

    async fn check_in_inner(&self, actor: &Actor, id: Ulid) -> Result<Reservation, ServiceError> {
        let current = self.engine.get_reservation(id).await?;
        authorize(actor, &current)?;

        let settings = self.settings.current();
        let now = self.clock.now_ms();
        let engine = Arc::clone(&self.engine);
        let actor_id = actor.holder_id.clone();
        let outcome = detached(async move {
            engine
                .update_reservation(id, None, move |cur: &Reservation| match cur.status {
                    ReservationStatus::Confirmed if cur.checked_in_at.is_some() => Ok(None),
                    ReservationStatus::Confirmed => {
                        policy::check_in_window(&cur.span, now, &settings).map_err(invalid)?;
                        let mut next = cur.clone();
                        next.checked_in_at = Some(now);
                        next.updated_at = now;
                        let audit =
                            AuditEntry::reservation(actor_id, Some(cur), &next, AuditAction::CheckedIn);
                        Ok(Some(Transition {
                            reservation: next,
                            audit,
                        }))
                    }
                    ReservationStatus::NoShow => Err(invalid(Violation::CheckInTooLate {
                        closed_at: cur.span.start + settings.grace_window_ms,
                    })),
                    other => Err(invalid(Violation::NotConfirmed(other))),
                })
                .await
        })
        .await?;

        if outcome.is_updated() {
            info!(reservation = %id, "checked in");
        }
        Ok(outcome.into_reservation())
    }

    /// Release the rest of an in-progress reservation. The interval from
    /// now to the original end becomes bookable again.
    pub async fn end_early(&self, actor: &Actor, id: Ulid) -> Result<Reservation, ServiceError> {
        let result = self.end_early_inner(actor, id).await;
        record("end_early", &result);
        result
    }

    async fn end_early_inner(&self, actor: &Actor, id: Ulid) -> Result<Reservation, ServiceError> {
        let current = self.engine.get_reservation(id).await?;
        authorize(actor, &current)?;

        let now = self.clock.now_ms();
        let engine = Arc::clone(&self.engine);
        let actor_id = actor.holder_id.clone();
        let outcome = detached(async move {
            engine
                .update_reservation(id, None, move |cur: &Reservation| {
                    if cur.status != ReservationStatus::Confirmed {
                        return Err(invalid(Violation::NotConfirmed(cur.status)));
                    }
                    policy::end_early_window(&cur.span, now).map_err(invalid)?;
                    let mut next = cur.clone();
                    next.status = ReservationStatus::Completed;
                    next.actual_end = Some(now);
                    next.updated_at = now;
                    let audit = AuditEntry::reservation(actor_id, Some(cur), &next, AuditAction::EndedEarly);
                    Ok(Some(Transition {
                        reservation: next,
                        audit,
                    }))
                })
                .await
        })
        .await?;

        info!(reservation = %id, ended_at = now, "reservation ended early");
        Ok(outcome.into_reservation())
    }
}
