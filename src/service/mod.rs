//! The reservation service: the only writer of reservation state besides
//! the sweeper. Every operation validates against fresh settings and a
//! fresh `now`, then commits through the engine.

mod error;
mod lifecycle;
mod maintenance;

pub use error::{Conflict, ConflictReason, ServiceError};
pub use maintenance::SweepReport;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::audit::AuditEntry;
use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::idempotency::IdempotencyCache;
use crate::model::*;
use crate::notify::Notifier;
use crate::observability::{CONFLICTS_TOTAL, RESERVATIONS_TOTAL, VALIDATION_FAILURES_TOTAL};
use crate::policy::{self, opening_span, Violation};
use crate::settings::{Settings, SettingsSource};
use crate::suggest::{alternative_slots, rank_resources, Suggestions};
use crate::window::day_span;

/// Name recorded as the actor of automatic transitions.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Admin,
}

/// The caller, as established by the auth layer. Trusted as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub holder_id: String,
    pub role: Role,
}

impl Actor {
    pub fn member(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            role: Role::Member,
        }
    }

    pub fn admin(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn may_act_for(&self, holder_id: &str) -> bool {
        self.is_admin() || self.holder_id == holder_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub resource_id: Ulid,
    pub span: Span,
    /// Defaults to the actor. Only admins may book for someone else.
    pub holder_id: Option<String>,
    /// Absent means no replay protection for this call.
    pub idempotency_key: Option<String>,
}

impl CreateRequest {
    pub fn new(resource_id: Ulid, span: Span) -> Self {
        Self {
            resource_id,
            span,
            holder_id: None,
            idempotency_key: None,
        }
    }

    pub fn for_holder(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = Some(holder_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyRequest {
    pub resource_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

/// Clones are cheap and share all state, so an operation can carry the
/// service onto a spawned task.
#[derive(Clone)]
pub struct ReservationService {
    engine: Arc<Engine>,
    idempotency: Arc<IdempotencyCache<Reservation>>,
    settings: Arc<dyn SettingsSource>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl ReservationService {
    pub fn new(
        engine: Arc<Engine>,
        settings: Arc<dyn SettingsSource>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        idempotency_ttl_ms: Ms,
    ) -> Self {
        Self {
            engine,
            idempotency: Arc::new(IdempotencyCache::new(idempotency_ttl_ms)),
            settings,
            clock,
            notifier,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // ── Queries ──────────────────────────────────────────

    pub async fn get(&self, actor: &Actor, id: Ulid) -> Result<Reservation, ServiceError> {
        let r = self.engine.get_reservation(id).await?;
        authorize(actor, &r)?;
        Ok(r)
    }

    /// Members only ever see their own reservations.
    pub async fn list(
        &self,
        actor: &Actor,
        filter: ReservationFilter,
    ) -> Result<Vec<Reservation>, ServiceError> {
        let mut filter = filter;
        if !actor.is_admin() {
            match filter.holder_id.as_deref() {
                Some(h) if h != actor.holder_id => return Err(ServiceError::Unauthorized),
                _ => filter.holder_id = Some(actor.holder_id.clone()),
            }
        }
        Ok(self.engine.list_reservations(&filter).await?)
    }

    pub async fn reservations_in_range(
        &self,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Reservation>, ServiceError> {
        Ok(self.engine.reservations_in_range(resource_id, span).await?)
    }

    /// Active time the holder has booked on the calendar day containing `at`.
    pub async fn daily_usage(
        &self,
        actor: &Actor,
        holder_id: &str,
        at: Ms,
    ) -> Result<Ms, ServiceError> {
        if !actor.may_act_for(holder_id) {
            return Err(ServiceError::Unauthorized);
        }
        let day = day_span(at, self.settings.current().zone());
        Ok(self.engine.holder_active_ms(holder_id, day, None).await?)
    }

    pub async fn resources(&self) -> Result<Vec<ResourceInfo>, ServiceError> {
        Ok(self.engine.list_resources().await?)
    }

    pub fn audit_trail(&self, actor: &Actor, entity_id: Ulid) -> Result<Vec<AuditEntry>, ServiceError> {
        require_admin(actor)?;
        Ok(self.engine.audit().trail(entity_id))
    }

    pub fn audit_entries(&self, actor: &Actor) -> Result<Vec<AuditEntry>, ServiceError> {
        require_admin(actor)?;
        Ok(self.engine.audit().entries())
    }

    /// Drop expired idempotency records. Returns how many went.
    pub fn purge_idempotency(&self) -> usize {
        self.idempotency.purge_expired(self.clock.now_ms())
    }

    // ── Shared steps ─────────────────────────────────────

    async fn check_daily_limit(
        &self,
        holder_id: &str,
        span: &Span,
        exclude: Option<Ulid>,
        settings: &Settings,
    ) -> Result<(), ServiceError> {
        let day = day_span(span.start, settings.zone());
        let used = self.engine.holder_active_ms(holder_id, day, exclude).await?;
        policy::check_daily_limit(span, used, settings).map_err(invalid)
    }

    /// The advisory half of the two-phase protocol. Fails with suggestions
    /// attached when the resource is closed or visibly taken.
    async fn fast_check(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), ServiceError> {
        let resource = self.engine.resource_info(resource_id).await?;
        let rejection = if resource.status == ResourceStatus::Maintenance {
            ServiceError::conflict(ConflictReason::ResourceUnavailable, None)
        } else if let Some(winner) = self.engine.conflicting(resource_id, span, exclude).await? {
            ServiceError::conflict(ConflictReason::Overlap, Some(winner))
        } else {
            return Ok(());
        };
        Err(self
            .with_suggestions(rejection, resource_id, span, exclude, "fast")
            .await)
    }

    /// Attach suggestions to an availability rejection; other errors pass
    /// through untouched.
    async fn with_suggestions(
        &self,
        err: ServiceError,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
        phase: &'static str,
    ) -> ServiceError {
        let ServiceError::Conflict(mut conflict) = err else {
            return err;
        };
        metrics::counter!(CONFLICTS_TOTAL, "phase" => phase).increment(1);
        conflict.suggestions = self.suggest(resource_id, span, exclude).await;
        debug!(
            resource = %resource_id,
            phase,
            resources = conflict.suggestions.alternative_resources.len(),
            slots = conflict.suggestions.alternative_slots.len(),
            "availability rejection"
        );
        ServiceError::Conflict(conflict)
    }

    /// Best effort: a failure here yields no suggestions, never an error.
    pub async fn suggest(&self, resource_id: Ulid, span: Span, exclude: Option<Ulid>) -> Suggestions {
        match self.try_suggest(resource_id, span, exclude).await {
            Ok(s) => s,
            Err(e) => {
                warn!(resource = %resource_id, error = %e, "could not compute suggestions");
                Suggestions::default()
            }
        }
    }

    async fn try_suggest(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Suggestions, EngineError> {
        let settings = self.settings.current();
        let now = self.clock.now_ms();
        let requested = self.engine.resource_info(resource_id).await?;

        let mut free = Vec::new();
        for r in self.engine.list_resources().await? {
            if r.id == resource_id || r.status != ResourceStatus::Available {
                continue;
            }
            if self.engine.is_available(r.id, span, exclude).await? {
                free.push(r);
            }
        }
        let alternative_resources = rank_resources(requested.group.as_deref(), free);

        let mut slots = Vec::new();
        if requested.status == ResourceStatus::Available {
            let day = day_span(span.start, settings.zone());
            let open = opening_span(span.start, &settings).unwrap_or(day);
            if let Some(bounds) = Span::try_new(open.start.max(now), open.end) {
                let occupied = self.engine.occupied_spans(resource_id, bounds, exclude).await?;
                slots = alternative_slots(&span, &bounds, &occupied);
            }
        }

        Ok(Suggestions {
            alternative_resources,
            alternative_slots: slots,
        })
    }
}

fn authorize(actor: &Actor, r: &Reservation) -> Result<(), ServiceError> {
    if actor.may_act_for(&r.holder_id) {
        Ok(())
    } else {
        Err(ServiceError::Unauthorized)
    }
}

fn require_admin(actor: &Actor) -> Result<(), ServiceError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Unauthorized)
    }
}

/// Count and wrap a policy rejection.
fn invalid(v: Violation) -> ServiceError {
    metrics::counter!(VALIDATION_FAILURES_TOTAL, "reason" => v.label()).increment(1);
    ServiceError::Validation(v)
}

fn record<T>(op: &'static str, result: &Result<T, ServiceError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(RESERVATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}

/// Run a commit on its own task. A caller that stops waiting drops only the
/// join handle; the commit itself runs to completion, along with whatever
/// the future does after it (caching, notifying).
async fn detached<T, E, F>(fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<EngineError> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) => Err(EngineError::TaskFailed(e.to_string()).into()),
    }
}
