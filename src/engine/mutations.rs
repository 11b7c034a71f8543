use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEntry};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError, WalCommand, MAX_RELOCK_ATTEMPTS};

/// The next version of a reservation, computed by the caller under the
/// resource lock, with the audit entry that records it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub reservation: Reservation,
    pub audit: AuditEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The transition function declined; nothing was written.
    Unchanged(Reservation),
    Updated { before: Reservation, after: Reservation },
}

impl UpdateOutcome {
    pub fn reservation(&self) -> &Reservation {
        match self {
            UpdateOutcome::Unchanged(r) => r,
            UpdateOutcome::Updated { after, .. } => after,
        }
    }

    pub fn into_reservation(self) -> Reservation {
        match self {
            UpdateOutcome::Unchanged(r) => r,
            UpdateOutcome::Updated { after, .. } => after,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated { .. })
    }
}

type WriteGuard = OwnedRwLockWriteGuard<ResourceState>;

impl Engine {
    pub async fn register_resource(
        &self,
        id: Ulid,
        name: String,
        group: Option<String>,
        actor: &str,
        now: Ms,
    ) -> Result<ResourceInfo, EngineError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name empty or too long"));
        }
        if group.as_ref().is_some_and(|g| g.len() > MAX_GROUP_LEN) {
            return Err(EngineError::LimitExceeded("resource group too long"));
        }

        let _gate = self.enter_commit().await?;
        let rs = ResourceState::new(id, name.clone(), group.clone());
        let info = rs.info();
        let shared = Arc::new(RwLock::new(rs));
        // Nothing may commit against the resource until its own record is
        // durable, so the id is claimed with the write lock already held.
        let claimed = Arc::clone(&shared).write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }

        let audit = AuditEntry::resource(actor, None, &info, AuditAction::ResourceRegistered, now);
        let persisted = self
            .persist_and_apply(&mut [], Event::ResourceRegistered { id, name, group }, audit)
            .await;
        if let Err(e) = persisted {
            self.state.remove(&id);
            return Err(e);
        }
        drop(claimed);
        info!(resource = %id, "resource registered");
        Ok(info)
    }

    /// Returns the resource after the call and whether its status changed.
    /// Cancelling what a maintenance window displaces is the caller's job.
    pub async fn set_resource_status(
        &self,
        id: Ulid,
        status: ResourceStatus,
        actor: &str,
        now: Ms,
        reason: Option<&str>,
    ) -> Result<(ResourceInfo, bool), EngineError> {
        let _gate = self.enter_commit().await?;
        let mut guard = self.write_resource(id).await?;
        if guard.status == status {
            return Ok((guard.info(), false));
        }

        let before = guard.info();
        let after = ResourceInfo {
            status,
            ..before.clone()
        };
        let mut audit = AuditEntry::resource(
            actor,
            Some(&before),
            &after,
            AuditAction::ResourceStatusChanged,
            now,
        );
        if let Some(reason) = reason {
            audit = audit.with_meta("reason", reason);
        }
        self.persist_and_apply(
            &mut [&mut *guard],
            Event::ResourceStatusChanged { id, status },
            audit,
        )
        .await?;
        info!(resource = %id, status = status.as_str(), "resource status changed");
        Ok((after, true))
    }

    /// The authoritative insert: the overlap check and the write happen
    /// under one hold of the resource's write lock.
    pub async fn insert_reservation(
        &self,
        reservation: Reservation,
        audit: AuditEntry,
    ) -> Result<Reservation, EngineError> {
        validate_span(&reservation.span)?;
        if reservation.holder_id.is_empty() || reservation.holder_id.len() > MAX_HOLDER_ID_LEN {
            return Err(EngineError::LimitExceeded("holder id empty or too long"));
        }
        if self.entity_to_resource.contains_key(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }

        let _gate = self.enter_commit().await?;
        let mut guard = self.write_resource(reservation.resource_id).await?;
        if guard.status == ResourceStatus::Maintenance {
            return Err(EngineError::ResourceUnavailable(guard.id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        check_no_conflict(&guard, &reservation.span, None)?;

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], event, audit).await?;
        debug!(reservation = %reservation.id, resource = %reservation.resource_id, "reservation inserted");
        Ok(reservation)
    }

    /// Read-modify-write of one reservation under its resource lock.
    ///
    /// `f` sees the current row and returns the next version, or `None` to
    /// leave it alone. `target` moves the row to another resource; both
    /// locks are then held, taken in id order. A row that stays active and
    /// changes interval or resource is re-checked for overlap, excluding
    /// itself. On any error nothing is written.
    pub async fn update_reservation<F, E>(
        &self,
        id: Ulid,
        target: Option<Ulid>,
        f: F,
    ) -> Result<UpdateOutcome, E>
    where
        F: FnOnce(&Reservation) -> Result<Option<Transition>, E>,
        E: From<EngineError>,
    {
        let _gate = self.enter_commit().await?;
        let (mut source, mut dest) = self.lock_for_update(id, target).await?;
        let current = source.find(id).cloned().ok_or(EngineError::NotFound(id))?;

        let Some(Transition {
            mut reservation,
            audit,
        }) = f(&current)?
        else {
            return Ok(UpdateOutcome::Unchanged(current));
        };
        reservation.id = id;
        reservation.resource_id = dest.as_ref().map_or(source.id, |d| d.id);

        let moved = reservation.resource_id != current.resource_id;
        if reservation.is_active() && (moved || reservation.span != current.span) {
            validate_span(&reservation.span)?;
            let home: &ResourceState = match dest.as_ref() {
                Some(d) => &**d,
                None => &*source,
            };
            if home.status == ResourceStatus::Maintenance {
                return Err(EngineError::ResourceUnavailable(home.id).into());
            }
            check_no_conflict(home, &reservation.span, Some(id))?;
        }

        let event = Event::ReservationUpdated {
            previous_resource_id: current.resource_id,
            reservation: reservation.clone(),
        };
        match dest.as_mut() {
            Some(d) => {
                self.persist_and_apply(&mut [&mut *source, &mut **d], event, audit)
                    .await?
            }
            None => self.persist_and_apply(&mut [&mut *source], event, audit).await?,
        }
        Ok(UpdateOutcome::Updated {
            before: current,
            after: reservation,
        })
    }

    /// Lock the resource holding `id`, plus `target` when it differs.
    async fn lock_for_update(
        &self,
        id: Ulid,
        target: Option<Ulid>,
    ) -> Result<(WriteGuard, Option<WriteGuard>), EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let home = self
                .resource_for_reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            let (source, dest) = match target.filter(|t| *t != home) {
                None => (self.write_resource(home).await?, None),
                Some(t) if home < t => {
                    let s = self.write_resource(home).await?;
                    let d = self.write_resource(t).await?;
                    (s, Some(d))
                }
                Some(t) => {
                    let d = self.write_resource(t).await?;
                    let s = self.write_resource(home).await?;
                    (s, Some(d))
                }
            };
            if source.find(id).is_some() {
                return Ok((source, dest));
            }
            // Moved between lookup and lock.
        }
        Err(EngineError::Timeout("reservation lock"))
    }

    /// Rewrite the WAL as a snapshot of current state plus the full audit
    /// history. Blocks new commits for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut entries = Vec::new();
        for id in self.resource_ids() {
            let Some(rs) = self.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            entries.push(LogEntry::State(Event::ResourceRegistered {
                id: guard.id,
                name: guard.name.clone(),
                group: guard.group.clone(),
            }));
            if guard.status != ResourceStatus::Available {
                entries.push(LogEntry::State(Event::ResourceStatusChanged {
                    id: guard.id,
                    status: guard.status,
                }));
            }
            for r in &guard.reservations {
                entries.push(LogEntry::State(Event::ReservationCreated {
                    reservation: r.clone(),
                }));
            }
        }
        entries.extend(self.audit.entries().into_iter().map(LogEntry::Audit));

        let count = entries.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                entries,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
