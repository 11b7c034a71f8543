mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_gaps, merge_overlapping, subtract_intervals};
pub(crate) use conflict::validate_span;
pub use error::EngineError;
pub use mutations::{Transition, UpdateOutcome};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::info;
use ulid::Ulid;

use crate::audit::{AuditEntry, AuditLog};
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// How often a lookup-then-lock is retried when the row moved to another
/// resource in between.
const MAX_RELOCK_ATTEMPTS: usize = 3;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        entry: LogEntry,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        entries: Vec<LogEntry>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (LogEntry, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender with its result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { entry, response } => {
                let mut batch = vec![(entry, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { entry, response }) => batch.push((entry, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
                // Non-append commands run after the batch queued ahead of them.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (entry, _) in batch {
        if let Err(e) = wal.append_buffered(entry) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { entries, response } => {
            let result = Wal::write_compact_file(wal.path(), &entries)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { entry, response } => commit_batch(wal, vec![(entry, response)]),
    }
}

/// The availability index: every resource and its reservations, guarded
/// per resource, persisted through the WAL.
pub struct Engine {
    state: DashMap<Ulid, SharedResourceState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Reservation id → the resource it currently lives on.
    entity_to_resource: DashMap<Ulid, Ulid>,
    /// Holder id → every reservation they have ever held.
    by_holder: DashMap<String, Vec<Ulid>>,
    audit: AuditLog,
    /// Shared by commits, exclusive for compaction.
    commit_gate: RwLock<()>,
    lock_timeout: Duration,
}

/// Apply an event to one locked resource. A move touches two resources:
/// the old one drops the row, the new one takes it.
fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::ResourceStatusChanged { status, .. } => rs.status = *status,
        Event::ReservationCreated { reservation } => rs.insert_reservation(reservation.clone()),
        Event::ReservationUpdated { reservation, .. } => {
            if reservation.resource_id == rs.id {
                rs.replace_reservation(reservation.clone());
            } else {
                rs.remove_reservation(reservation.id);
            }
        }
        // Registration creates the state itself.
        Event::ResourceRegistered { .. } => {}
    }
}

/// Resources an event touches, previous location first.
fn event_resource_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::ResourceRegistered { .. } => Vec::new(),
        Event::ResourceStatusChanged { id, .. } => vec![*id],
        Event::ReservationCreated { reservation } => vec![reservation.resource_id],
        Event::ReservationUpdated {
            previous_resource_id,
            reservation,
        } => {
            if *previous_resource_id == reservation.resource_id {
                vec![reservation.resource_id]
            } else {
                vec![*previous_resource_id, reservation.resource_id]
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let entries = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            entity_to_resource: DashMap::new(),
            by_holder: DashMap::new(),
            audit: AuditLog::new(),
            commit_gate: RwLock::new(()),
            lock_timeout,
        };

        // Rebuild plain states first; they only get their locks once replay
        // is done.
        let replayed = entries.len();
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
        for entry in entries {
            match entry {
                LogEntry::Commit { event, audit } => {
                    engine.replay_event(&mut resources, &event);
                    engine.audit.append(audit);
                }
                LogEntry::State(event) => engine.replay_event(&mut resources, &event),
                LogEntry::Audit(audit) => engine.audit.append(audit),
            }
        }
        for (id, rs) in resources {
            engine.state.insert(id, Arc::new(RwLock::new(rs)));
        }

        info!(
            path = %wal_path.display(),
            records = replayed,
            resources = engine.state.len(),
            reservations = engine.entity_to_resource.len(),
            "engine loaded"
        );
        Ok(engine)
    }

    fn replay_event(&self, resources: &mut HashMap<Ulid, ResourceState>, event: &Event) {
        if let Event::ResourceRegistered { id, name, group } = event {
            resources.insert(*id, ResourceState::new(*id, name.clone(), group.clone()));
            return;
        }
        for rid in event_resource_ids(event) {
            if let Some(rs) = resources.get_mut(&rid) {
                apply_to_resource(rs, event);
            }
        }
        self.index_event(event);
    }

    fn index_event(&self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.entity_to_resource
                    .insert(reservation.id, reservation.resource_id);
                self.by_holder
                    .entry(reservation.holder_id.clone())
                    .or_default()
                    .push(reservation.id);
            }
            Event::ReservationUpdated { reservation, .. } => {
                self.entity_to_resource
                    .insert(reservation.id, reservation.resource_id);
            }
            Event::ResourceRegistered { .. } | Event::ResourceStatusChanged { .. } => {}
        }
    }

    /// Write a record via the background group-commit writer.
    async fn wal_append(&self, entry: LogEntry) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                entry,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply, index, then publish the audit entry. The caller
    /// holds the commit gate and the write lock of every resource the event
    /// touches.
    ///
    /// Not cancellation safe: dropped between the append and the apply,
    /// the log holds a record memory never saw. Callers that can be
    /// dropped commit from a spawned task.
    pub(super) async fn persist_and_apply(
        &self,
        locked: &mut [&mut ResourceState],
        event: Event,
        audit: AuditEntry,
    ) -> Result<(), EngineError> {
        self.wal_append(LogEntry::Commit {
            event: event.clone(),
            audit: audit.clone(),
        })
        .await?;
        for rs in locked.iter_mut() {
            apply_to_resource(rs, &event);
        }
        self.index_event(&event);
        self.audit.append(audit);
        Ok(())
    }

    pub(super) async fn enter_commit(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        tokio::time::timeout(self.lock_timeout, self.commit_gate.read())
            .await
            .map_err(|_| EngineError::Timeout("commit gate"))
    }

    /// Wait for in-flight commits to finish and hold off new ones while
    /// the guard lives. Taken at shutdown.
    pub async fn quiesce(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_gate.write().await
    }

    pub(super) async fn write_resource(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        tokio::time::timeout(self.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::Timeout("resource write lock"))
    }

    pub(super) async fn read_resource(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        tokio::time::timeout(self.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| EngineError::Timeout("resource read lock"))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_reservation(&self, id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(id).map(|e| *e.value())
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }

    /// Sorted so that multi-resource reads and compaction snapshots are
    /// deterministic.
    pub(super) fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}
