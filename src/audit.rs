use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Ms, Reservation, ResourceInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Reservation,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Modified,
    Cancelled,
    CheckedIn,
    EndedEarly,
    MarkedNoShow,
    /// Force-cancelled because the resource went into maintenance.
    AutoCancelled,
    ResourceRegistered,
    ResourceStatusChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Immutable record of one state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub at: Ms,
    pub actor: String,
    pub entity_type: EntityType,
    pub entity_id: Ulid,
    pub action: AuditAction,
    pub changes: Vec<FieldChange>,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        entity_type: EntityType,
        entity_id: Ulid,
        action: AuditAction,
        at: Ms,
    ) -> Self {
        Self {
            id: Ulid::new(),
            at,
            actor: actor.into(),
            entity_type,
            entity_id,
            action,
            changes: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_changes(mut self, changes: Vec<FieldChange>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn reservation(
        actor: impl Into<String>,
        before: Option<&Reservation>,
        after: &Reservation,
        action: AuditAction,
    ) -> Self {
        Self::new(actor, EntityType::Reservation, after.id, action, after.updated_at)
            .with_changes(reservation_diff(before, after))
    }

    pub fn resource(
        actor: impl Into<String>,
        before: Option<&ResourceInfo>,
        after: &ResourceInfo,
        action: AuditAction,
        at: Ms,
    ) -> Self {
        Self::new(actor, EntityType::Resource, after.id, action, at)
            .with_changes(resource_diff(before, after))
    }
}

fn reservation_fields(r: &Reservation) -> [(&'static str, Option<String>); 8] {
    [
        ("resource_id", Some(r.resource_id.to_string())),
        ("holder_id", Some(r.holder_id.clone())),
        ("start", Some(r.span.start.to_string())),
        ("end", Some(r.span.end.to_string())),
        ("status", Some(r.status.to_string())),
        ("checked_in_at", r.checked_in_at.map(|t| t.to_string())),
        ("actual_end", r.actual_end.map(|t| t.to_string())),
        ("cancelled_at", r.cancelled_at.map(|t| t.to_string())),
    ]
}

fn resource_fields(r: &ResourceInfo) -> [(&'static str, Option<String>); 3] {
    [
        ("name", Some(r.name.clone())),
        ("group", r.group.clone()),
        ("status", Some(r.status.as_str().to_string())),
    ]
}

fn diff_fields<const N: usize>(
    before: Option<[(&'static str, Option<String>); N]>,
    after: [(&'static str, Option<String>); N],
) -> Vec<FieldChange> {
    let before = before.map(|b| b.map(|(_, v)| v));
    after
        .into_iter()
        .enumerate()
        .filter_map(|(i, (field, after))| {
            let before = before.as_ref().and_then(|b| b[i].clone());
            (before != after).then(|| FieldChange {
                field: field.to_string(),
                before,
                after,
            })
        })
        .collect()
}

/// Changed fields between two versions of a row; `before = None` lists
/// every populated field of a new row.
pub fn reservation_diff(before: Option<&Reservation>, after: &Reservation) -> Vec<FieldChange> {
    diff_fields(before.map(reservation_fields), reservation_fields(after))
}

pub fn resource_diff(before: Option<&ResourceInfo>, after: &ResourceInfo) -> Vec<FieldChange> {
    diff_fields(before.map(resource_fields), resource_fields(after))
}

/// Append-only audit trail. Entries arrive here only after their WAL
/// commit, in commit order, and are never changed afterwards.
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    all: Vec<AuditEntry>,
    /// Positions in `all`, per entity, ascending.
    by_entity: HashMap<Ulid, Vec<usize>>,
}

impl Entries {
    fn push(&mut self, entry: AuditEntry) {
        self.by_entity
            .entry(entry.entity_id)
            .or_default()
            .push(self.all.len());
        self.all.push(entry);
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, entry: AuditEntry) {
        match self.inner.write() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    fn read_with<T>(&self, f: impl FnOnce(&Entries) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.read_with(|e| e.all.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.read_with(|e| e.all.clone())
    }

    pub fn trail(&self, entity_id: Ulid) -> Vec<AuditEntry> {
        self.read_with(|e| {
            e.by_entity
                .get(&entity_id)
                .map(|positions| positions.iter().filter_map(|&i| e.all.get(i).cloned()).collect())
                .unwrap_or_default()
        })
    }
}
