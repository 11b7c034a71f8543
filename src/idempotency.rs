//! Replay protection for creation requests.
//!
//! One slot per key. A slot is a `OnceCell`, so concurrent requests with the
//! same key queue behind the first: if it succeeds they all get its result,
//! if it fails the next waiter runs its own attempt. Failures are never
//! stored.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord<T> {
    pub value: T,
    pub created_at: Ms,
}

struct Slot<T> {
    cell: OnceCell<IdempotencyRecord<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceCell::new(),
        })
    }
}

pub struct IdempotencyCache<T> {
    slots: DashMap<String, Arc<Slot<T>>>,
    ttl_ms: Ms,
}

impl<T: Clone> IdempotencyCache<T> {
    pub fn new(ttl_ms: Ms) -> Self {
        Self {
            slots: DashMap::new(),
            ttl_ms,
        }
    }

    fn live(&self, record: &IdempotencyRecord<T>, now: Ms) -> bool {
        now < record.created_at + self.ttl_ms
    }

    /// The slot for `key`, replacing one whose record has expired.
    fn slot(&self, key: &str, now: Ms) -> Arc<Slot<T>> {
        let mut entry = self.slots.entry(key.to_string()).or_insert_with(Slot::empty);
        if entry.cell.get().is_some_and(|r| !self.live(r, now)) {
            *entry = Slot::empty();
        }
        entry.value().clone()
    }

    pub fn lookup(&self, key: &str, now: Ms) -> Option<T> {
        let slot = self.slots.get(key)?;
        let record = slot.cell.get()?;
        self.live(record, now).then(|| record.value.clone())
    }

    /// First writer wins. Returns whether this call stored the value.
    pub fn store(&self, key: &str, value: T, now: Ms) -> bool {
        self.slot(key, now)
            .cell
            .set(IdempotencyRecord {
                value,
                created_at: now,
            })
            .is_ok()
    }

    /// The cached value for `key`, or the result of running `f` and caching
    /// it. The flag is true when the value was replayed rather than produced
    /// by this call.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &str,
        now: Ms,
        f: F,
    ) -> Result<(T, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.slot(key, now);
        let mut produced = false;
        let produced_here = &mut produced;
        let record = slot
            .cell
            .get_or_try_init(move || async move {
                let value = f().await?;
                *produced_here = true;
                Ok(IdempotencyRecord {
                    value,
                    created_at: now,
                })
            })
            .await?;
        let value = record.value.clone();
        Ok((value, !produced))
    }

    /// Drop expired records and abandoned empty slots. Returns how many
    /// records were dropped.
    pub fn purge_expired(&self, now: Ms) -> usize {
        let mut purged = 0;
        self.slots.retain(|_, slot| match slot.cell.get() {
            Some(record) if !self.live(record, now) => {
                purged += 1;
                false
            }
            Some(_) => true,
            // Empty and nobody waiting on it: a failed attempt.
            None => Arc::strong_count(slot) > 1,
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
