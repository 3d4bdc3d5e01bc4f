// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::STORE_EVENT_CAPACITY;

/// A record the projection store can hold: identified by a string id and
/// carrying the revision timestamp the ordering guard compares.
pub trait Projected: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn revised_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChangeKind {
    Upserted,
    Patched,
    Removed,
    Reset,
}

/// Emitted on the store's broadcast channel after every mutation.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub kind: StoreChangeKind,
    /// `None` for whole-store resets.
    pub id: Option<String>,
}

struct Slots<T> {
    records: HashMap<String, T>,
    /// Insertion order, for stable list rendering.
    order: Vec<String>,
}

/// Id-keyed, insertion-ordered in-memory projection.
///
/// `upsert` enforces the ordering guard: a record older than the cached one
/// is discarded, which is what makes at-least-once, reorder-prone delivery
/// safe to apply. `overwrite`/`reset` skip the guard and exist for
/// authoritative refetches; `patch` mutates in place without advancing the
/// revision, so an optimistic overlay never blocks the authoritative event
/// that follows it.
pub struct ProjectionStore<T> {
    slots: RwLock<Slots<T>>,
    changes_tx: broadcast::Sender<StoreChange>,
}

impl<T: Projected> ProjectionStore<T> {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self::with_channel(changes_tx)
    }

    /// Build a store publishing on an existing channel, so several stores
    /// behind one view can share a single change bus.
    pub fn with_channel(changes_tx: broadcast::Sender<StoreChange>) -> Self {
        Self {
            slots: RwLock::new(Slots {
                records: HashMap::new(),
                order: Vec::new(),
            }),
            changes_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes_tx.subscribe()
    }

    /// Insert or replace, subject to the ordering guard. Returns whether the
    /// record was applied.
    pub fn upsert(&self, record: T) -> bool {
        let id = record.id().to_string();
        {
            let mut slots = self.slots.write().unwrap();
            match slots.records.get(&id) {
                Some(existing) if existing.revised_at() > record.revised_at() => {
                    debug!(id = %id, "stale record dropped by ordering guard");
                    return false;
                }
                Some(_) => {
                    slots.records.insert(id.clone(), record);
                }
                None => {
                    slots.order.push(id.clone());
                    slots.records.insert(id.clone(), record);
                }
            }
        }
        self.emit(StoreChangeKind::Upserted, Some(id));
        true
    }

    /// Insert or replace unconditionally. For authoritative refetches,
    /// where the incoming record is known fresher than anything cached.
    pub fn overwrite(&self, record: T) {
        let id = record.id().to_string();
        {
            let mut slots = self.slots.write().unwrap();
            if !slots.records.contains_key(&id) {
                slots.order.push(id.clone());
            }
            slots.records.insert(id.clone(), record);
        }
        self.emit(StoreChangeKind::Upserted, Some(id));
    }

    /// Mutate a record in place. Deliberately leaves `revised_at` to the
    /// closure: the optimistic overlay keeps the cached revision so the
    /// authoritative event that follows still passes the guard.
    pub fn patch(&self, id: &str, mutate: impl FnOnce(&mut T)) -> bool {
        let patched = {
            let mut slots = self.slots.write().unwrap();
            match slots.records.get_mut(id) {
                Some(record) => {
                    mutate(record);
                    true
                }
                None => false,
            }
        };
        if patched {
            self.emit(StoreChangeKind::Patched, Some(id.to_string()));
        }
        patched
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut slots = self.slots.write().unwrap();
            if slots.records.remove(id).is_some() {
                slots.order.retain(|o| o != id);
                true
            } else {
                false
            }
        };
        if removed {
            self.emit(StoreChangeKind::Removed, Some(id.to_string()));
        }
        removed
    }

    /// Replace the whole projection from a full fetch.
    pub fn reset(&self, records: Vec<T>) {
        {
            let mut slots = self.slots.write().unwrap();
            slots.order = records.iter().map(|r| r.id().to_string()).collect();
            slots.records = records
                .into_iter()
                .map(|r| (r.id().to_string(), r))
                .collect();
        }
        self.emit(StoreChangeKind::Reset, None);
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.slots.read().unwrap().records.get(id).cloned()
    }

    /// All records in insertion order.
    pub fn get_all(&self) -> Vec<T> {
        let slots = self.slots.read().unwrap();
        slots
            .order
            .iter()
            .filter_map(|id| slots.records.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, kind: StoreChangeKind, id: Option<String>) {
        if self.changes_tx.send(StoreChange { kind, id }).is_err() {
            trace!("no subscribers for store change");
        }
    }
}

impl<T: Projected> Default for ProjectionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
