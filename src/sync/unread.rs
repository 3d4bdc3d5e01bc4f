// SPDX-License-Identifier: MPL-2.0

//! Per-thread unread bookkeeping from last-viewed watermarks.
//!
//! Counts move by local incremental arithmetic, one bare insert event at a
//! time. Re-counting "replies newer than the watermark" per event would be
//! wrong under concurrent load: a count query returns a number, not the
//! fact of a new arrival. The full recount happens only when a thread is
//! primed on load or after a resync.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::backend::types::{ReplyRow, WatermarkRow};

struct Inner {
    /// Last-viewed timestamp per thread. Absent = Unknown state: unread is
    /// the thread's total reply count.
    watermarks: HashMap<String, DateTime<Utc>>,
    counts: HashMap<String, u64>,
    /// Reply id -> thread id for replies counted since the last prime, so
    /// a bare delete event (id only) can decrement the right thread.
    counted: HashMap<String, String>,
    /// Thread the user is looking at right now, if any. Its replies are
    /// already being seen, so they advance the watermark instead of
    /// counting as unread.
    open_thread: Option<String>,
}

pub struct UnreadTracker {
    user_id: String,
    inner: RwLock<Inner>,
    changed_tx: broadcast::Sender<String>,
}

impl UnreadTracker {
    pub fn new(user_id: &str) -> Self {
        let (changed_tx, _) = broadcast::channel(256);
        Self {
            user_id: user_id.to_string(),
            inner: RwLock::new(Inner {
                watermarks: HashMap::new(),
                counts: HashMap::new(),
                counted: HashMap::new(),
                open_thread: None,
            }),
            changed_tx,
        }
    }

    /// Thread ids whose unread count changed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changed_tx.subscribe()
    }

    pub fn unread(&self, thread_id: &str) -> u64 {
        self.inner
            .read()
            .unwrap()
            .counts
            .get(thread_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn watermark(&self, thread_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().watermarks.get(thread_id).copied()
    }

    /// Merge the user's stored watermark rows, keeping the newest per
    /// thread. Called on initial load and after a resync.
    pub fn set_watermarks(&self, rows: Vec<WatermarkRow>) {
        let mut inner = self.inner.write().unwrap();
        for row in rows {
            inner
                .watermarks
                .entry(row.thread_id)
                .and_modify(|at| *at = (*at).max(row.last_viewed_at))
                .or_insert(row.last_viewed_at);
        }
    }

    /// Seed a thread's count from a full recount.
    pub fn prime(&self, thread_id: &str, count: u64) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.counts.insert(thread_id.to_string(), count);
            inner.counted.retain(|_, thread| thread.as_str() != thread_id);
        }
        self.emit(thread_id);
    }

    pub fn set_open(&self, thread_id: Option<&str>) {
        self.inner.write().unwrap().open_thread = thread_id.map(str::to_string);
    }

    pub fn open_thread(&self) -> Option<String> {
        self.inner.read().unwrap().open_thread.clone()
    }

    /// The user viewed `thread_id`: unread drops to zero immediately and
    /// the watermark advances to now. Monotonic, so a stale call never
    /// moves the watermark backwards. Returns the row for the remote
    /// upsert.
    pub fn mark_viewed(&self, thread_id: &str) -> WatermarkRow {
        let now = Utc::now();
        let last_viewed_at = {
            let mut inner = self.inner.write().unwrap();
            let mark = inner
                .watermarks
                .entry(thread_id.to_string())
                .and_modify(|at| *at = (*at).max(now))
                .or_insert(now);
            let mark = *mark;
            inner.counts.insert(thread_id.to_string(), 0);
            inner.counted.retain(|_, thread| thread.as_str() != thread_id);
            mark
        };
        self.emit(thread_id);
        WatermarkRow {
            thread_id: thread_id.to_string(),
            user_id: self.user_id.clone(),
            last_viewed_at,
        }
    }

    /// Account for a newly inserted reply, from the bare event payload.
    pub fn note_reply(&self, reply: &ReplyRow) {
        let changed = {
            let mut inner = self.inner.write().unwrap();
            if inner.open_thread.as_deref() == Some(reply.thread_id.as_str()) {
                // Being viewed right now: no unread, just move the
                // watermark past the reply.
                inner
                    .watermarks
                    .entry(reply.thread_id.clone())
                    .and_modify(|at| *at = (*at).max(reply.created_at))
                    .or_insert(reply.created_at);
                inner.counts.insert(reply.thread_id.clone(), 0);
                true
            } else {
                let stale = inner
                    .watermarks
                    .get(&reply.thread_id)
                    .is_some_and(|mark| reply.created_at <= *mark);
                if stale {
                    trace!(reply = %reply.id, "reply older than watermark ignored");
                    false
                } else if inner.counted.contains_key(&reply.id) {
                    // Already counted via another channel carrying the same
                    // table (per-thread and per-community scopes overlap).
                    false
                } else {
                    *inner.counts.entry(reply.thread_id.clone()).or_insert(0) += 1;
                    inner
                        .counted
                        .insert(reply.id.clone(), reply.thread_id.clone());
                    true
                }
            }
        };
        if changed {
            self.emit(&reply.thread_id);
        }
    }

    /// Account for a deleted reply. Only replies counted since the last
    /// prime can be attributed from a bare id; anything else is settled by
    /// the next prime.
    pub fn note_reply_deleted(&self, reply_id: &str) {
        let thread_id = {
            let mut inner = self.inner.write().unwrap();
            match inner.counted.remove(reply_id) {
                Some(thread_id) => {
                    let count = inner.counts.entry(thread_id.clone()).or_insert(0);
                    *count = count.saturating_sub(1);
                    Some(thread_id)
                }
                None => None,
            }
        };
        if let Some(thread_id) = thread_id {
            self.emit(&thread_id);
        }
    }

    fn emit(&self, thread_id: &str) {
        if self.changed_tx.send(thread_id.to_string()).is_err() {
            trace!("no subscribers for unread change");
        }
    }
}
