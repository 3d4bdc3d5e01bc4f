// SPDX-License-Identifier: MPL-2.0

//! Optimistic vote mutation.
//!
//! A toggle applies to the local projection immediately, then issues the
//! remote write. Success schedules a deferred reconciliation fetch (the
//! backend recomputes tallies in a trigger shortly after the write);
//! failure rolls the projection back to the exact pre-toggle values. A
//! uniqueness conflict means some other client already put the backend in
//! the desired state, so it reconciles instead of rolling back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::types::{Session, VoteDirection, VoteRow};
use crate::backend::{ClientError, DataService};
use crate::config::RECONCILE_DELAY_MS;
use crate::runtime;
use crate::store::{ProjectionStore, ThreadView};

/// Net effect of one toggle on the tally and the viewer's vote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTransition {
    pub next: Option<VoteDirection>,
    pub up_delta: i32,
    pub down_delta: i32,
}

/// The toggle transition table. Pure, so a rapid second toggle computed
/// from the already-optimistic state composes correctly with the first.
pub fn next_vote_state(current: Option<VoteDirection>, clicked: VoteDirection) -> VoteTransition {
    let side = |dir: VoteDirection, delta: i32| match dir {
        VoteDirection::Up => (delta, 0),
        VoteDirection::Down => (0, delta),
    };
    match current {
        // Clicking the active side removes the vote.
        Some(current) if current == clicked => {
            let (up_delta, down_delta) = side(current, -1);
            VoteTransition {
                next: None,
                up_delta,
                down_delta,
            }
        }
        // Switching sides moves one count across.
        Some(current) => {
            let (up_off, down_off) = side(current, -1);
            let (up_on, down_on) = side(clicked, 1);
            VoteTransition {
                next: Some(clicked),
                up_delta: up_off + up_on,
                down_delta: down_off + down_on,
            }
        }
        None => {
            let (up_delta, down_delta) = side(clicked, 1);
            VoteTransition {
                next: Some(clicked),
                up_delta,
                down_delta,
            }
        }
    }
}

fn apply_delta(count: u32, delta: i32) -> u32 {
    if delta >= 0 {
        count.saturating_add(delta as u32)
    } else {
        count.saturating_sub(delta.unsigned_abs())
    }
}

/// A rolled-back toggle, surfaced to the view as a non-blocking error.
#[derive(Debug, Clone)]
pub struct MutationError {
    pub thread_id: String,
    pub message: String,
}

#[derive(Clone, Copy)]
enum WriteOp {
    Insert,
    Update,
    Delete,
}

pub struct VoteCoordinator {
    service: Arc<dyn DataService>,
    session: Session,
    store: Arc<ProjectionStore<ThreadView>>,
    /// One in-flight remote write per thread; a second toggle's write waits
    /// for the first to resolve.
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Shared with the owning view; cleared on close so late reconciliation
    /// results are discarded.
    live: Arc<AtomicBool>,
    reconcile_delay: Duration,
    errors_tx: broadcast::Sender<MutationError>,
}

impl VoteCoordinator {
    pub fn new(
        service: Arc<dyn DataService>,
        session: Session,
        store: Arc<ProjectionStore<ThreadView>>,
        live: Arc<AtomicBool>,
    ) -> Self {
        let (errors_tx, _) = broadcast::channel(16);
        Self {
            service,
            session,
            store,
            write_locks: Mutex::new(HashMap::new()),
            live,
            reconcile_delay: Duration::from_millis(RECONCILE_DELAY_MS),
            errors_tx,
        }
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<MutationError> {
        self.errors_tx.subscribe()
    }

    /// Toggle the signed-in user's vote on `thread_id`.
    ///
    /// The local patch happens synchronously before the first await, so two
    /// rapid toggles each compute from the state the previous one applied.
    pub async fn toggle_vote(&self, thread_id: &str, clicked: VoteDirection) {
        let Some(view) = self.store.get(thread_id) else {
            warn!(thread = %thread_id, "vote toggle on a thread not in the projection");
            return;
        };
        let prior_up = view.row.up_count;
        let prior_down = view.row.down_count;
        let prior_vote = view.viewer_vote;

        let transition = next_vote_state(prior_vote, clicked);
        self.store.patch(thread_id, |v| {
            v.row.up_count = apply_delta(v.row.up_count, transition.up_delta);
            v.row.down_count = apply_delta(v.row.down_count, transition.down_delta);
            v.viewer_vote = transition.next;
        });

        let op = match (prior_vote, transition.next) {
            (None, Some(_)) => WriteOp::Insert,
            (Some(_), Some(_)) => WriteOp::Update,
            (Some(_), None) => WriteOp::Delete,
            // The transition table never maps a click to none -> none.
            (None, None) => return,
        };

        let lock = self.write_lock(thread_id);
        let _guard = lock.lock().await;

        let result = match op {
            WriteOp::Insert | WriteOp::Update => {
                let row = VoteRow {
                    thread_id: thread_id.to_string(),
                    user_id: self.session.user_id.clone(),
                    // The transition produced Some for these ops.
                    direction: transition.next.unwrap_or(clicked),
                    updated_at: Utc::now(),
                };
                match op {
                    WriteOp::Insert => self.service.insert_vote(&row).await,
                    _ => self.service.update_vote(&row).await,
                }
            }
            WriteOp::Delete => {
                self.service
                    .delete_vote(thread_id, &self.session.user_id)
                    .await
            }
        };

        match result {
            Ok(()) => self.schedule_reconcile(thread_id),
            Err(ClientError::Conflict) => {
                // The backend already holds the vote this toggle tried to
                // create; treat as satisfied and let reconciliation settle
                // the tally.
                debug!(thread = %thread_id, "vote write conflicted, already satisfied");
                self.schedule_reconcile(thread_id);
            }
            Err(ClientError::Status(404))
                if matches!(op, WriteOp::Delete | WriteOp::Update) =>
            {
                debug!(thread = %thread_id, "vote row already gone, already satisfied");
                self.schedule_reconcile(thread_id);
            }
            Err(e) => {
                warn!(thread = %thread_id, error = %e, "vote write failed, rolling back");
                self.store.patch(thread_id, |v| {
                    v.row.up_count = prior_up;
                    v.row.down_count = prior_down;
                    v.viewer_vote = prior_vote;
                });
                let _ = self.errors_tx.send(MutationError {
                    thread_id: thread_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn write_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Deferred re-read of the authoritative tally and vote, absorbing
    /// server-side trigger recomputation. Discarded if the view closed.
    fn schedule_reconcile(&self, thread_id: &str) {
        let service = Arc::clone(&self.service);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.live);
        let user_id = self.session.user_id.clone();
        let thread_id = thread_id.to_string();
        let delay = self.reconcile_delay;
        runtime::spawn(async move {
            tokio::time::sleep(delay).await;
            if !live.load(Ordering::SeqCst) {
                debug!(thread = %thread_id, "reconciliation discarded, view closed");
                return;
            }
            let fresh = match service.fetch_thread(&thread_id).await {
                Ok(row) => row,
                Err(e) => {
                    warn!(thread = %thread_id, error = %e, "reconciliation fetch failed");
                    return;
                }
            };
            let vote = match service.fetch_vote(&thread_id, &user_id).await {
                Ok(vote) => vote,
                Err(e) => {
                    warn!(thread = %thread_id, error = %e, "reconciliation vote fetch failed");
                    return;
                }
            };
            if !live.load(Ordering::SeqCst) {
                return;
            }
            store.patch(&thread_id, |v| {
                if fresh.updated_at >= v.row.updated_at {
                    v.row = fresh;
                }
                v.viewer_vote = vote.map(|row| row.direction);
            });
        });
    }
}
