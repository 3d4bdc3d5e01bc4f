// SPDX-License-Identifier: MPL-2.0

//! The change feed client: typed delivery of row-level events from a
//! scoped channel, written once so dedup, ordering, and reconnect logic is
//! not re-implemented per screen.
//!
//! Delivery from the transport is at-least-once and only ordered within a
//! channel, so every event passes a per-id revision check before it reaches
//! the handlers. A dead channel is re-opened with bounded backoff; because
//! missed events are not redelivered, reconnection fires `on_resync` and
//! the consumer re-fetches the scoped collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{ChangeKind, ChangeMessage, ChangeSource, ChannelScope};
use crate::config::{RESUBSCRIBE_INITIAL_MS, RESUBSCRIBE_MAX_MS};
use crate::runtime;
use crate::store::Projected;

/// Typed event sink for one subscription.
pub trait FeedHandlers<T>: Send + Sync + 'static {
    fn on_insert(&self, row: T);
    fn on_update(&self, row: T);
    fn on_delete(&self, id: &str);
    /// The channel was re-opened after dying. The consumer must re-fetch
    /// the scoped collection; events during the gap are gone.
    fn on_resync(&self);
    fn on_degraded(&self, degraded: bool) {
        let _ = degraded;
    }
}

/// Handle to an open subscription. Dropping it unsubscribes.
pub struct FeedSubscription {
    key: String,
    live: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FeedSubscription {
    /// Stop delivery. Idempotent, and safe to call while an event is in
    /// flight: the pump checks the live flag before every handler call.
    pub fn cancel(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(channel = %self.key, "subscription cancelled");
        }
        self.task.abort();
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// True while the channel is down and events may be missing. The view
    /// keeps rendering the last full fetch.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Flag shared with the pump, for gating work tied to this
    /// subscription's lifetime (e.g. deferred reconciliation fetches).
    pub fn live_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Open a subscription on `scope`, delivering typed events to `handlers`.
pub fn subscribe<T, H>(
    source: Arc<dyn ChangeSource>,
    scope: ChannelScope,
    handlers: H,
) -> FeedSubscription
where
    T: Projected + DeserializeOwned,
    H: FeedHandlers<T>,
{
    let live = Arc::new(AtomicBool::new(true));
    let degraded = Arc::new(AtomicBool::new(false));
    let key = scope.key();
    let task = runtime::spawn(pump(
        source,
        scope,
        handlers,
        Arc::clone(&live),
        Arc::clone(&degraded),
    ));
    FeedSubscription {
        key,
        live,
        degraded,
        task,
    }
}

async fn pump<T, H>(
    source: Arc<dyn ChangeSource>,
    scope: ChannelScope,
    handlers: H,
    live: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
) where
    T: Projected + DeserializeOwned,
    H: FeedHandlers<T>,
{
    // Newest revision seen per primary key. Deletes pin the id to a
    // far-future sentinel so late events for the dead row are dropped.
    let mut seen: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut backoff = RESUBSCRIBE_INITIAL_MS;
    let mut first_open = true;

    while live.load(Ordering::SeqCst) {
        match source.open(&scope).await {
            Ok(mut rx) => {
                backoff = RESUBSCRIBE_INITIAL_MS;
                // Any open that is not the immediately-successful first
                // attempt has a delivery gap behind it.
                let resync_needed = !first_open;
                first_open = false;
                if resync_needed {
                    // Anything cached during the gap is unreliable.
                    seen.clear();
                    if degraded.swap(false, Ordering::SeqCst) {
                        handlers.on_degraded(false);
                    }
                    handlers.on_resync();
                }

                while let Some(msg) = rx.recv().await {
                    if !live.load(Ordering::SeqCst) {
                        return;
                    }
                    deliver(&scope, &mut seen, &handlers, msg);
                }

                if !live.load(Ordering::SeqCst) {
                    return;
                }
                warn!(channel = %scope.key(), "change channel died");
            }
            Err(e) => {
                if !live.load(Ordering::SeqCst) {
                    return;
                }
                first_open = false;
                warn!(channel = %scope.key(), error = %e, "subscribe failed");
            }
        }

        if !degraded.swap(true, Ordering::SeqCst) {
            handlers.on_degraded(true);
        }
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        backoff = (backoff * 2).min(RESUBSCRIBE_MAX_MS);
    }
}

fn deliver<T, H>(
    scope: &ChannelScope,
    seen: &mut HashMap<String, DateTime<Utc>>,
    handlers: &H,
    msg: ChangeMessage,
) where
    T: Projected + DeserializeOwned,
    H: FeedHandlers<T>,
{
    match msg.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(value) = msg.row else {
                warn!(channel = %scope.key(), "change event without a row");
                return;
            };
            let row: T = match serde_json::from_value(value) {
                Ok(row) => row,
                Err(e) => {
                    warn!(channel = %scope.key(), error = %e, "undecodable row skipped");
                    return;
                }
            };
            let id = row.id().to_string();
            if let Some(&newest) = seen.get(&id) {
                if row.revised_at() <= newest {
                    debug!(channel = %scope.key(), id = %id, "duplicate or stale event dropped");
                    return;
                }
            }
            seen.insert(id, row.revised_at());
            match msg.kind {
                ChangeKind::Insert => handlers.on_insert(row),
                _ => handlers.on_update(row),
            }
        }
        ChangeKind::Delete => {
            let Some(id) = msg.deleted_id else {
                warn!(channel = %scope.key(), "delete event without an id");
                return;
            };
            seen.insert(id.clone(), DateTime::<Utc>::MAX_UTC);
            handlers.on_delete(&id);
        }
    }
}
