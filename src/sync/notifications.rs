// SPDX-License-Identifier: MPL-2.0

//! The notification stream: a change feed scoped to the signed-in user,
//! driving the panel list, the unread badge, and toast side-effects.
//!
//! Repeated notifications of the same kind collapse server-side into a
//! counter on the existing row, so an update event is as much an unread
//! signal as an insert. Events caused by the user's own actions still apply
//! to the store but never produce a toast.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;
use tracing::warn;

use crate::backend::types::{NotificationRow, Session};
use crate::backend::{ChangeSource, ChannelScope, ClientError, DataService, tables};
use crate::config::NOTIFICATION_LIMIT;
use crate::runtime;
use crate::store::{ProjectionStore, StoreChange};
use crate::sync::feed::{self, FeedHandlers, FeedSubscription};

pub struct NotificationFeed {
    session: Session,
    service: Arc<dyn DataService>,
    store: Arc<ProjectionStore<NotificationRow>>,
    toasts_tx: broadcast::Sender<NotificationRow>,
    subscription: FeedSubscription,
    closed: AtomicBool,
}

impl NotificationFeed {
    pub(crate) async fn open(
        service: Arc<dyn DataService>,
        source: Arc<dyn ChangeSource>,
        session: Session,
    ) -> Result<Self, ClientError> {
        let store = Arc::new(ProjectionStore::new());
        let rows = service
            .fetch_notifications(&session.user_id, NOTIFICATION_LIMIT)
            .await?;
        store.reset(rows);

        let (toasts_tx, _) = broadcast::channel(32);
        let handlers = NotificationHandlers {
            store: Arc::clone(&store),
            service: Arc::clone(&service),
            session: session.clone(),
            toasts_tx: toasts_tx.clone(),
        };
        let scope = ChannelScope::new(tables::NOTIFICATIONS, "recipient_id", &session.user_id);
        let subscription = feed::subscribe(source, scope, handlers);

        Ok(Self {
            session,
            service,
            store,
            toasts_tx,
            subscription,
            closed: AtomicBool::new(false),
        })
    }

    /// Current notifications, newest first.
    pub fn notifications(&self) -> Vec<NotificationRow> {
        let mut rows = self.store.get_all();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn unread_badge(&self) -> usize {
        self.store.get_all().iter().filter(|n| !n.read).count()
    }

    /// Fires on every state change; the view re-reads `notifications()`
    /// and `unread_badge()`.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    /// Fires only for events that warrant a toast: fresh unread signal,
    /// not caused by the signed-in user.
    pub fn subscribe_toasts(&self) -> broadcast::Receiver<NotificationRow> {
        self.toasts_tx.subscribe()
    }

    pub fn degraded(&self) -> bool {
        self.subscription.degraded()
    }

    /// Flip everything read locally and tell the backend. Fire-and-forget:
    /// a failed write costs a re-appearing badge on next load, nothing
    /// worse, so there is no rollback path.
    pub fn mark_all_read(&self) {
        for row in self.store.get_all() {
            if !row.read {
                self.store.patch(&row.id, |n| n.read = true);
            }
        }
        let service = Arc::clone(&self.service);
        let user_id = self.session.user_id.clone();
        runtime::spawn(async move {
            if let Err(e) = service.mark_notifications_read(&user_id).await {
                warn!(error = %e, "marking notifications read failed");
            }
        });
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.subscription.cancel();
        }
    }
}

struct NotificationHandlers {
    store: Arc<ProjectionStore<NotificationRow>>,
    service: Arc<dyn DataService>,
    session: Session,
    toasts_tx: broadcast::Sender<NotificationRow>,
}

impl NotificationHandlers {
    fn toast(&self, row: NotificationRow) {
        if row.actor_id == self.session.user_id {
            // The user caused this themselves; state is applied, the
            // side-effect is suppressed.
            return;
        }
        // Nobody listening for toasts is fine.
        let _ = self.toasts_tx.send(row);
    }

    fn evict_over_cap(&self) {
        while self.store.len() > NOTIFICATION_LIMIT {
            let oldest = self
                .store
                .get_all()
                .into_iter()
                .min_by(|a, b| a.created_at.cmp(&b.created_at));
            match oldest {
                Some(row) => {
                    self.store.remove(&row.id);
                }
                None => break,
            }
        }
    }
}

impl FeedHandlers<NotificationRow> for NotificationHandlers {
    fn on_insert(&self, row: NotificationRow) {
        let fresh_unread = !row.read;
        if self.store.upsert(row.clone()) {
            self.evict_over_cap();
            if fresh_unread {
                self.toast(row);
            }
        }
    }

    fn on_update(&self, row: NotificationRow) {
        let prev = self.store.get(&row.id);
        if self.store.upsert(row.clone()) {
            // A collapsed repeat bumps the counter on the existing row;
            // that is a new unread signal even though it is an update.
            let repeat_bumped = prev.is_some_and(|p| row.repeat_count > p.repeat_count);
            if repeat_bumped && !row.read {
                self.toast(row);
            }
        }
    }

    fn on_delete(&self, id: &str) {
        self.store.remove(id);
    }

    fn on_resync(&self) {
        let service = Arc::clone(&self.service);
        let store = Arc::clone(&self.store);
        let user_id = self.session.user_id.clone();
        runtime::spawn(async move {
            match service.fetch_notifications(&user_id, NOTIFICATION_LIMIT).await {
                Ok(rows) => store.reset(rows),
                Err(e) => warn!(error = %e, "notification refetch after resync failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::{StubFeed, StubService, delete_msg, insert_msg, make_notification, update_msg};
    use crate::runtime;
    use std::time::Duration;

    fn session() -> Session {
        Session {
            user_id: "me".to_string(),
            handle: "@me".to_string(),
        }
    }

    fn scope_key() -> String {
        ChannelScope::new(tables::NOTIFICATIONS, "recipient_id", "me").key()
    }

    async fn open_feed() -> (Arc<StubService>, Arc<StubFeed>, NotificationFeed) {
        let service = Arc::new(StubService::new());
        let source = Arc::new(StubFeed::new());
        let feed = NotificationFeed::open(
            service.clone() as Arc<dyn DataService>,
            source.clone() as Arc<dyn ChangeSource>,
            session(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        (service, source, feed)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[test]
    fn test_initial_fetch_seeds_list_and_badge() {
        runtime::block_on(async {
            let service = Arc::new(StubService::new());
            service
                .notifications
                .lock()
                .unwrap()
                .push(make_notification("n1", "me", "u2", 100));
            let source = Arc::new(StubFeed::new());
            let feed = NotificationFeed::open(
                service as Arc<dyn DataService>,
                source as Arc<dyn ChangeSource>,
                session(),
            )
            .await
            .unwrap();
            assert_eq!(feed.notifications().len(), 1);
            assert_eq!(feed.unread_badge(), 1);
            feed.close();
        });
    }

    #[test]
    fn test_insert_appends_and_toasts() {
        runtime::block_on(async {
            let (_service, source, feed) = open_feed().await;
            let mut toasts = feed.subscribe_toasts();

            source.push(&scope_key(), insert_msg(&make_notification("n1", "me", "u2", 100)));
            settle().await;

            assert_eq!(feed.notifications().len(), 1);
            assert_eq!(feed.unread_badge(), 1);
            assert_eq!(toasts.try_recv().unwrap().id, "n1");
            feed.close();
        });
    }

    #[test]
    fn test_self_originated_event_updates_state_without_toast() {
        runtime::block_on(async {
            let (_service, source, feed) = open_feed().await;
            let mut toasts = feed.subscribe_toasts();

            source.push(&scope_key(), insert_msg(&make_notification("n1", "me", "me", 100)));
            settle().await;

            // State applied, side-effect suppressed.
            assert_eq!(feed.notifications().len(), 1);
            assert_eq!(feed.unread_badge(), 1);
            assert!(toasts.try_recv().is_err());
            feed.close();
        });
    }

    #[test]
    fn test_repeat_collapse_update_is_fresh_unread_signal() {
        runtime::block_on(async {
            let (_service, source, feed) = open_feed().await;
            let mut toasts = feed.subscribe_toasts();

            source.push(&scope_key(), insert_msg(&make_notification("n1", "me", "u2", 100)));
            settle().await;
            let _ = toasts.try_recv();

            let mut bumped = make_notification("n1", "me", "u2", 100);
            bumped.repeat_count = 2;
            bumped.updated_at = crate::backend::stub::ts(200);
            source.push(&scope_key(), update_msg(&bumped));
            settle().await;

            assert_eq!(feed.notifications().len(), 1);
            assert_eq!(toasts.try_recv().unwrap().repeat_count, 2);
            feed.close();
        });
    }

    #[test]
    fn test_read_flag_update_drops_badge_without_toast() {
        runtime::block_on(async {
            let (_service, source, feed) = open_feed().await;
            let mut toasts = feed.subscribe_toasts();

            source.push(&scope_key(), insert_msg(&make_notification("n1", "me", "u2", 100)));
            settle().await;
            let _ = toasts.try_recv();
            assert_eq!(feed.unread_badge(), 1);

            let mut read = make_notification("n1", "me", "u2", 100);
            read.read = true;
            read.updated_at = crate::backend::stub::ts(200);
            source.push(&scope_key(), update_msg(&read));
            settle().await;

            assert_eq!(feed.unread_badge(), 0);
            assert!(toasts.try_recv().is_err());
            feed.close();
        });
    }

    #[test]
    fn test_delete_removes_row() {
        runtime::block_on(async {
            let (_service, source, feed) = open_feed().await;
            source.push(&scope_key(), insert_msg(&make_notification("n1", "me", "u2", 100)));
            settle().await;
            source.push(&scope_key(), delete_msg("n1"));
            settle().await;
            assert!(feed.notifications().is_empty());
            feed.close();
        });
    }

    #[test]
    fn test_list_is_bounded_and_evicts_oldest() {
        runtime::block_on(async {
            let (_service, source, feed) = open_feed().await;
            for i in 0..NOTIFICATION_LIMIT {
                source.push(
                    &scope_key(),
                    insert_msg(&make_notification(&format!("n{i}"), "me", "u2", 100 + i as i64)),
                );
            }
            settle().await;
            assert_eq!(feed.notifications().len(), NOTIFICATION_LIMIT);

            source.push(&scope_key(), insert_msg(&make_notification("newest", "me", "u2", 9_000)));
            settle().await;

            let rows = feed.notifications();
            assert_eq!(rows.len(), NOTIFICATION_LIMIT);
            assert_eq!(rows[0].id, "newest");
            // n0 (created_at 100) was the oldest and is gone.
            assert!(!rows.iter().any(|n| n.id == "n0"));
            feed.close();
        });
    }

    #[test]
    fn test_mark_all_read_is_optimistic_and_writes_remote() {
        runtime::block_on(async {
            let (service, source, feed) = open_feed().await;
            source.push(&scope_key(), insert_msg(&make_notification("n1", "me", "u2", 100)));
            source.push(&scope_key(), insert_msg(&make_notification("n2", "me", "u2", 110)));
            settle().await;
            assert_eq!(feed.unread_badge(), 2);

            feed.mark_all_read();
            assert_eq!(feed.unread_badge(), 0);
            settle().await;
            assert_eq!(service.call_count("mark_notifications_read"), 1);
            feed.close();
        });
    }
}
