// SPDX-License-Identifier: MPL-2.0

//! The engine facade: one handle per open view, wiring the initial fetch,
//! the projection stores, the change subscriptions, and the optimistic
//! coordinators together so screens do not each grow their own ad hoc
//! subscription plumbing.

pub mod feed;
pub mod notifications;
pub mod unread;
pub mod votes;

pub use feed::{FeedHandlers, FeedSubscription};
pub use notifications::NotificationFeed;
pub use unread::UnreadTracker;
pub use votes::{MutationError, VoteCoordinator, VoteTransition, next_vote_state};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::client::RestClient;
use crate::backend::types::{
    ListingRow, ReplyRow, Session, ThreadRow, VoteDirection,
};
use crate::backend::{ChangeSource, ChannelScope, ClientError, DataService, tables};
use crate::config::{BACKFILL_DEBOUNCE_MS, DEFAULT_SERVICE, STORE_EVENT_CAPACITY};
use crate::runtime;
use crate::store::{
    Authored, ProfileDirectory, Projected, ProjectionStore, ReplyView, StoreChange, ThreadView,
};

/// Entry point for view components. Holds the service connection, the
/// signed-in session, and the per-user unread tracker shared by every view.
pub struct SyncEngine {
    service: Arc<dyn DataService>,
    source: Arc<dyn ChangeSource>,
    session: Session,
    unread: Arc<UnreadTracker>,
}

impl SyncEngine {
    pub fn new(
        service: Arc<dyn DataService>,
        source: Arc<dyn ChangeSource>,
        session: Session,
    ) -> Self {
        let unread = Arc::new(UnreadTracker::new(&session.user_id));
        Self {
            service,
            source,
            session,
            unread,
        }
    }

    /// Connect to the default Potluck service.
    pub fn connect(session: Session) -> Result<Self, ClientError> {
        Self::connect_to(DEFAULT_SERVICE, session)
    }

    pub fn connect_to(service_url: &str, session: Session) -> Result<Self, ClientError> {
        let client = Arc::new(RestClient::new(service_url)?);
        Ok(Self::new(
            Arc::clone(&client) as Arc<dyn DataService>,
            client as Arc<dyn ChangeSource>,
            session,
        ))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Reactive unread count for a thread; re-read on every
    /// `subscribe_unread` tick.
    pub fn unread(&self, thread_id: &str) -> u64 {
        self.unread.unread(thread_id)
    }

    /// Thread ids whose unread count changed.
    pub fn subscribe_unread(&self) -> broadcast::Receiver<String> {
        self.unread.subscribe()
    }

    /// Open a single discussion thread: the thread row, its replies, the
    /// viewer's vote, and live updates for all three.
    pub async fn open_thread_feed(&self, thread_id: &str) -> Result<ThreadFeed, ClientError> {
        ThreadFeed::open(self, thread_id).await
    }

    /// Open a community's thread listing, including per-thread unread
    /// bookkeeping driven by a community-scoped reply channel.
    pub async fn open_thread_list(&self, community_id: &str) -> Result<ThreadListFeed, ClientError> {
        ThreadListFeed::open(self, community_id).await
    }

    /// Open a community's live event listings.
    pub async fn open_listing_feed(&self, community_id: &str) -> Result<ListingFeed, ClientError> {
        ListingFeed::open(self, community_id).await
    }

    /// Open the signed-in user's notification stream.
    pub async fn open_notifications(&self) -> Result<NotificationFeed, ClientError> {
        NotificationFeed::open(
            Arc::clone(&self.service),
            Arc::clone(&self.source),
            self.session.clone(),
        )
        .await
    }
}

/// Collects the author ids an event burst references and resolves them in
/// one batched lookup, patching affected view records when it lands.
struct AuthorBackfill<T> {
    profiles: Arc<ProfileDirectory>,
    service: Arc<dyn DataService>,
    store: Arc<ProjectionStore<T>>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl<T: Projected + Authored> AuthorBackfill<T> {
    fn new(
        profiles: Arc<ProfileDirectory>,
        service: Arc<dyn DataService>,
        store: Arc<ProjectionStore<T>>,
    ) -> Self {
        Self {
            profiles,
            service,
            store,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn request(&self, author_id: &str) {
        let first_of_burst = {
            let mut pending = self.pending.lock().unwrap();
            let was_empty = pending.is_empty();
            pending.insert(author_id.to_string());
            was_empty
        };
        if !first_of_burst {
            return;
        }
        let profiles = Arc::clone(&self.profiles);
        let service = Arc::clone(&self.service);
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        runtime::spawn(async move {
            // Let the rest of the burst arrive before issuing the lookup.
            tokio::time::sleep(Duration::from_millis(BACKFILL_DEBOUNCE_MS)).await;
            let ids: Vec<String> = pending.lock().unwrap().drain().collect();
            if ids.is_empty() {
                return;
            }
            match profiles.ensure(service.as_ref(), ids).await {
                Ok(fetched) => {
                    for profile in fetched {
                        let targets: Vec<String> = store
                            .get_all()
                            .iter()
                            .filter(|v| v.author_id() == profile.id && !v.has_author())
                            .map(|v| v.id().to_string())
                            .collect();
                        for target in targets {
                            store.patch(&target, |v| v.set_author(profile.clone()));
                        }
                    }
                }
                Err(e) => warn!(error = %e, "author backfill failed"),
            }
        });
    }
}

fn merge_thread(store: &ProjectionStore<ThreadView>, row: ThreadRow) -> ThreadView {
    match store.get(&row.id) {
        Some(prev) => ThreadView {
            row,
            author: prev.author,
            viewer_vote: prev.viewer_vote,
        },
        None => ThreadView::new(row),
    }
}

fn merge_reply(store: &ProjectionStore<ReplyView>, row: ReplyRow) -> ReplyView {
    match store.get(&row.id) {
        Some(prev) => ReplyView {
            row,
            author: prev.author,
        },
        None => ReplyView::new(row),
    }
}

async fn load_thread_view(
    service: &Arc<dyn DataService>,
    profiles: &Arc<ProfileDirectory>,
    thread_id: &str,
    user_id: &str,
) -> Result<ThreadView, ClientError> {
    let row = service.fetch_thread(thread_id).await?;
    let vote = service.fetch_vote(thread_id, user_id).await?;
    profiles
        .ensure(service.as_ref(), vec![row.author_id.clone()])
        .await?;
    let author = profiles.get(&row.author_id);
    Ok(ThreadView {
        author,
        viewer_vote: vote.map(|v| v.direction),
        row,
    })
}

async fn load_reply_views(
    service: &Arc<dyn DataService>,
    profiles: &Arc<ProfileDirectory>,
    thread_id: &str,
) -> Result<Vec<ReplyView>, ClientError> {
    let rows = service.fetch_replies(thread_id).await?;
    let author_ids: Vec<String> = rows.iter().map(|r| r.author_id.clone()).collect();
    profiles.ensure(service.as_ref(), author_ids).await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let author = profiles.get(&row.author_id);
            ReplyView { row, author }
        })
        .collect())
}

async fn load_thread_list(
    service: &Arc<dyn DataService>,
    profiles: &Arc<ProfileDirectory>,
    community_id: &str,
    user_id: &str,
) -> Result<Vec<ThreadView>, ClientError> {
    let rows = service.fetch_threads(community_id).await?;
    let votes = service.fetch_votes(user_id).await?;
    let vote_by_thread: HashMap<String, VoteDirection> = votes
        .into_iter()
        .map(|v| (v.thread_id, v.direction))
        .collect();
    let author_ids: Vec<String> = rows.iter().map(|r| r.author_id.clone()).collect();
    profiles.ensure(service.as_ref(), author_ids).await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let author = profiles.get(&row.author_id);
            let viewer_vote = vote_by_thread.get(&row.id).copied();
            ThreadView {
                row,
                author,
                viewer_vote,
            }
        })
        .collect())
}

/// One open discussion thread.
pub struct ThreadFeed {
    thread_id: String,
    service: Arc<dyn DataService>,
    threads: Arc<ProjectionStore<ThreadView>>,
    replies: Arc<ProjectionStore<ReplyView>>,
    changes_tx: broadcast::Sender<StoreChange>,
    coordinator: Arc<VoteCoordinator>,
    unread: Arc<UnreadTracker>,
    live: Arc<AtomicBool>,
    thread_sub: FeedSubscription,
    reply_sub: FeedSubscription,
    closed: AtomicBool,
}

impl ThreadFeed {
    async fn open(engine: &SyncEngine, thread_id: &str) -> Result<Self, ClientError> {
        let service = Arc::clone(&engine.service);
        let profiles = Arc::new(ProfileDirectory::new());

        let thread_row = service.fetch_thread(thread_id).await?;
        let vote = service
            .fetch_vote(thread_id, &engine.session.user_id)
            .await?;
        let reply_rows = service.fetch_replies(thread_id).await?;

        // One batched lookup covers the thread author and every reply
        // author in the initial load.
        let mut author_ids = vec![thread_row.author_id.clone()];
        author_ids.extend(reply_rows.iter().map(|r| r.author_id.clone()));
        profiles.ensure(service.as_ref(), author_ids).await?;

        let view = ThreadView {
            author: profiles.get(&thread_row.author_id),
            viewer_vote: vote.map(|v| v.direction),
            row: thread_row,
        };
        let reply_views: Vec<ReplyView> = reply_rows
            .into_iter()
            .map(|row| {
                let author = profiles.get(&row.author_id);
                ReplyView { row, author }
            })
            .collect();

        let (changes_tx, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        let threads = Arc::new(ProjectionStore::with_channel(changes_tx.clone()));
        let replies = Arc::new(ProjectionStore::with_channel(changes_tx.clone()));
        threads.reset(vec![view]);
        replies.reset(reply_views);

        let live = Arc::new(AtomicBool::new(true));
        let coordinator = Arc::new(VoteCoordinator::new(
            Arc::clone(&service),
            engine.session.clone(),
            Arc::clone(&threads),
            Arc::clone(&live),
        ));

        // The user is looking at this thread now: its replies advance the
        // watermark instead of counting as unread.
        engine.unread.set_open(Some(thread_id));

        let thread_backfill =
            AuthorBackfill::new(Arc::clone(&profiles), Arc::clone(&service), Arc::clone(&threads));
        let reply_backfill =
            AuthorBackfill::new(Arc::clone(&profiles), Arc::clone(&service), Arc::clone(&replies));

        let thread_sub = feed::subscribe(
            Arc::clone(&engine.source),
            ChannelScope::new(tables::THREADS, "id", thread_id),
            ThreadRowHandlers {
                store: Arc::clone(&threads),
                service: Arc::clone(&service),
                profiles: Arc::clone(&profiles),
                backfill: thread_backfill,
                live: Arc::clone(&live),
                thread_id: thread_id.to_string(),
                user_id: engine.session.user_id.clone(),
            },
        );
        let reply_sub = feed::subscribe(
            Arc::clone(&engine.source),
            ChannelScope::new(tables::REPLIES, "thread_id", thread_id),
            ReplyRowHandlers {
                store: Arc::clone(&replies),
                service: Arc::clone(&service),
                profiles,
                backfill: reply_backfill,
                unread: Arc::clone(&engine.unread),
                live: Arc::clone(&live),
                thread_id: thread_id.to_string(),
            },
        );

        Ok(Self {
            thread_id: thread_id.to_string(),
            service,
            threads,
            replies,
            changes_tx,
            coordinator,
            unread: Arc::clone(&engine.unread),
            live,
            thread_sub,
            reply_sub,
            closed: AtomicBool::new(false),
        })
    }

    pub fn thread(&self) -> Option<ThreadView> {
        self.threads.get(&self.thread_id)
    }

    /// Replies in arrival order.
    pub fn replies(&self) -> Vec<ReplyView> {
        self.replies.get_all()
    }

    /// Fires on every change to the thread or its replies.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes_tx.subscribe()
    }

    /// Rolled-back mutations, for a non-blocking error indicator.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<MutationError> {
        self.coordinator.subscribe_errors()
    }

    /// Toggle the viewer's vote. Fire-and-forget: the store change stream
    /// carries the re-render, the error stream carries any rollback.
    pub fn toggle_vote(&self, direction: VoteDirection) {
        let coordinator = Arc::clone(&self.coordinator);
        let thread_id = self.thread_id.clone();
        runtime::spawn(async move {
            coordinator.toggle_vote(&thread_id, direction).await;
        });
    }

    /// Reset this thread's unread count and persist the watermark.
    /// Fire-and-forget: the watermark is monotonic and uncontended, so a
    /// failed write costs only a conservative count after restart.
    pub fn mark_viewed(&self) {
        let row = self.unread.mark_viewed(&self.thread_id);
        let service = Arc::clone(&self.service);
        runtime::spawn(async move {
            match service.upsert_watermark(&row).await {
                Ok(()) | Err(ClientError::Conflict) => {}
                Err(e) => warn!(thread = %row.thread_id, error = %e, "watermark write failed"),
            }
        });
    }

    /// True while live updates are paused and the view shows the last full
    /// fetch.
    pub fn degraded(&self) -> bool {
        self.thread_sub.degraded() || self.reply_sub.degraded()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.live.store(false, Ordering::SeqCst);
        self.thread_sub.cancel();
        self.reply_sub.cancel();
        if self.unread.open_thread().as_deref() == Some(self.thread_id.as_str()) {
            self.unread.set_open(None);
        }
        debug!(thread = %self.thread_id, "thread feed closed");
    }
}

impl Drop for ThreadFeed {
    fn drop(&mut self) {
        self.close();
    }
}

struct ThreadRowHandlers {
    store: Arc<ProjectionStore<ThreadView>>,
    service: Arc<dyn DataService>,
    profiles: Arc<ProfileDirectory>,
    backfill: AuthorBackfill<ThreadView>,
    live: Arc<AtomicBool>,
    thread_id: String,
    user_id: String,
}

impl ThreadRowHandlers {
    fn apply(&self, row: ThreadRow) {
        let author_known = self.profiles.get(&row.author_id).is_some();
        let author_id = row.author_id.clone();
        let view = merge_thread(&self.store, row);
        if self.store.upsert(view) && !author_known {
            self.backfill.request(&author_id);
        }
    }
}

impl FeedHandlers<ThreadRow> for ThreadRowHandlers {
    fn on_insert(&self, row: ThreadRow) {
        self.apply(row);
    }

    fn on_update(&self, row: ThreadRow) {
        self.apply(row);
    }

    fn on_delete(&self, id: &str) {
        // The thread was removed (moderation) while open.
        self.store.remove(id);
    }

    fn on_resync(&self) {
        let service = Arc::clone(&self.service);
        let profiles = Arc::clone(&self.profiles);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.live);
        let thread_id = self.thread_id.clone();
        let user_id = self.user_id.clone();
        runtime::spawn(async move {
            match load_thread_view(&service, &profiles, &thread_id, &user_id).await {
                Ok(view) => {
                    if live.load(Ordering::SeqCst) {
                        store.overwrite(view);
                    }
                }
                Err(e) => warn!(thread = %thread_id, error = %e, "thread refetch after resync failed"),
            }
        });
    }
}

struct ReplyRowHandlers {
    store: Arc<ProjectionStore<ReplyView>>,
    service: Arc<dyn DataService>,
    profiles: Arc<ProfileDirectory>,
    backfill: AuthorBackfill<ReplyView>,
    unread: Arc<UnreadTracker>,
    live: Arc<AtomicBool>,
    thread_id: String,
}

impl FeedHandlers<ReplyRow> for ReplyRowHandlers {
    fn on_insert(&self, row: ReplyRow) {
        self.unread.note_reply(&row);
        let author_known = self.profiles.get(&row.author_id).is_some();
        let author_id = row.author_id.clone();
        let view = merge_reply(&self.store, row);
        if self.store.upsert(view) && !author_known {
            self.backfill.request(&author_id);
        }
    }

    fn on_update(&self, row: ReplyRow) {
        // Moderation-flag changes and the like; never an unread signal.
        let view = merge_reply(&self.store, row);
        self.store.upsert(view);
    }

    fn on_delete(&self, id: &str) {
        self.unread.note_reply_deleted(id);
        self.store.remove(id);
    }

    fn on_resync(&self) {
        let service = Arc::clone(&self.service);
        let profiles = Arc::clone(&self.profiles);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.live);
        let thread_id = self.thread_id.clone();
        runtime::spawn(async move {
            match load_reply_views(&service, &profiles, &thread_id).await {
                Ok(views) => {
                    if live.load(Ordering::SeqCst) {
                        store.reset(views);
                    }
                }
                Err(e) => warn!(thread = %thread_id, error = %e, "reply refetch after resync failed"),
            }
        });
    }
}

/// A community's thread listing with per-thread unread counts.
pub struct ThreadListFeed {
    community_id: String,
    service: Arc<dyn DataService>,
    threads: Arc<ProjectionStore<ThreadView>>,
    coordinator: Arc<VoteCoordinator>,
    unread: Arc<UnreadTracker>,
    live: Arc<AtomicBool>,
    thread_sub: FeedSubscription,
    reply_sub: FeedSubscription,
    closed: AtomicBool,
}

impl ThreadListFeed {
    async fn open(engine: &SyncEngine, community_id: &str) -> Result<Self, ClientError> {
        let service = Arc::clone(&engine.service);
        let profiles = Arc::new(ProfileDirectory::new());

        let marks = service.fetch_watermarks(&engine.session.user_id).await?;
        engine.unread.set_watermarks(marks);

        let views =
            load_thread_list(&service, &profiles, community_id, &engine.session.user_id).await?;
        let threads = Arc::new(ProjectionStore::new());
        threads.reset(views);

        let live = Arc::new(AtomicBool::new(true));
        let coordinator = Arc::new(VoteCoordinator::new(
            Arc::clone(&service),
            engine.session.clone(),
            Arc::clone(&threads),
            Arc::clone(&live),
        ));

        let backfill =
            AuthorBackfill::new(Arc::clone(&profiles), Arc::clone(&service), Arc::clone(&threads));

        let thread_sub = feed::subscribe(
            Arc::clone(&engine.source),
            ChannelScope::new(tables::THREADS, "community_id", community_id),
            ThreadListHandlers {
                store: Arc::clone(&threads),
                service: Arc::clone(&service),
                profiles: Arc::clone(&profiles),
                backfill,
                live: Arc::clone(&live),
                community_id: community_id.to_string(),
                user_id: engine.session.user_id.clone(),
            },
        );
        // Community-wide reply traffic drives the unread arithmetic; no
        // reply bodies are stored at list level.
        let reply_sub = feed::subscribe(
            Arc::clone(&engine.source),
            ChannelScope::new(tables::REPLIES, "community_id", community_id),
            UnreadReplyHandlers {
                store: Arc::clone(&threads),
                service: Arc::clone(&service),
                unread: Arc::clone(&engine.unread),
                live: Arc::clone(&live),
            },
        );

        Ok(Self {
            community_id: community_id.to_string(),
            service,
            threads,
            coordinator,
            unread: Arc::clone(&engine.unread),
            live,
            thread_sub,
            reply_sub,
            closed: AtomicBool::new(false),
        })
    }

    pub fn threads(&self) -> Vec<ThreadView> {
        self.threads.get_all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.threads.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<MutationError> {
        self.coordinator.subscribe_errors()
    }

    /// Thread ids whose unread count changed.
    pub fn subscribe_unread(&self) -> broadcast::Receiver<String> {
        self.unread.subscribe()
    }

    pub fn unread(&self, thread_id: &str) -> u64 {
        self.unread.unread(thread_id)
    }

    /// Seed a thread's unread count with a full recount: replies newer
    /// than the watermark, or all of them if the thread was never viewed.
    /// Called lazily, e.g. for visible rows only.
    pub async fn prime_unread(&self, thread_id: &str) -> Result<(), ClientError> {
        let since = self.unread.watermark(thread_id);
        let count = self.service.count_replies(thread_id, since).await?;
        self.unread.prime(thread_id, count);
        Ok(())
    }

    pub fn toggle_vote(&self, thread_id: &str, direction: VoteDirection) {
        let coordinator = Arc::clone(&self.coordinator);
        let thread_id = thread_id.to_string();
        runtime::spawn(async move {
            coordinator.toggle_vote(&thread_id, direction).await;
        });
    }

    pub fn degraded(&self) -> bool {
        self.thread_sub.degraded() || self.reply_sub.degraded()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.live.store(false, Ordering::SeqCst);
        self.thread_sub.cancel();
        self.reply_sub.cancel();
        debug!(community = %self.community_id, "thread list closed");
    }
}

impl Drop for ThreadListFeed {
    fn drop(&mut self) {
        self.close();
    }
}

struct ThreadListHandlers {
    store: Arc<ProjectionStore<ThreadView>>,
    service: Arc<dyn DataService>,
    profiles: Arc<ProfileDirectory>,
    backfill: AuthorBackfill<ThreadView>,
    live: Arc<AtomicBool>,
    community_id: String,
    user_id: String,
}

impl ThreadListHandlers {
    fn apply(&self, row: ThreadRow) {
        let author_known = self.profiles.get(&row.author_id).is_some();
        let author_id = row.author_id.clone();
        let view = merge_thread(&self.store, row);
        if self.store.upsert(view) && !author_known {
            self.backfill.request(&author_id);
        }
    }
}

impl FeedHandlers<ThreadRow> for ThreadListHandlers {
    fn on_insert(&self, row: ThreadRow) {
        self.apply(row);
    }

    fn on_update(&self, row: ThreadRow) {
        self.apply(row);
    }

    fn on_delete(&self, id: &str) {
        self.store.remove(id);
    }

    fn on_resync(&self) {
        let service = Arc::clone(&self.service);
        let profiles = Arc::clone(&self.profiles);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.live);
        let community_id = self.community_id.clone();
        let user_id = self.user_id.clone();
        runtime::spawn(async move {
            match load_thread_list(&service, &profiles, &community_id, &user_id).await {
                Ok(views) => {
                    if live.load(Ordering::SeqCst) {
                        store.reset(views);
                    }
                }
                Err(e) => {
                    warn!(community = %community_id, error = %e, "thread list refetch after resync failed");
                }
            }
        });
    }
}

/// Reply events at community scope feed the unread tracker only.
struct UnreadReplyHandlers {
    store: Arc<ProjectionStore<ThreadView>>,
    service: Arc<dyn DataService>,
    unread: Arc<UnreadTracker>,
    live: Arc<AtomicBool>,
}

impl FeedHandlers<ReplyRow> for UnreadReplyHandlers {
    fn on_insert(&self, row: ReplyRow) {
        self.unread.note_reply(&row);
    }

    fn on_update(&self, _row: ReplyRow) {}

    fn on_delete(&self, id: &str) {
        self.unread.note_reply_deleted(id);
    }

    fn on_resync(&self) {
        // Incremental counts are unreliable across a delivery gap; fall
        // back to a recount for every listed thread.
        let service = Arc::clone(&self.service);
        let store = Arc::clone(&self.store);
        let unread = Arc::clone(&self.unread);
        let live = Arc::clone(&self.live);
        runtime::spawn(async move {
            for view in store.get_all() {
                if !live.load(Ordering::SeqCst) {
                    return;
                }
                let thread_id = view.row.id;
                let since = unread.watermark(&thread_id);
                match service.count_replies(&thread_id, since).await {
                    Ok(count) => unread.prime(&thread_id, count),
                    Err(e) => {
                        warn!(thread = %thread_id, error = %e, "unread recount after resync failed");
                    }
                }
            }
        });
    }
}

/// A community's live event listings. Capacity and status fields mutate
/// under concurrent RSVPs; the ordering guard keeps application safe.
pub struct ListingFeed {
    community_id: String,
    listings: Arc<ProjectionStore<ListingRow>>,
    live: Arc<AtomicBool>,
    subscription: FeedSubscription,
    closed: AtomicBool,
}

impl ListingFeed {
    async fn open(engine: &SyncEngine, community_id: &str) -> Result<Self, ClientError> {
        let service = Arc::clone(&engine.service);
        let rows = service.fetch_listings(community_id).await?;
        let listings = Arc::new(ProjectionStore::new());
        listings.reset(rows);

        let live = Arc::new(AtomicBool::new(true));
        let subscription = feed::subscribe(
            Arc::clone(&engine.source),
            ChannelScope::new(tables::LISTINGS, "community_id", community_id),
            ListingHandlers {
                store: Arc::clone(&listings),
                service,
                live: Arc::clone(&live),
                community_id: community_id.to_string(),
            },
        );

        Ok(Self {
            community_id: community_id.to_string(),
            listings,
            live,
            subscription,
            closed: AtomicBool::new(false),
        })
    }

    pub fn listings(&self) -> Vec<ListingRow> {
        self.listings.get_all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.listings.subscribe()
    }

    pub fn degraded(&self) -> bool {
        self.subscription.degraded()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.live.store(false, Ordering::SeqCst);
        self.subscription.cancel();
        debug!(community = %self.community_id, "listing feed closed");
    }
}

impl Drop for ListingFeed {
    fn drop(&mut self) {
        self.close();
    }
}

struct ListingHandlers {
    store: Arc<ProjectionStore<ListingRow>>,
    service: Arc<dyn DataService>,
    live: Arc<AtomicBool>,
    community_id: String,
}

impl FeedHandlers<ListingRow> for ListingHandlers {
    fn on_insert(&self, row: ListingRow) {
        self.store.upsert(row);
    }

    fn on_update(&self, row: ListingRow) {
        self.store.upsert(row);
    }

    fn on_delete(&self, id: &str) {
        self.store.remove(id);
    }

    fn on_resync(&self) {
        let service = Arc::clone(&self.service);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.live);
        let community_id = self.community_id.clone();
        runtime::spawn(async move {
            match service.fetch_listings(&community_id).await {
                Ok(rows) => {
                    if live.load(Ordering::SeqCst) {
                        store.reset(rows);
                    }
                }
                Err(e) => {
                    warn!(community = %community_id, error = %e, "listing refetch after resync failed");
                }
            }
        });
    }
}
