// SPDX-License-Identifier: MPL-2.0

//! In-memory test doubles for the service traits, plus row factories
//! shared by the engine's test modules.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::backend::types::{
    ListingRow, NotificationRow, ProfileRow, ReplyRow, ThreadRow, VoteRow, WatermarkRow,
};
use crate::backend::{
    ChangeKind, ChangeMessage, ChangeSource, ChannelScope, ClientError, DataService,
};

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("valid timestamp")
}

pub fn make_thread(id: &str, community_id: &str, up: u32, down: u32) -> ThreadRow {
    ThreadRow {
        id: id.to_string(),
        community_id: community_id.to_string(),
        author_id: format!("author-of-{id}"),
        title: format!("thread {id}"),
        body: "body".to_string(),
        up_count: up,
        down_count: down,
        reply_count: 0,
        created_at: ts(1_000),
        updated_at: ts(1_000),
    }
}

pub fn make_reply(id: &str, thread_id: &str, community_id: &str, author_id: &str, at: i64) -> ReplyRow {
    ReplyRow {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        community_id: community_id.to_string(),
        author_id: author_id.to_string(),
        body: format!("reply {id}"),
        flagged: false,
        created_at: ts(at),
        updated_at: ts(at),
    }
}

pub fn make_notification(id: &str, recipient_id: &str, actor_id: &str, at: i64) -> NotificationRow {
    NotificationRow {
        id: id.to_string(),
        recipient_id: recipient_id.to_string(),
        actor_id: actor_id.to_string(),
        kind: "reply".to_string(),
        subject_id: Some("t1".to_string()),
        body: format!("notification {id}"),
        read: false,
        repeat_count: 1,
        created_at: ts(at),
        updated_at: ts(at),
    }
}

pub fn make_listing(id: &str, community_id: &str, current: u32, max: u32, at: i64) -> ListingRow {
    ListingRow {
        id: id.to_string(),
        community_id: community_id.to_string(),
        title: format!("listing {id}"),
        status: "open".to_string(),
        current_participants: current,
        max_participants: max,
        latitude: 47.6,
        longitude: -122.3,
        starts_at: ts(at + 86_400),
        created_at: ts(at),
        updated_at: ts(at),
    }
}

pub fn make_profile(id: &str) -> ProfileRow {
    ProfileRow {
        id: id.to_string(),
        handle: format!("@{id}"),
        display_name: Some(format!("User {id}")),
        avatar_url: None,
    }
}

pub fn insert_msg<T: Serialize>(row: &T) -> ChangeMessage {
    ChangeMessage {
        kind: ChangeKind::Insert,
        row: Some(serde_json::to_value(row).expect("serializable row")),
        deleted_id: None,
    }
}

pub fn update_msg<T: Serialize>(row: &T) -> ChangeMessage {
    ChangeMessage {
        kind: ChangeKind::Update,
        row: Some(serde_json::to_value(row).expect("serializable row")),
        deleted_id: None,
    }
}

pub fn delete_msg(id: &str) -> ChangeMessage {
    ChangeMessage {
        kind: ChangeKind::Delete,
        row: None,
        deleted_id: Some(id.to_string()),
    }
}

/// In-memory [`DataService`] with scriptable failures and call recording.
#[derive(Default)]
pub struct StubService {
    pub threads: Mutex<HashMap<String, ThreadRow>>,
    pub replies: Mutex<Vec<ReplyRow>>,
    pub listings: Mutex<Vec<ListingRow>>,
    pub votes: Mutex<HashMap<(String, String), VoteRow>>,
    pub watermarks: Mutex<HashMap<(String, String), WatermarkRow>>,
    pub notifications: Mutex<Vec<NotificationRow>>,
    pub profiles: Mutex<HashMap<String, ProfileRow>>,
    fail_next: Mutex<HashMap<&'static str, ClientError>>,
    pub calls: Mutex<Vec<String>>,
}

impl StubService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next call to `op` to fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: ClientError) {
        self.fail_next.lock().unwrap().insert(op, err);
    }

    pub fn put_thread(&self, row: ThreadRow) {
        self.threads.lock().unwrap().insert(row.id.clone(), row);
    }

    pub fn put_profile(&self, row: ProfileRow) {
        self.profiles.lock().unwrap().insert(row.id.clone(), row);
    }

    pub fn push_reply(&self, row: ReplyRow) {
        self.replies.lock().unwrap().push(row);
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(&self, op: &'static str) -> Option<ClientError> {
        self.fail_next.lock().unwrap().remove(op)
    }
}

#[async_trait]
impl DataService for StubService {
    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadRow, ClientError> {
        self.record(format!("fetch_thread:{thread_id}"));
        if let Some(err) = self.take_failure("fetch_thread") {
            return Err(err);
        }
        self.threads
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .ok_or(ClientError::Status(404))
    }

    async fn fetch_threads(&self, community_id: &str) -> Result<Vec<ThreadRow>, ClientError> {
        self.record(format!("fetch_threads:{community_id}"));
        if let Some(err) = self.take_failure("fetch_threads") {
            return Err(err);
        }
        let mut rows: Vec<ThreadRow> = self
            .threads
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.community_id == community_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn fetch_replies(&self, thread_id: &str) -> Result<Vec<ReplyRow>, ClientError> {
        self.record(format!("fetch_replies:{thread_id}"));
        if let Some(err) = self.take_failure("fetch_replies") {
            return Err(err);
        }
        Ok(self
            .replies
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.thread_id == thread_id)
            .cloned()
            .collect())
    }

    async fn fetch_listings(&self, community_id: &str) -> Result<Vec<ListingRow>, ClientError> {
        self.record(format!("fetch_listings:{community_id}"));
        if let Some(err) = self.take_failure("fetch_listings") {
            return Err(err);
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.community_id == community_id)
            .cloned()
            .collect())
    }

    async fn fetch_vote(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Option<VoteRow>, ClientError> {
        self.record(format!("fetch_vote:{thread_id}:{user_id}"));
        if let Some(err) = self.take_failure("fetch_vote") {
            return Err(err);
        }
        Ok(self
            .votes
            .lock()
            .unwrap()
            .get(&(thread_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn fetch_votes(&self, user_id: &str) -> Result<Vec<VoteRow>, ClientError> {
        self.record(format!("fetch_votes:{user_id}"));
        if let Some(err) = self.take_failure("fetch_votes") {
            return Err(err);
        }
        Ok(self
            .votes
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_vote(&self, vote: &VoteRow) -> Result<(), ClientError> {
        self.record(format!("insert_vote:{}", vote.thread_id));
        if let Some(err) = self.take_failure("insert_vote") {
            return Err(err);
        }
        let key = (vote.thread_id.clone(), vote.user_id.clone());
        let mut votes = self.votes.lock().unwrap();
        if votes.contains_key(&key) {
            return Err(ClientError::Conflict);
        }
        votes.insert(key, vote.clone());
        Ok(())
    }

    async fn update_vote(&self, vote: &VoteRow) -> Result<(), ClientError> {
        self.record(format!("update_vote:{}", vote.thread_id));
        if let Some(err) = self.take_failure("update_vote") {
            return Err(err);
        }
        let key = (vote.thread_id.clone(), vote.user_id.clone());
        self.votes.lock().unwrap().insert(key, vote.clone());
        Ok(())
    }

    async fn delete_vote(&self, thread_id: &str, user_id: &str) -> Result<(), ClientError> {
        self.record(format!("delete_vote:{thread_id}"));
        if let Some(err) = self.take_failure("delete_vote") {
            return Err(err);
        }
        let key = (thread_id.to_string(), user_id.to_string());
        if self.votes.lock().unwrap().remove(&key).is_none() {
            return Err(ClientError::Status(404));
        }
        Ok(())
    }

    async fn upsert_watermark(&self, mark: &WatermarkRow) -> Result<(), ClientError> {
        self.record(format!("upsert_watermark:{}", mark.thread_id));
        if let Some(err) = self.take_failure("upsert_watermark") {
            return Err(err);
        }
        let key = (mark.thread_id.clone(), mark.user_id.clone());
        self.watermarks.lock().unwrap().insert(key, mark.clone());
        Ok(())
    }

    async fn fetch_watermarks(&self, user_id: &str) -> Result<Vec<WatermarkRow>, ClientError> {
        self.record(format!("fetch_watermarks:{user_id}"));
        if let Some(err) = self.take_failure("fetch_watermarks") {
            return Err(err);
        }
        Ok(self
            .watermarks
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn count_replies(
        &self,
        thread_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError> {
        self.record(format!("count_replies:{thread_id}"));
        if let Some(err) = self.take_failure("count_replies") {
            return Err(err);
        }
        Ok(self
            .replies
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.thread_id == thread_id)
            .filter(|r| since.is_none_or(|s| r.created_at > s))
            .count() as u64)
    }

    async fn fetch_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationRow>, ClientError> {
        self.record(format!("fetch_notifications:{user_id}"));
        if let Some(err) = self.take_failure("fetch_notifications") {
            return Err(err);
        }
        let mut rows: Vec<NotificationRow> = self
            .notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.recipient_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_notifications_read(&self, user_id: &str) -> Result<(), ClientError> {
        self.record(format!("mark_notifications_read:{user_id}"));
        if let Some(err) = self.take_failure("mark_notifications_read") {
            return Err(err);
        }
        for n in self.notifications.lock().unwrap().iter_mut() {
            if n.recipient_id == user_id {
                n.read = true;
            }
        }
        Ok(())
    }

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRow>, ClientError> {
        self.record(format!("profiles_by_ids:{}", ids.len()));
        if let Some(err) = self.take_failure("profiles_by_ids") {
            return Err(err);
        }
        let profiles = self.profiles.lock().unwrap();
        Ok(ids.iter().filter_map(|id| profiles.get(id).cloned()).collect())
    }
}

/// In-memory [`ChangeSource`]: tests push messages into open channels and
/// can kill them to simulate transport death.
#[derive(Default)]
pub struct StubFeed {
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<ChangeMessage>>>>,
    fail_opens: AtomicUsize,
    opens: AtomicUsize,
}

impl StubFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `open` calls fail with a network error.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Deliver a message to every channel open on `scope_key`.
    pub fn push(&self, scope_key: &str, msg: ChangeMessage) {
        let channels = self.channels.lock().unwrap();
        if let Some(senders) = channels.get(scope_key) {
            for tx in senders {
                let _ = tx.try_send(msg.clone());
            }
        }
    }

    /// Drop every channel open on `scope_key`, closing the receivers.
    pub fn kill(&self, scope_key: &str) {
        self.channels.lock().unwrap().remove(scope_key);
    }
}

#[async_trait]
impl ChangeSource for StubFeed {
    async fn open(
        &self,
        scope: &ChannelScope,
    ) -> Result<mpsc::Receiver<ChangeMessage>, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::Network("stubbed subscribe failure".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.channels
            .lock()
            .unwrap()
            .entry(scope.key())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
