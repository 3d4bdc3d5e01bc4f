// SPDX-License-Identifier: MPL-2.0

//! The data-service boundary.
//!
//! The backend is the sole source of truth for all entities. This module
//! defines the contract the engine needs from it: CRUD with equality
//! filters, a batched profile lookup, and scoped row-level change channels
//! with at-least-once delivery and no replay across connection gaps.
//! [`client::RestClient`] implements the contract over a JSON REST service.

pub mod client;
#[cfg(test)]
pub mod stub;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use types::{
    ListingRow, NotificationRow, ProfileRow, ReplyRow, ThreadRow, VoteRow, WatermarkRow,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request failed with status {0}")]
    Status(u16),
    /// Uniqueness violation. The coordinator reclassifies this as "already
    /// in desired state", not a failure.
    #[error("row already exists")]
    Conflict,
    #[error("not authenticated")]
    NotAuthenticated,
}

/// Table names used by channel scopes and the REST client.
pub mod tables {
    pub const THREADS: &str = "threads";
    pub const REPLIES: &str = "replies";
    pub const LISTINGS: &str = "listings";
    pub const NOTIFICATIONS: &str = "notifications";
}

/// A change channel watches one table filtered by equality on one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelScope {
    pub table: &'static str,
    pub filter_column: &'static str,
    pub filter_value: String,
}

impl ChannelScope {
    pub fn new(table: &'static str, filter_column: &'static str, filter_value: &str) -> Self {
        Self {
            table,
            filter_column,
            filter_value: filter_value.to_string(),
        }
    }

    /// Stable identifier for logging and channel registration.
    pub fn key(&self) -> String {
        format!("{}:{}={}", self.table, self.filter_column, self.filter_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level event off a change channel. Inserts and updates carry the
/// full row; deletes carry only the primary key.
#[derive(Debug, Clone)]
pub struct ChangeMessage {
    pub kind: ChangeKind,
    pub row: Option<serde_json::Value>,
    pub deleted_id: Option<String>,
}

/// CRUD and lookup operations the engine issues against the backend.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadRow, ClientError>;
    async fn fetch_threads(&self, community_id: &str) -> Result<Vec<ThreadRow>, ClientError>;
    async fn fetch_replies(&self, thread_id: &str) -> Result<Vec<ReplyRow>, ClientError>;
    async fn fetch_listings(&self, community_id: &str) -> Result<Vec<ListingRow>, ClientError>;

    async fn fetch_vote(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Option<VoteRow>, ClientError>;
    /// All of one user's votes, for seeding list views.
    async fn fetch_votes(&self, user_id: &str) -> Result<Vec<VoteRow>, ClientError>;
    async fn insert_vote(&self, vote: &VoteRow) -> Result<(), ClientError>;
    async fn update_vote(&self, vote: &VoteRow) -> Result<(), ClientError>;
    async fn delete_vote(&self, thread_id: &str, user_id: &str) -> Result<(), ClientError>;

    async fn upsert_watermark(&self, mark: &WatermarkRow) -> Result<(), ClientError>;
    async fn fetch_watermarks(&self, user_id: &str) -> Result<Vec<WatermarkRow>, ClientError>;
    /// Reply count for a thread, optionally restricted to rows created
    /// after `since`. Used only for the initial unread recount.
    async fn count_replies(
        &self,
        thread_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, ClientError>;

    async fn fetch_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<NotificationRow>, ClientError>;
    async fn mark_notifications_read(&self, user_id: &str) -> Result<(), ClientError>;

    /// Batched author lookup: one call per event burst, never one per row.
    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRow>, ClientError>;
}

/// Transport for scoped change channels.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a channel for the scope. The receiver closing means the
    /// transport died; callers re-open and re-fetch the scoped collection,
    /// since missed events are not redelivered.
    async fn open(
        &self,
        scope: &ChannelScope,
    ) -> Result<mpsc::Receiver<ChangeMessage>, ClientError>;
}
