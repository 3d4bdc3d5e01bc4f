// SPDX-License-Identifier: MPL-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The signed-in user, as handed over by the (external) auth layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub handle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

/// Decoupled from the backend's wire representation so this crate owns the
/// API boundary. `updated_at` is the row revision: the ordering guard
/// compares it to decide whether an incoming event is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: String,
    pub community_id: String,
    pub author_id: String,
    pub title: String,
    pub body: String,
    pub up_count: u32,
    pub down_count: u32,
    pub reply_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRow {
    pub id: String,
    pub thread_id: String,
    /// Denormalized so one community-scoped channel carries reply traffic
    /// for unread bookkeeping across every thread in the community.
    pub community_id: String,
    pub author_id: String,
    pub body: String,
    /// Set by a moderator; the row stays visible to its author.
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// At most one per (thread, user); the backend enforces uniqueness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRow {
    pub thread_id: String,
    pub user_id: String,
    pub direction: VoteDirection,
    pub updated_at: DateTime<Utc>,
}

/// Last-viewed marker per (thread, user). Upserted, never appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkRow {
    pub thread_id: String,
    pub user_id: String,
    pub last_viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: String,
    pub recipient_id: String,
    /// Who caused the notification; used to suppress self-toasts.
    pub actor_id: String,
    pub kind: String,
    /// The thread/listing the notification points at, if any.
    pub subject_id: Option<String>,
    pub body: String,
    pub read: bool,
    /// Repeated notifications of the same kind collapse into this counter
    /// instead of new rows, so an update event is also an unread signal.
    pub repeat_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A live event/game listing. Capacity fields are concurrently incremented
/// by other users' RSVPs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRow {
    pub id: String,
    pub community_id: String,
    pub title: String,
    pub status: String,
    pub current_participants: u32,
    pub max_participants: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub starts_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author summary joined into view records by the projection layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}
