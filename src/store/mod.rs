// SPDX-License-Identifier: MPL-2.0

//! In-memory projection layer.
//!
//! Each open view renders from a [`ProjectionStore`] of denormalized view
//! records. The store is patched from change-feed events and optimistic
//! mutations; it is rebuilt from a full fetch after a connection gap and is
//! never the source of truth.

mod profiles;
mod projection;

pub use profiles::ProfileDirectory;
pub use projection::{Projected, ProjectionStore, StoreChange, StoreChangeKind};

use chrono::{DateTime, Utc};

use crate::backend::types::{
    ListingRow, NotificationRow, ProfileRow, ReplyRow, ThreadRow, VoteDirection,
};

/// View records whose author summary is joined lazily: the backfill
/// batcher fills `author` in once the batched profile lookup resolves.
pub trait Authored {
    fn author_id(&self) -> &str;
    fn has_author(&self) -> bool;
    fn set_author(&mut self, profile: ProfileRow);
}

/// A thread joined with its author summary and the viewer's vote overlay.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub row: ThreadRow,
    pub author: Option<ProfileRow>,
    /// The signed-in user's vote, if any. Locally patched by the optimistic
    /// coordinator before the remote write lands.
    pub viewer_vote: Option<VoteDirection>,
}

impl ThreadView {
    pub fn new(row: ThreadRow) -> Self {
        Self {
            row,
            author: None,
            viewer_vote: None,
        }
    }
}

/// A reply joined with its author summary.
#[derive(Debug, Clone)]
pub struct ReplyView {
    pub row: ReplyRow,
    pub author: Option<ProfileRow>,
}

impl ReplyView {
    pub fn new(row: ReplyRow) -> Self {
        Self { row, author: None }
    }
}

impl Authored for ThreadView {
    fn author_id(&self) -> &str {
        &self.row.author_id
    }
    fn has_author(&self) -> bool {
        self.author.is_some()
    }
    fn set_author(&mut self, profile: ProfileRow) {
        self.author = Some(profile);
    }
}

impl Authored for ReplyView {
    fn author_id(&self) -> &str {
        &self.row.author_id
    }
    fn has_author(&self) -> bool {
        self.author.is_some()
    }
    fn set_author(&mut self, profile: ProfileRow) {
        self.author = Some(profile);
    }
}

impl Projected for ThreadView {
    fn id(&self) -> &str {
        &self.row.id
    }
    fn revised_at(&self) -> DateTime<Utc> {
        self.row.updated_at
    }
}

impl Projected for ReplyView {
    fn id(&self) -> &str {
        &self.row.id
    }
    fn revised_at(&self) -> DateTime<Utc> {
        self.row.updated_at
    }
}

impl Projected for ThreadRow {
    fn id(&self) -> &str {
        &self.id
    }
    fn revised_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Projected for ReplyRow {
    fn id(&self) -> &str {
        &self.id
    }
    fn revised_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Projected for ListingRow {
    fn id(&self) -> &str {
        &self.id
    }
    fn revised_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Projected for NotificationRow {
    fn id(&self) -> &str {
        &self.id
    }
    fn revised_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
