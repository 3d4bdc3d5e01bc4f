// SPDX-License-Identifier: MPL-2.0

//! Realtime feed synchronization and optimistic mutation engine for Potluck.
//!
//! This crate keeps multiple users' views of shared, frequently-mutated
//! collections (discussion threads, replies, votes, live event listings,
//! notifications) consistent against a remote data service that offers
//! at-least-once row-level change notifications and no replay across
//! connection gaps.
//!
//! The moving parts:
//! - [`sync::feed`] subscribes to scoped change channels, deduplicates and
//!   drops out-of-order events, and resynchronizes after channel death.
//! - [`store`] holds the in-memory projection each open view renders from.
//!   It is a rebuildable shadow of the backend, never a source of truth.
//! - [`sync::votes`] applies vote toggles locally before the remote write
//!   lands, then reconciles or rolls back.
//! - [`sync::unread`] derives unread counts from per-thread watermarks with
//!   incremental arithmetic instead of recount queries.
//! - [`sync::notifications`] drives the notification panel and badge from a
//!   recipient-scoped change channel.
//!
//! Views reach all of this through [`sync::SyncEngine`].

pub mod backend;
pub mod config;
pub mod runtime;
pub mod store;
pub mod sync;

pub use backend::types::{
    ListingRow, NotificationRow, ProfileRow, ReplyRow, Session, ThreadRow, VoteDirection, VoteRow,
    WatermarkRow,
};
pub use backend::{ChangeKind, ChangeMessage, ChangeSource, ChannelScope, ClientError, DataService};
pub use backend::client::RestClient;
pub use store::{ProjectionStore, ReplyView, StoreChange, ThreadView};
pub use sync::{ListingFeed, NotificationFeed, SyncEngine, ThreadFeed, ThreadListFeed};
