// SPDX-License-Identifier: MPL-2.0

pub const DEFAULT_SERVICE: &str = "https://api.potluck.app";

/// Maximum notifications retained in the in-memory panel list.
pub const NOTIFICATION_LIMIT: usize = 50;

/// Delay before the post-write reconciliation fetch. Server-side triggers
/// recompute tallies shortly after a write commits; fetching immediately
/// would read the pre-trigger value.
pub const RECONCILE_DELAY_MS: u64 = 1_500;

/// Backoff bounds for re-opening a dead change channel.
pub const RESUBSCRIBE_INITIAL_MS: u64 = 500;
pub const RESUBSCRIBE_MAX_MS: u64 = 30_000;

/// Upper bound on ids in one batched profile lookup.
pub const PROFILE_BATCH_LIMIT: usize = 25;

/// How long the author backfill waits to collect an event burst before
/// issuing one batched lookup for every id the burst referenced.
pub const BACKFILL_DEBOUNCE_MS: u64 = 25;

/// Capacity of each store's change broadcast channel.
pub const STORE_EVENT_CAPACITY: usize = 256;
