// SPDX-License-Identifier: MPL-2.0

//! Shared async runtime for all background work.
//!
//! This module provides a single Tokio runtime that subscription pumps,
//! remote writes, and reconciliation timers share. It is built with one
//! worker thread: every store mutation lands on that thread, so a handler
//! runs to completion before the next queued event is processed.

use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::Runtime;

/// Shared single-worker Tokio runtime for all async operations.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .thread_name("potluck-sync")
        .build()
        .expect("failed to create async runtime")
});

/// Execute a future on the shared runtime, blocking until completion.
/// Use this from synchronous code that needs to call async functions.
pub fn block_on<F: Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}

/// Spawn a future on the shared runtime without blocking.
/// Returns a JoinHandle that can be used to await the result.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    RUNTIME.spawn(future)
}

/// Get a handle to the shared runtime for more advanced use cases.
pub fn handle() -> tokio::runtime::Handle {
    RUNTIME.handle().clone()
}
