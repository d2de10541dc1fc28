//! Shared counter store backends.
//!
//! A counter store holds one timestamp-scored set per scope key. The only
//! write path is [`CounterStore::record`], which must purge, insert, count and
//! refresh expiry as a single atomic unit on the store side. Implementations
//! must never split it into separate read and write round trips: two
//! evaluators racing on the same key would then both observe a count below
//! the threshold and both admit.

mod memory;
mod redis_store;
mod shared;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, StoreOptions};
pub use self::shared::{install_shared_store, reset_shared_store, shared_store};

/// Errors raised while talking to a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the client could not be built
    #[error("failed to connect to counter store: {0}")]
    Connect(String),

    /// The store rejected or failed a command
    #[error("counter store command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// No reply arrived before the deadline
    #[error("counter store did not respond within {0:?}")]
    Timeout(Duration),
}

/// Trait for counter store implementations.
///
/// Timestamps are epoch milliseconds. An entry is live while
/// `score >= now_ms - window_ms`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically record one event for `key` and return the live count.
    ///
    /// In order: drop entries scored strictly below `now_ms - window_ms`,
    /// add `member` scored `now_ms`, count the set, and set the key to expire
    /// after `window_ms`. The returned count includes the new member.
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<u64, StoreError>;

    /// Count live entries for `key` without modifying it.
    async fn live_count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64, StoreError>;

    /// Drop the whole record for `key`.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Lowest score that is still live at `now_ms`.
pub(crate) fn window_floor(now_ms: i64, window_ms: u64) -> i64 {
    let window = i64::try_from(window_ms).unwrap_or(i64::MAX);
    now_ms.saturating_sub(window)
}
