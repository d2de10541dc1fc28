//! Redis-backed counter store.
//!
//! Each scope key maps to a Redis sorted set whose members are event entries
//! and whose scores are arrival timestamps in milliseconds. The purge, insert,
//! count and expiry steps run inside one Lua script, so Redis serializes them
//! against every other evaluation on the same key.
//!
//! The connection is opened lazily on first use. The connect runs as its own
//! task and publishes the connection into the store when it finishes, so a
//! caller that stops waiting (an evaluation timeout) does not abort it, and
//! concurrent first callers all wait on the same attempt. A failed attempt
//! leaves the store idle and the next caller starts a new one.
//! `ConnectionManager` multiplexes requests and reconnects on its own; clones
//! share the underlying connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, warn};

use super::{window_floor, CounterStore, StoreError};

/// Purge, insert, count, expire. ARGV[2] is the exclusive lower bound
/// ("(" + floor) so that entries scored exactly at the floor stay live.
const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
local count = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return count
"#;

/// Connection options for the Redis store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379/")
    pub url: String,
    /// How long to wait for the initial connection
    pub connect_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, Result<ConnectionManager, Arc<StoreError>>>>;

enum ConnectionState {
    Idle,
    Connecting { attempt: u64, pending: PendingConnect },
    Ready(ConnectionManager),
}

/// Redis store shared by every limiter in the process.
pub struct RedisStore {
    options: StoreOptions,
    state: Arc<Mutex<ConnectionState>>,
    attempts: AtomicU64,
    script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store that connects on first use.
    pub fn new(options: StoreOptions) -> Self {
        Self::with_state(options, ConnectionState::Idle)
    }

    /// Create a store and verify the server answers a PING.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established in time.
    pub async fn connect(options: StoreOptions) -> Result<Self, StoreError> {
        let store = Self::new(options);
        let mut conn = store.connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(url = %store.options.url, "Connected to counter store");
        Ok(store)
    }

    /// Create a store around an already established connection.
    pub fn with_connection(options: StoreOptions, connection: ConnectionManager) -> Self {
        Self::with_state(options, ConnectionState::Ready(connection))
    }

    fn with_state(options: StoreOptions, state: ConnectionState) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(state)),
            attempts: AtomicU64::new(0),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    /// Get the connection options.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Whether a connection is established and cached.
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), ConnectionState::Ready(_))
    }

    /// Drop the cached connection; the next call reconnects. An attempt still
    /// in flight finishes but its connection is discarded.
    pub fn reset(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Idle);
        if !matches!(previous, ConnectionState::Idle) {
            debug!(url = %self.options.url, "Dropped counter store connection");
        }
    }

    /// Replace the cached connection.
    pub fn set_connection(&self, connection: ConnectionManager) {
        *self.state.lock() = ConnectionState::Ready(connection);
    }

    /// Get a handle to the connection, opening it if needed.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let pending = {
            let mut state = self.state.lock();
            match &*state {
                ConnectionState::Ready(conn) => return Ok(conn.clone()),
                ConnectionState::Connecting { pending, .. } => pending.clone(),
                ConnectionState::Idle => self.start_connect(&mut state),
            }
        };

        pending.await.map_err(|e| replay(&e))
    }

    /// Spawn a connect attempt and mark the store as connecting.
    fn start_connect(&self, state: &mut ConnectionState) -> PendingConnect {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let options = self.options.clone();
        let slot = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            let result = open(&options).await;

            let mut state = slot.lock();
            let current = matches!(
                &*state,
                ConnectionState::Connecting { attempt: a, .. } if *a == attempt
            );
            if current {
                *state = match &result {
                    Ok(conn) => ConnectionState::Ready(conn.clone()),
                    Err(_) => ConnectionState::Idle,
                };
            }
            result.map_err(Arc::new)
        });

        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(StoreError::Connect(format!("connect task failed: {}", e)))),
            }
        }
        .boxed()
        .shared();

        *state = ConnectionState::Connecting {
            attempt,
            pending: pending.clone(),
        };
        pending
    }
}

async fn open(options: &StoreOptions) -> Result<ConnectionManager, StoreError> {
    let client = Client::open(options.url.as_str()).map_err(|e| {
        warn!(url = %options.url, error = %e, "Invalid counter store URL");
        StoreError::Connect(e.to_string())
    })?;

    let conn = tokio::time::timeout(options.connect_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            warn!(url = %options.url, timeout = ?options.connect_timeout, "Counter store connect timed out");
            StoreError::Timeout(options.connect_timeout)
        })?
        .map_err(|e| {
            warn!(url = %options.url, error = %e, "Failed to connect to counter store");
            StoreError::Connect(e.to_string())
        })?;

    debug!(url = %options.url, "Opened counter store connection");
    Ok(conn)
}

/// Rebuild a connect failure for each caller waiting on the same attempt.
fn replay(err: &StoreError) -> StoreError {
    match err {
        StoreError::Connect(message) => StoreError::Connect(message.clone()),
        StoreError::Timeout(timeout) => StoreError::Timeout(*timeout),
        StoreError::Command(e) => StoreError::Connect(e.to_string()),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let floor = window_floor(now_ms, window_ms);

        let count: u64 = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(format!("({}", floor))
            .arg(member)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn live_count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let floor = window_floor(now_ms, window_ms);

        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(floor)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = StoreOptions::default();
        assert_eq!(options.url, "redis://127.0.0.1:6379/");
        assert_eq!(options.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_script_purges_with_exclusive_bound() {
        assert!(SLIDING_WINDOW_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW_SCRIPT.find("ZREMRANGEBYSCORE") < SLIDING_WINDOW_SCRIPT.find("ZADD"));
        assert!(SLIDING_WINDOW_SCRIPT.find("ZADD") < SLIDING_WINDOW_SCRIPT.find("ZCARD"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("PEXPIRE"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_connect_error() {
        let store = RedisStore::new(StoreOptions {
            url: "not a url".to_string(),
            connect_timeout: Duration::from_millis(50),
        });

        let result = store.record("k", "m", 1_000, 100).await;
        assert!(matches!(result, Err(StoreError::Connect(_))));
    }

    #[tokio::test]
    async fn test_reset_without_connection_is_noop() {
        let store = RedisStore::new(StoreOptions::default());
        store.reset();
        assert!(!store.is_connected());
        assert!(matches!(*store.state.lock(), ConnectionState::Idle));
    }

    #[tokio::test]
    async fn test_failed_attempt_leaves_store_idle() {
        let store = RedisStore::new(StoreOptions {
            url: "not a url".to_string(),
            connect_timeout: Duration::from_millis(50),
        });

        assert!(store.live_count("k", 1_000, 100).await.is_err());
        assert!(matches!(*store.state.lock(), ConnectionState::Idle));

        // A second caller starts a fresh attempt rather than reusing the failure.
        assert!(matches!(store.clear("k").await, Err(StoreError::Connect(_))));
        assert_eq!(store.attempts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_replay_keeps_failure_kind() {
        let timeout = replay(&StoreError::Timeout(Duration::from_millis(5)));
        assert!(matches!(timeout, StoreError::Timeout(d) if d == Duration::from_millis(5)));

        let connect = replay(&StoreError::Connect("refused".to_string()));
        assert!(matches!(connect, StoreError::Connect(ref m) if m == "refused"));
    }
}
