//! Sliding window rate limiter.
//!
//! Each evaluation records the event in the scope's window and compares the
//! resulting live count to the threshold. The record/count step is a single
//! atomic call on the counter store, so racing evaluators on different hosts
//! cannot both slip under the threshold.
//!
//! Denied events are recorded too. A client that keeps retrying while denied
//! keeps its own window full instead of getting a fresh slot as soon as the
//! oldest admitted event ages out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace};

use super::clock::{Clock, SystemClock};
use super::policy::WindowPolicy;
use super::scope::ScopeKey;
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// Default time to wait for the counter store before giving up.
pub const DEFAULT_EVALUATE_TIMEOUT: Duration = Duration::from_millis(250);

/// Window usage observed by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    /// Live entries after this event was recorded
    pub count: u64,
    /// The policy threshold
    pub threshold: u64,
}

impl WindowUsage {
    /// Slots left before the next event is denied.
    pub fn remaining(&self) -> u64 {
        self.threshold.saturating_sub(self.count)
    }
}

/// Outcome of evaluating one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The event fits in the window
    Admitted(WindowUsage),
    /// The event pushed the window over its threshold
    Denied(WindowUsage),
}

impl Admission {
    fn from_usage(usage: WindowUsage) -> Self {
        if usage.count <= usage.threshold {
            Admission::Admitted(usage)
        } else {
            Admission::Denied(usage)
        }
    }

    /// Whether the event was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    /// Get the observed window usage.
    pub fn usage(&self) -> WindowUsage {
        match self {
            Admission::Admitted(usage) | Admission::Denied(usage) => *usage,
        }
    }
}

/// Rate limiter that evaluates events against a shared sliding window.
///
/// The limiter holds no per-key state; all of it lives in the store, so one
/// limiter can be shared by every task in the process.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    policy: WindowPolicy,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter reading the system clock.
    pub fn new(store: Arc<dyn CounterStore>, policy: WindowPolicy) -> Self {
        Self {
            store,
            policy,
            clock: Arc::new(SystemClock::new()),
            timeout: DEFAULT_EVALUATE_TIMEOUT,
        }
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set how long to wait for the store on each call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the policy.
    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    /// Get the store timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate one event at the current time.
    pub async fn evaluate(&self, key: &ScopeKey, event_id: &str) -> Result<Admission> {
        self.evaluate_at(key, event_id, self.clock.now_millis()).await
    }

    /// Evaluate one event at `now_ms`.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the store fails or does not answer
    /// within the timeout. Nothing is admitted or denied in that case.
    #[instrument(skip(self, key, event_id), fields(key = %key))]
    pub async fn evaluate_at(&self, key: &ScopeKey, event_id: &str, now_ms: i64) -> Result<Admission> {
        let member = entry_member(event_id);
        let window_ms = self.policy.window_millis();

        let count = self
            .with_timeout_of(self.store.record(key.as_str(), &member, now_ms, window_ms))
            .await?;

        let admission = Admission::from_usage(WindowUsage {
            count,
            threshold: self.policy.threshold(),
        });

        trace!(
            key = %key,
            event_id = %event_id,
            now_ms = now_ms,
            count = count,
            admitted = admission.is_admitted(),
            "Evaluated sliding window"
        );

        if !admission.is_admitted() {
            debug!(
                key = %key,
                count = count,
                threshold = self.policy.threshold(),
                "Sliding window threshold exceeded"
            );
        }

        Ok(admission)
    }

    /// Count live entries for a key without recording anything.
    pub async fn live_count(&self, key: &ScopeKey) -> Result<u64> {
        let now_ms = self.clock.now_millis();
        self.with_timeout_of(
            self.store
                .live_count(key.as_str(), now_ms, self.policy.window_millis()),
        )
        .await
    }

    /// Drop the record for a key.
    pub async fn reset(&self, key: &ScopeKey) -> Result<()> {
        debug!(key = %key, "Resetting sliding window");
        self.with_timeout_of(self.store.clear(key.as_str())).await
    }

    async fn with_timeout_of<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout).into()),
        }
    }
}

/// Member stored for one evaluation: the event id plus a random nonce, so a
/// resent id still takes its own slot.
fn entry_member(event_id: &str) -> String {
    format!("{}#{:016x}", event_id, rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::request::RequestContext;
    use crate::ratelimit::scope::{ScopeStrategy, DEFAULT_KEY_NAMESPACE};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    const START_MS: i64 = 1_700_000_000_000;

    fn limiter(window_ms: u64, threshold: u64) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let policy = WindowPolicy::from_millis(window_ms, threshold).unwrap();
        let limiter = SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), policy)
            .with_clock(clock.clone());
        (limiter, clock)
    }

    fn key(name: &str) -> ScopeKey {
        ScopeKey::build(DEFAULT_KEY_NAMESPACE, name)
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let (limiter, clock) = limiter(1_000, 3);
        let key = key("/exact");

        for i in 1..=3 {
            let admission = limiter.evaluate(&key, "id").await.unwrap();
            assert!(admission.is_admitted(), "Request {} should be admitted", i);
            assert_eq!(admission.usage().count, i);
            clock.advance(Duration::from_millis(10));
        }

        let admission = limiter.evaluate(&key, "id").await.unwrap();
        assert!(!admission.is_admitted());
        assert_eq!(admission.usage().count, 4);
        assert_eq!(admission.usage().remaining(), 0);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, clock) = limiter(1_000, 2);
        let key = key("/slide");

        assert!(limiter.evaluate(&key, "a").await.unwrap().is_admitted());
        assert!(limiter.evaluate(&key, "b").await.unwrap().is_admitted());
        assert!(!limiter.evaluate(&key, "c").await.unwrap().is_admitted());

        clock.advance(Duration::from_millis(1_001));
        let admission = limiter.evaluate(&key, "d").await.unwrap();
        assert!(admission.is_admitted());
        assert_eq!(admission.usage().count, 1);
    }

    #[tokio::test]
    async fn test_denied_events_occupy_slots() {
        let (limiter, clock) = limiter(1_000, 2);
        let key = key("/retry");

        limiter.evaluate(&key, "a").await.unwrap();
        clock.advance(Duration::from_millis(500));
        limiter.evaluate(&key, "b").await.unwrap();
        clock.advance(Duration::from_millis(400));
        assert!(!limiter.evaluate(&key, "retry").await.unwrap().is_admitted());

        // "a" has aged out, but "b" and the denied retry are still live.
        clock.advance(Duration::from_millis(200));
        let admission = limiter.evaluate(&key, "again").await.unwrap();
        assert!(!admission.is_admitted());
        assert_eq!(admission.usage().count, 3);
    }

    #[tokio::test]
    async fn test_resent_id_takes_new_slot() {
        let (limiter, _clock) = limiter(1_000, 1);
        let key = key("/dup");

        assert!(limiter.evaluate(&key, "same").await.unwrap().is_admitted());
        assert!(!limiter.evaluate(&key, "same").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let (limiter, _clock) = limiter(1_000, 1);

        assert!(limiter.evaluate(&key("/a"), "1").await.unwrap().is_admitted());
        assert!(limiter.evaluate(&key("/b"), "1").await.unwrap().is_admitted());
        assert!(!limiter.evaluate(&key("/a"), "2").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_route_client_scenario() {
        let (limiter, clock) = limiter(20_000, 2);
        let strategy = ScopeStrategy::RouteClient;
        let a_x = RequestContext::new("/x").with_client_addr("10.0.0.1");
        let b_x = RequestContext::new("/x").with_client_addr("10.0.0.2");
        let a_y = RequestContext::new("/y").with_client_addr("10.0.0.1");

        let ns = DEFAULT_KEY_NAMESPACE;
        assert!(limiter.evaluate(&strategy.key(ns, &a_x), "1").await.unwrap().is_admitted());
        clock.advance(Duration::from_millis(100));
        assert!(limiter.evaluate(&strategy.key(ns, &a_x), "2").await.unwrap().is_admitted());
        clock.advance(Duration::from_millis(100));
        assert!(!limiter.evaluate(&strategy.key(ns, &a_x), "3").await.unwrap().is_admitted());
        assert!(limiter.evaluate(&strategy.key(ns, &b_x), "4").await.unwrap().is_admitted());
        assert!(limiter.evaluate(&strategy.key(ns, &a_y), "5").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_global_scope_aggregates_routes() {
        let (limiter, _clock) = limiter(60_000, 5);
        let strategy = ScopeStrategy::Global;

        for i in 0..5 {
            let path = if i % 2 == 0 { "/left" } else { "/right" };
            let key = strategy.key(DEFAULT_KEY_NAMESPACE, &RequestContext::new(path));
            assert!(limiter.evaluate(&key, "id").await.unwrap().is_admitted());
        }

        let key = strategy.key(DEFAULT_KEY_NAMESPACE, &RequestContext::new("/left"));
        assert!(!limiter.evaluate(&key, "id").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_concurrent_evaluations_never_exceed_threshold() {
        let (limiter, _clock) = limiter(60_000, 10);
        let limiter = Arc::new(limiter);
        let key = key("/burst");

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                let key = key.clone();
                tokio::spawn(async move { limiter.evaluate(&key, &i.to_string()).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_admitted() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(limiter.live_count(&key).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_live_count_and_reset() {
        let (limiter, _clock) = limiter(1_000, 5);
        let key = key("/ops");

        limiter.evaluate(&key, "a").await.unwrap();
        limiter.evaluate(&key, "b").await.unwrap();
        assert_eq!(limiter.live_count(&key).await.unwrap(), 2);

        assert_ok!(limiter.reset(&key).await);
        assert_eq!(limiter.live_count(&key).await.unwrap(), 0);
    }

    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn record(&self, _: &str, _: &str, _: i64, _: u64) -> std::result::Result<u64, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0)
        }

        async fn live_count(&self, _: &str, _: i64, _: u64) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Connect("refused".to_string()))
        }

        async fn clear(&self, _: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_timeout_is_store_unavailable() {
        let policy = WindowPolicy::from_millis(1_000, 1).unwrap();
        let limiter = SlidingWindowLimiter::new(Arc::new(StalledStore), policy)
            .with_timeout(Duration::from_millis(50));

        let err = limiter.evaluate(&key("/slow"), "id").await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(matches!(
            err,
            crate::error::RateWindowError::StoreUnavailable(StoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_store_error_is_store_unavailable() {
        let policy = WindowPolicy::from_millis(1_000, 1).unwrap();
        let limiter = SlidingWindowLimiter::new(Arc::new(StalledStore), policy);

        let err = assert_err!(limiter.live_count(&key("/down")).await);
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_entry_member_keeps_event_id() {
        let a = entry_member("req-1");
        let b = entry_member("req-1");
        assert!(a.starts_with("req-1#"));
        assert_ne!(a, b);
    }
}
