//! Admission gate: the adapter between an HTTP layer and the limiter.
//!
//! The gate turns a request into a scope key and request id, evaluates it,
//! and either lets the request continue or hands it to the caller's rejection
//! action. What a rejection looks like (status, body, headers) is entirely up
//! to that action.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::ratelimit::{
    resolve_request_id, LimitRule, RequestContext, ScopeKey, ScopeStrategy, SlidingWindowLimiter,
    DEFAULT_KEY_NAMESPACE,
};
use crate::store::CounterStore;

/// What to do when the counter store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Let the request through; a store outage does not take the service down
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// Outcome of passing a request through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision<R> {
    /// Hand the request to the next handler unchanged
    Continue,
    /// The request was rejected; carries the rejection action's result
    Rejected(R),
}

impl<R> GateDecision<R> {
    /// Whether the request may continue.
    pub fn is_continue(&self) -> bool {
        matches!(self, GateDecision::Continue)
    }
}

type RejectFn<R> = Arc<dyn Fn(&RequestContext) -> R + Send + Sync>;

/// Rate limiting gate for one call site.
pub struct AdmissionGate<R> {
    limiter: Arc<SlidingWindowLimiter>,
    scope: ScopeStrategy,
    namespace: String,
    failure_policy: FailurePolicy,
    reject: RejectFn<R>,
}

impl<R> Clone for AdmissionGate<R> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            scope: self.scope.clone(),
            namespace: self.namespace.clone(),
            failure_policy: self.failure_policy,
            reject: Arc::clone(&self.reject),
        }
    }
}

impl<R> fmt::Debug for AdmissionGate<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("limiter", &self.limiter)
            .field("scope", &self.scope)
            .field("namespace", &self.namespace)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl<R> AdmissionGate<R> {
    /// Create a gate with an explicit scope strategy.
    pub fn new<F>(limiter: Arc<SlidingWindowLimiter>, scope: ScopeStrategy, reject: F) -> Self
    where
        F: Fn(&RequestContext) -> R + Send + Sync + 'static,
    {
        Self {
            limiter,
            scope,
            namespace: DEFAULT_KEY_NAMESPACE.to_string(),
            failure_policy: FailurePolicy::default(),
            reject: Arc::new(reject),
        }
    }

    /// Limit each route separately.
    pub fn per_route<F>(limiter: Arc<SlidingWindowLimiter>, reject: F) -> Self
    where
        F: Fn(&RequestContext) -> R + Send + Sync + 'static,
    {
        Self::new(limiter, ScopeStrategy::Route, reject)
    }

    /// Limit each client on each route separately.
    pub fn per_route_client<F>(limiter: Arc<SlidingWindowLimiter>, reject: F) -> Self
    where
        F: Fn(&RequestContext) -> R + Send + Sync + 'static,
    {
        Self::new(limiter, ScopeStrategy::RouteClient, reject)
    }

    /// Limit all requests together.
    pub fn global<F>(limiter: Arc<SlidingWindowLimiter>, reject: F) -> Self
    where
        F: Fn(&RequestContext) -> R + Send + Sync + 'static,
    {
        Self::new(limiter, ScopeStrategy::Global, reject)
    }

    /// Limit by a caller-computed discriminator.
    pub fn with_key_fn<K, F>(limiter: Arc<SlidingWindowLimiter>, key_fn: K, reject: F) -> Self
    where
        K: Fn(&RequestContext) -> String + Send + Sync + 'static,
        F: Fn(&RequestContext) -> R + Send + Sync + 'static,
    {
        Self::new(limiter, ScopeStrategy::custom(key_fn), reject)
    }

    /// Build a gate for a configured rule.
    pub fn from_rule<F>(
        rule: &LimitRule,
        store: Arc<dyn CounterStore>,
        store_config: &StoreConfig,
        reject: F,
    ) -> Result<Self>
    where
        F: Fn(&RequestContext) -> R + Send + Sync + 'static,
    {
        let limiter = SlidingWindowLimiter::new(store, rule.policy()?)
            .with_timeout(store_config.evaluate_timeout());

        Ok(Self::new(Arc::new(limiter), rule.strategy(), reject)
            .with_namespace(store_config.key_namespace.clone()))
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Choose what happens when the store is unavailable.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Get the limiter.
    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
        &self.limiter
    }

    /// Compute the scope key this gate uses for a request.
    pub fn scope_key(&self, ctx: &RequestContext) -> ScopeKey {
        self.scope.key(&self.namespace, ctx)
    }

    /// Evaluate a request and decide whether it continues.
    pub async fn check(&self, ctx: &RequestContext) -> GateDecision<R> {
        let key = self.scope_key(ctx);
        let request_id = resolve_request_id(ctx);

        match self.limiter.evaluate(&key, &request_id).await {
            Ok(admission) if admission.is_admitted() => GateDecision::Continue,
            Ok(admission) => {
                debug!(
                    key = %key,
                    request_id = %request_id,
                    count = admission.usage().count,
                    "Request rejected by rate limit"
                );
                GateDecision::Rejected((self.reject)(ctx))
            }
            Err(err) => {
                warn!(
                    key = %key,
                    error = %err,
                    policy = ?self.failure_policy,
                    "Rate limit evaluation failed"
                );
                match self.failure_policy {
                    FailurePolicy::FailOpen => GateDecision::Continue,
                    FailurePolicy::FailClosed => GateDecision::Rejected((self.reject)(ctx)),
                }
            }
        }
    }
}
