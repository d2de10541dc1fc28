//! Scope key generation.
//!
//! A scope key is `namespace + discriminator`. Every process derives the same
//! key for the same logical scope, which is what lets them share one record.
//!
//! Route paths are normalized to start with `/`. Client addresses never do, and
//! the global discriminator does not either, so the three built-in strategies
//! cannot produce the same key under one namespace.

use std::fmt;
use std::sync::Arc;

use super::request::RequestContext;

/// Default namespace prepended to every scope key.
pub const DEFAULT_KEY_NAMESPACE: &str = "request:ratelimiter:";
/// Discriminator shared by every request under a global scope.
pub const GLOBAL_DISCRIMINATOR: &str = "global";

/// A key that uniquely identifies a rate-limited scope in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Build a key from a namespace and a discriminator.
    pub fn build(namespace: &str, discriminator: &str) -> Self {
        let mut key = String::with_capacity(namespace.len() + discriminator.len());
        key.push_str(namespace);
        key.push_str(discriminator);
        Self(key)
    }

    /// Get the key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied discriminator.
pub type KeyFn = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// How requests are grouped into scopes.
#[derive(Clone)]
pub enum ScopeStrategy {
    /// One scope per request path
    Route,
    /// One scope per client IP and request path, as `ip:path`
    RouteClient,
    /// One scope for every request
    Global,
    /// Discriminator computed by the caller
    Custom(KeyFn),
}

impl ScopeStrategy {
    /// Build a custom strategy from a closure.
    pub fn custom<F>(key_fn: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        ScopeStrategy::Custom(Arc::new(key_fn))
    }

    /// Compute the discriminator for a request.
    pub fn discriminator(&self, ctx: &RequestContext) -> String {
        match self {
            ScopeStrategy::Route => normalize_path(ctx.path()),
            ScopeStrategy::RouteClient => {
                format!("{}:{}", ctx.client_ip(), normalize_path(ctx.path()))
            }
            ScopeStrategy::Global => GLOBAL_DISCRIMINATOR.to_string(),
            ScopeStrategy::Custom(key_fn) => key_fn(ctx),
        }
    }

    /// Compute the full scope key for a request.
    pub fn key(&self, namespace: &str, ctx: &RequestContext) -> ScopeKey {
        ScopeKey::build(namespace, &self.discriminator(ctx))
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

impl fmt::Debug for ScopeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeStrategy::Route => f.write_str("Route"),
            ScopeStrategy::RouteClient => f.write_str("RouteClient"),
            ScopeStrategy::Global => f.write_str("Global"),
            ScopeStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
