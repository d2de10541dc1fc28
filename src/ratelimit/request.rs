//! Inbound request context and request identity resolution.

use std::collections::HashMap;

use tracing::trace;
use uuid::Uuid;

/// Primary header carrying a propagated request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Fallback header carrying a propagated request id.
pub const ALT_REQUEST_ID_HEADER: &str = "request-id";

/// The parts of an inbound request the limiter looks at.
///
/// Header names are stored lowercased so lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    path: String,
    client_addr: String,
    headers: HashMap<String, String>,
}

impl RequestContext {
    /// Create a context for a request to `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the client address as received, possibly a forwarded-for list.
    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = addr.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Get the request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the client IP: the first entry of the address list, trimmed.
    pub fn client_ip(&self) -> &str {
        self.client_addr
            .split(',')
            .next()
            .map(str::trim)
            .unwrap_or_default()
    }

    /// Get a header value, treating empty values as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Resolve the id recorded for this request.
///
/// Uses `X-Request-ID`, then `Request-ID`, and otherwise generates a random
/// UUID. The id is not a deduplication key: every evaluation records its own
/// entry even when the same id is sent twice.
pub fn resolve_request_id(ctx: &RequestContext) -> String {
    if let Some(id) = ctx.header(REQUEST_ID_HEADER) {
        return id.to_string();
    }

    if let Some(id) = ctx.header(ALT_REQUEST_ID_HEADER) {
        return id.to_string();
    }

    let id = Uuid::new_v4().to_string();
    trace!(path = %ctx.path(), request_id = %id, "No propagated request id, generated one");
    id
}
