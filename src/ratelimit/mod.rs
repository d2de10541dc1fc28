//! Sliding window rate limiting: policies, scope keys, request identity and
//! the evaluator.

mod clock;
mod limiter;
mod policy;
mod request;
mod rules;
mod scope;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Admission, SlidingWindowLimiter, WindowUsage, DEFAULT_EVALUATE_TIMEOUT};
pub use policy::WindowPolicy;
pub use request::{resolve_request_id, RequestContext, ALT_REQUEST_ID_HEADER, REQUEST_ID_HEADER};
pub use rules::{LimitRule, RuleSet, ScopeKind};
pub use scope::{KeyFn, ScopeKey, ScopeStrategy, DEFAULT_KEY_NAMESPACE, GLOBAL_DISCRIMINATOR};
