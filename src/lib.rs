//! Ratewindow - Distributed Sliding Window Rate Limiting
//!
//! This crate limits request rates per route, per route and client IP, or
//! globally, with the window state held in a shared Redis store so every
//! server process enforces the same limit. Each evaluation runs as one atomic
//! script on the store; there is no local state to keep in sync.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;

pub use gate::{AdmissionGate, FailurePolicy, GateDecision};
pub use ratelimit::{Admission, RequestContext, ScopeKey, ScopeStrategy, SlidingWindowLimiter, WindowPolicy};
