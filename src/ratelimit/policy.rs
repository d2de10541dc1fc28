//! Window policy: how long the window is and how many events it may hold.

use std::time::Duration;

use crate::error::{RateWindowError, Result};

/// Immutable limit applied at one call site.
///
/// `threshold` is inclusive: the event that brings the live count to exactly
/// `threshold` is admitted, the next one is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    window: Duration,
    threshold: u64,
}

impl WindowPolicy {
    /// Create a policy, rejecting thresholds below one and windows that are
    /// not a whole, non-zero number of milliseconds.
    pub fn new(window: Duration, threshold: u64) -> Result<Self> {
        if threshold < 1 {
            return Err(RateWindowError::InvalidPolicy(
                "threshold must be at least 1".to_string(),
            ));
        }

        let millis = window.as_millis();
        if millis == 0 {
            return Err(RateWindowError::InvalidPolicy(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }
        if window.subsec_nanos() % 1_000_000 != 0 {
            return Err(RateWindowError::InvalidPolicy(format!(
                "window must be a whole number of milliseconds, got {:?}",
                window
            )));
        }
        if millis > i64::MAX as u128 {
            return Err(RateWindowError::InvalidPolicy(format!(
                "window {:?} does not fit in epoch milliseconds",
                window
            )));
        }

        Ok(Self { window, threshold })
    }

    /// Create a policy from a window given in milliseconds.
    pub fn from_millis(window_ms: u64, threshold: u64) -> Result<Self> {
        Self::new(Duration::from_millis(window_ms), threshold)
    }

    /// Get the window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Get the maximum number of live events.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}
