//! Error types for the Ratewindow crate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratewindow operations.
#[derive(Error, Debug)]
pub enum RateWindowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A window policy that can never admit anything, rejected at setup
    #[error("Invalid window policy: {0}")]
    InvalidPolicy(String),

    /// The shared counter store could not complete an evaluation
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateWindowError {
    /// Whether this error came from the shared store rather than from setup.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RateWindowError::StoreUnavailable(_))
    }
}

impl From<config::ConfigError> for RateWindowError {
    fn from(err: config::ConfigError) -> Self {
        RateWindowError::Config(err.to_string())
    }
}

/// Result type alias for Ratewindow operations.
pub type Result<T> = std::result::Result<T, RateWindowError>;
