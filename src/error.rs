//! Error types for the Turnstile admission controller.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The sliding window for `key` is full.
    #[error("Rate limited: window {key} is full")]
    RateLimited { key: String },

    /// The shared window store could not be reached or could not run the
    /// evaluation script.
    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether the call was rejected because its window is full.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TurnstileError::RateLimited { .. })
    }

    /// Whether the decision could not be made because the store failed.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, TurnstileError::StoreUnavailable(_))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
