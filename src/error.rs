//! Error types for the Windowguard limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Windowguard operations.
#[derive(Error, Debug)]
pub enum WindowguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A coordination key was expected in the store but is absent
    #[error("Store read error: key {key} is missing")]
    MissingKey { key: String },

    /// A coordination key holds something other than decimal text
    #[error("Store read error: key {key} holds non-numeric value {value:?}")]
    Malformed { key: String, value: String },

    /// Failures reported by the key-value store client
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The compare-and-swap retry budget ran out
    #[error("Counter {key} still contended after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WindowguardError {
    /// Whether this error came from reading a coordination key.
    pub fn is_read_error(&self) -> bool {
        matches!(
            self,
            WindowguardError::MissingKey { .. } | WindowguardError::Malformed { .. }
        )
    }
}

/// Result type alias for Windowguard operations.
pub type Result<T> = std::result::Result<T, WindowguardError>;
