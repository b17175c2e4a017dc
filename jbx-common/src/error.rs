//! Error types shared across JBX contexts
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation.

use thiserror::Error;

/// Main error type for jbx-common
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience Result type using jbx-common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Content fetch failure classification
///
/// Every provider-level failure in the catalog fallback chain is classified
/// into one of these before any retry decision is made. Provider errors never
/// propagate past the chain; callers only ever see an exhausted-chain outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Quota exceeded on the credential in use; retryable after backoff,
    /// and triggers credential rotation
    #[error("Rate limited")]
    RateLimited,

    /// Credential rejected; never retried on the same credential
    #[error("Invalid credential")]
    InvalidCredential,

    /// Transport failure; retryable with short backoff
    #[error("Network error: {0}")]
    Network(String),

    /// Response shape changed; not retryable on this provider
    #[error("Parse error: {0}")]
    Parse(String),

    /// Request deadline elapsed; retryable, counts toward the provider skip
    #[error("Timeout")]
    Timeout,
}

impl FetchError {
    /// Whether the chain should move straight to the next provider rather
    /// than backing off and retrying the same one.
    pub fn escalates_immediately(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited | FetchError::InvalidCredential | FetchError::Parse(_)
        )
    }
}
