//! Error types for jbx-core
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation.

use thiserror::Error;

/// Main error type for the jbx-core module
#[derive(Error, Debug)]
pub enum Error {
    /// Presentation surface could not be created after bounded attempts;
    /// fatal and non-retrying
    #[error("Presentation surface unavailable after {attempts} attempts")]
    SurfaceUnavailable { attempts: u32 },

    /// Sync channel errors
    #[error("Sync channel error: {0}")]
    Channel(String),

    /// A request for a track already pending in the priority queue,
    /// under the reject duplicate policy
    #[error("Duplicate request for track {0}")]
    DuplicateRequest(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Shared error types from jbx-common
    #[error(transparent)]
    Common(#[from] jbx_common::Error),
}

/// Convenience Result type using jbx-core Error
pub type Result<T> = std::result::Result<T, Error>;
