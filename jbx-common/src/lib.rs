//! # JBX Common Library
//!
//! Shared code for the jukebox kiosk contexts (controller and presentation
//! surface) including:
//! - Data model (tracks, queue entries, credential records)
//! - Event types (JbxEvent enum) and EventBus
//! - Mailbox message types (commands and status reports)
//! - Error types
//! - Configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod mailbox;
pub mod model;

pub use error::{Error, Result};
