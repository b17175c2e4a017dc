//! # JBX Core - controller context
//!
//! Implements the jukebox kiosk core: the playback queue model, the player
//! lifecycle state machine, the cross-context sync channel, credential
//! rotation, and the catalog fallback chain. The rendering surface itself is
//! an external collaborator reached only through the mailbox.

pub mod catalog;
pub mod credentials;
pub mod error;
pub mod player;
pub mod queue;
pub mod session;
pub mod sync;

pub use error::{Error, Result};
