//! Event types for the JBX event system
//!
//! Provides the shared event enum and EventBus used inside the controller
//! context. Events are broadcast one-to-many via `tokio::sync::broadcast`;
//! cross-context traffic goes over the mailbox instead (see
//! [`crate::mailbox`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{RotationReason, Track, TrackId};

/// JBX event types
///
/// All controller-side notifications use this central enum for type safety
/// and exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JbxEvent {
    /// A play session was armed and the play command sent to the surface
    TrackStarted {
        track_id: TrackId,
        /// Priority queue entry id when the track was a user request
        entry_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },

    /// A play session reached a terminal outcome and the queue advanced
    TrackCompleted {
        track_id: TrackId,
        /// False when the session was forced forward (error or stall)
        completed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Priority queue or default playlist contents changed
    QueueChanged {
        priority_len: usize,
        playlist_len: usize,
        timestamp: DateTime<Utc>,
    },

    /// No matching status arrived before the heartbeat deadline
    PlaybackStalled {
        track_id: TrackId,
        timestamp: DateTime<Utc>,
    },

    /// The surface reported error/unavailable and the track was skipped
    PlaybackErrorSkipped {
        track_id: TrackId,
        timestamp: DateTime<Utc>,
    },

    /// The rotation service switched active credentials
    CredentialRotated {
        from_credential: Option<String>,
        to_credential: Option<String>,
        reason: RotationReason,
        timestamp: DateTime<Utc>,
    },

    /// Every credential is exhausted or over threshold; user-visible
    /// "paused, needs attention" condition
    CredentialPoolExhausted { timestamp: DateTime<Utc> },

    /// A catalog load succeeded
    CatalogLoaded {
        playlist_id: String,
        track_count: usize,
        provider: String,
        timestamp: DateTime<Utc>,
    },

    /// Every provider in the fallback chain failed for this playlist
    CatalogFailed {
        playlist_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// External recovery routine injected a ready-made playlist, bypassing
    /// the normal load path
    EmergencyPlaylistInjected {
        tracks: Vec<Track>,
        timestamp: DateTime<Utc>,
    },
}

/// One-to-many event broadcaster
///
/// Thin wrapper over `tokio::sync::broadcast` so emitters do not care whether
/// anyone is listening.
pub struct EventBus {
    tx: broadcast::Sender<JbxEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus buffering up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<JbxEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)`, or `Err` if no subscribers exist.
    pub fn emit(
        &self,
        event: JbxEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<JbxEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring whether anyone is listening
    pub fn emit_lossy(&self, event: JbxEvent) {
        let _ = self.tx.send(event);
    }

    /// Channel capacity this bus was created with
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
