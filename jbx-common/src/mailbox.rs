//! Mailbox message types for cross-context synchronization
//!
//! The controller and presentation surface share no memory; they coordinate
//! over a key-addressed, last-write-wins store. Commands and status reports
//! use independent keys so a command write never clobbers a pending status
//! and vice versa.
//!
//! Both messages are closed tagged unions validated at the mailbox boundary:
//! malformed payloads are logged and dropped, never panicked on. Delivery is
//! at-least-once (push and poll paths may both fire for one logical write),
//! so handlers must tolerate re-delivery of identical payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::TrackId;

/// Mailbox key carrying controller -> surface commands
pub const COMMAND_KEY: &str = "command";

/// Mailbox key carrying surface -> controller status reports
pub const STATUS_KEY: &str = "status";

/// Which execution context wrote a mailbox key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextId {
    Controller,
    Surface,
}

/// Action requested of the presentation surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum CommandAction {
    /// Begin playback of the command's track
    Play,
    /// Fade down and hold
    Pause { fade_ms: u64 },
    /// Fade back up and continue
    Resume { fade_ms: u64 },
    /// Fade to black; surface reports Ended when done
    FadeOutAndBlack,
}

/// Controller -> surface command message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceCommand {
    #[serde(flatten)]
    pub action: CommandAction,

    /// Target track, present for Play
    pub track_id: Option<TrackId>,

    /// Display title, present for Play
    pub title: Option<String>,

    /// Requested playback quality hint
    pub quality: Option<String>,

    /// When true the surface runs without real playback (credential/testing
    /// dialogs drive this)
    #[serde(default)]
    pub test_mode: bool,

    /// Issue time; makes repeated logical commands distinct under
    /// last-write-wins storage
    pub issued_at: DateTime<Utc>,
}

impl SurfaceCommand {
    /// Build a play command for a track
    pub fn play(track_id: TrackId, title: impl Into<String>) -> Self {
        Self {
            action: CommandAction::Play,
            track_id: Some(track_id),
            title: Some(title.into()),
            quality: None,
            test_mode: false,
            issued_at: Utc::now(),
        }
    }

    fn control(action: CommandAction) -> Self {
        Self {
            action,
            track_id: None,
            title: None,
            quality: None,
            test_mode: false,
            issued_at: Utc::now(),
        }
    }

    pub fn pause(fade_ms: u64) -> Self {
        Self::control(CommandAction::Pause { fade_ms })
    }

    pub fn resume(fade_ms: u64) -> Self {
        Self::control(CommandAction::Resume { fade_ms })
    }

    pub fn fade_out_and_black() -> Self {
        Self::control(CommandAction::FadeOutAndBlack)
    }
}

/// Playback state as reported by the presentation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceState {
    /// Surface is up and able to accept a play command
    Ready,
    /// The command's track is rendering; doubles as the heartbeat signal
    Playing,
    /// Playback finished normally
    Ended,
    /// Playback failed
    Error,
    /// The track cannot be rendered at all (region lock, takedown)
    Unavailable,
}

/// Surface -> controller status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceStatus {
    pub state: SurfaceState,

    /// Track the report refers to; the controller rejects reports whose
    /// track does not match the armed session
    pub track_id: Option<TrackId>,

    pub title: Option<String>,

    pub reported_at: DateTime<Utc>,
}

impl SurfaceStatus {
    pub fn new(state: SurfaceState, track_id: Option<TrackId>) -> Self {
        Self {
            state,
            track_id,
            title: None,
            reported_at: Utc::now(),
        }
    }
}

/// Decode a command payload read off the mailbox
///
/// Malformed payloads are logged and dropped rather than surfaced as errors;
/// a bad write from the other context must never take this context down.
pub fn decode_command(raw: &str) -> Option<SurfaceCommand> {
    match serde_json::from_str(raw) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!(error = %e, "Dropping malformed command payload");
            None
        }
    }
}

/// Decode a status payload read off the mailbox (same policy as commands)
pub fn decode_status(raw: &str) -> Option<SurfaceStatus> {
    match serde_json::from_str(raw) {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(error = %e, "Dropping malformed status payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let cmd = SurfaceCommand::play(TrackId::new("abc"), "Song");
        let json = serde_json::to_string(&cmd).unwrap();
        let decoded = decode_command(&json).unwrap();
        assert_eq!(decoded.action, CommandAction::Play);
        assert_eq!(decoded.track_id, Some(TrackId::new("abc")));
    }

    #[test]
    fn test_command_action_tagging() {
        let json = serde_json::to_string(&SurfaceCommand::pause(800)).unwrap();
        assert!(json.contains("\"action\":\"pause\""));
        assert!(json.contains("\"fade_ms\":800"));
    }

    #[test]
    fn test_status_state_lowercase() {
        let status = SurfaceStatus::new(SurfaceState::Playing, Some(TrackId::new("x")));
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"playing\""));
    }

    #[test]
    fn test_malformed_payloads_dropped() {
        assert!(decode_command("not json").is_none());
        assert!(decode_status("{\"state\":\"exploded\"}").is_none());
        // A status blob is not a valid command
        let status = SurfaceStatus::new(SurfaceState::Ended, None);
        let json = serde_json::to_string(&status).unwrap();
        assert!(decode_command(&json).is_none());
    }
}
