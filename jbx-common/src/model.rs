//! Core data model for the jukebox kiosk
//!
//! Tracks are immutable once fetched. Queue entries wrap a track with its
//! request metadata and live until the lifecycle controller confirms that
//! exact entry finished playing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque track identifier as issued by the content providers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A playable track as returned by the catalog loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Provider-issued track identifier
    pub id: TrackId,

    /// Raw title as fetched (may carry "(Official Video)" style annotations)
    pub title: String,

    /// Channel / uploader name
    pub channel_title: String,

    /// Duration in whole minutes, when the provider reports one
    pub duration_minutes: Option<u32>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(id),
            title: title.into(),
            channel_title: channel.into(),
            duration_minutes: None,
        }
    }

    /// Title with parenthetical and bracketed annotations stripped,
    /// for display and matching ("Song (Official Video) [HD]" -> "Song")
    pub fn display_title(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Strip parenthetical/bracketed annotations and collapse leftover whitespace
pub fn normalize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut paren_depth = 0usize;
    let mut bracket_depth = 0usize;

    for ch in raw.chars() {
        match ch {
            '(' => paren_depth += 1,
            ')' => paren_depth = paren_depth.saturating_sub(1),
            '[' => bracket_depth += 1,
            ']' => bracket_depth = bracket_depth.saturating_sub(1),
            _ if paren_depth == 0 && bracket_depth == 0 => out.push(ch),
            _ => {}
        }
    }

    let collapsed: Vec<&str> = out.split_whitespace().collect();
    collapsed.join(" ")
}

/// A user-requested (priority) queue entry
///
/// Created when a user confirms a search selection; destroyed only when the
/// lifecycle controller confirms that this exact entry finished playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique per-request id (duplicate track ids are permitted)
    pub entry_id: Uuid,

    /// The requested track
    pub track: Track,

    /// When the user confirmed the request
    pub requested_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(track: Track) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            track,
            requested_at: Utc::now(),
        }
    }
}

/// Quota-tracked API credential
///
/// Mutated only by the credential rotation service; callers never touch the
/// quota fields directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Credential identifier (the key string itself, or an alias for it)
    pub id: String,

    /// Tracked quota consumption, 0.0..=100.0
    pub quota_used_percent: f32,

    /// When set, the credential is excluded from rotation until this instant
    pub exhausted_until: Option<DateTime<Utc>>,

    /// Last successful validation probe
    pub last_validated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            quota_used_percent: 0.0,
            exhausted_until: None,
            last_validated_at: None,
        }
    }

    /// Whether the credential is inside its exhaustion cooldown at `now`
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.exhausted_until.is_some_and(|until| now < until)
    }
}

/// Why a credential rotation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// Soft quota threshold crossed; rotated proactively before a failure
    ThresholdExceeded,
    /// Provider reported the credential's quota as spent
    Exhausted,
    /// Validation probe rejected the credential
    Invalid,
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationReason::ThresholdExceeded => f.write_str("threshold exceeded"),
            RotationReason::Exhausted => f.write_str("exhausted"),
            RotationReason::Invalid => f.write_str("invalid"),
        }
    }
}

/// Append-only rotation log entry, capped for display purposes only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub timestamp: DateTime<Utc>,
    pub from_credential: Option<String>,
    pub to_credential: Option<String>,
    pub reason: RotationReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_title_strips_parentheticals() {
        let track = Track::new("abc", "My Song (Official Video)", "Channel");
        assert_eq!(track.display_title(), "My Song");
    }

    #[test]
    fn test_display_title_strips_brackets_and_nesting() {
        assert_eq!(normalize_title("Tune [HD] (Live (2019))"), "Tune");
        assert_eq!(normalize_title("Plain Title"), "Plain Title");
    }

    #[test]
    fn test_display_title_collapses_whitespace() {
        assert_eq!(normalize_title("A (x) B [y] C"), "A B C");
    }

    #[test]
    fn test_unbalanced_annotations_do_not_panic() {
        assert_eq!(normalize_title("Oops) fine (trailing"), "Oops) fine");
    }

    #[test]
    fn test_credential_cooldown_window() {
        let mut record = CredentialRecord::new("key-1");
        let now = Utc::now();
        assert!(!record.in_cooldown(now));

        record.exhausted_until = Some(now + chrono::Duration::hours(1));
        assert!(record.in_cooldown(now));
        assert!(!record.in_cooldown(now + chrono::Duration::hours(2)));
    }
}
