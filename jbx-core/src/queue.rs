//! Playback queue model
//!
//! Two structures decide "what plays next": the FIFO priority queue of user
//! requests and the circular default playlist. The priority queue always wins
//! when both are non-empty.
//!
//! Completion semantics: a priority entry is removed if and only if the
//! lifecycle controller confirms that exact entry finished (normally or via
//! terminal error), never on mere dequeue-to-play. A default-playlist
//! completion advances the cursor instead. Never both in one call.

use jbx_common::config::DuplicatePolicy;
use jbx_common::model::{QueueEntry, Track, TrackId};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Where a pending track came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaySource {
    /// Head of the priority queue
    Priority { entry_id: Uuid },
    /// Default playlist at the given cursor position
    Playlist { index: usize },
}

/// The track the controller should play next, with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPlay {
    pub track: Track,
    pub source: PlaySource,
}

/// Circular operator-curated track list with a cursor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultPlaylist {
    tracks: Vec<Track>,
    cursor: usize,
}

impl DefaultPlaylist {
    /// Track under the cursor, if any
    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Advance the cursor one position, wrapping modulo length
    fn advance(&mut self) {
        if !self.tracks.is_empty() {
            self.cursor = (self.cursor + 1) % self.tracks.len();
        }
    }
}

/// Serializable queue state for session resume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub priority: Vec<QueueEntry>,
    pub playlist: DefaultPlaylist,
}

/// Owns the priority queue and the default playlist
///
/// Mutated only from the lifecycle controller's transition handlers; the
/// controller processes one transition at a time, so no concurrent mutation
/// path exists.
pub struct QueueManager {
    priority: VecDeque<QueueEntry>,
    playlist: DefaultPlaylist,
    duplicate_policy: DuplicatePolicy,
}

impl QueueManager {
    pub fn new(duplicate_policy: DuplicatePolicy) -> Self {
        Self {
            priority: VecDeque::new(),
            playlist: DefaultPlaylist::default(),
            duplicate_policy,
        }
    }

    /// What plays next: priority head if non-empty, else the playlist track
    /// under the cursor, else nothing
    pub fn peek_next(&self) -> Option<PendingPlay> {
        if let Some(entry) = self.priority.front() {
            return Some(PendingPlay {
                track: entry.track.clone(),
                source: PlaySource::Priority {
                    entry_id: entry.entry_id,
                },
            });
        }

        self.playlist.current().map(|track| PendingPlay {
            track: track.clone(),
            source: PlaySource::Playlist {
                index: self.playlist.cursor,
            },
        })
    }

    /// Confirm that the track played from `source` finished
    ///
    /// Priority completions remove the head entry (when it still matches);
    /// playlist completions advance the cursor. Never both.
    pub fn confirm_completed(&mut self, source: PlaySource) {
        match source {
            PlaySource::Priority { entry_id } => {
                match self.priority.front() {
                    Some(head) if head.entry_id == entry_id => {
                        let entry = self.priority.pop_front();
                        debug!(
                            entry_id = %entry_id,
                            track = ?entry.map(|e| e.track.id),
                            "Priority entry completed and removed"
                        );
                    }
                    _ => {
                        // The head changed underneath a late confirmation;
                        // removing anything now would drop a pending request
                        warn!(entry_id = %entry_id, "Completed entry is no longer the queue head; ignoring");
                    }
                }
            }
            PlaySource::Playlist { .. } => {
                self.playlist.advance();
                debug!(cursor = self.playlist.cursor, "Default playlist advanced");
            }
        }
    }

    /// Append a user request to the priority queue
    ///
    /// Under the reject policy, a track id already pending is refused;
    /// otherwise duplicates are accepted (a user may request the same song
    /// twice).
    pub fn enqueue_priority(&mut self, track: Track) -> Result<Uuid> {
        if self.duplicate_policy == DuplicatePolicy::Reject
            && self.priority.iter().any(|e| e.track.id == track.id)
        {
            return Err(Error::DuplicateRequest(track.id.to_string()));
        }

        let entry = QueueEntry::new(track);
        let entry_id = entry.entry_id;
        info!(entry_id = %entry_id, track = %entry.track.id, "Priority request enqueued");
        self.priority.push_back(entry);
        Ok(entry_id)
    }

    /// Fisher-Yates shuffle of the default playlist
    ///
    /// The currently-playing track (when given and present) is pinned to
    /// position 0 with the cursor reset to 1; otherwise the cursor resets
    /// to 0.
    pub fn reshuffle_default<R: Rng>(&mut self, rng: &mut R, now_playing: Option<&TrackId>) {
        if self.playlist.tracks.len() < 2 {
            self.playlist.cursor = 0;
            return;
        }

        let pinned = now_playing.and_then(|id| {
            self.playlist
                .tracks
                .iter()
                .position(|t| &t.id == id)
                .map(|pos| self.playlist.tracks.remove(pos))
        });

        self.playlist.tracks.shuffle(rng);

        if let Some(track) = pinned {
            self.playlist.tracks.insert(0, track);
            self.playlist.cursor = 1 % self.playlist.tracks.len();
        } else {
            self.playlist.cursor = 0;
        }
        debug!(len = self.playlist.tracks.len(), cursor = self.playlist.cursor, "Default playlist reshuffled");
    }

    /// Replace the default playlist with a freshly loaded catalog
    ///
    /// Cursor resets to 0 unless explicit resume state supplies a valid
    /// position.
    pub fn replace_default_playlist(&mut self, tracks: Vec<Track>, resume_cursor: Option<usize>) {
        let cursor = match resume_cursor {
            Some(c) if c < tracks.len() => c,
            _ => 0,
        };
        info!(len = tracks.len(), cursor, "Default playlist replaced");
        self.playlist = DefaultPlaylist { tracks, cursor };
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn playlist(&self) -> &DefaultPlaylist {
        &self.playlist
    }

    /// Pending priority entries, head first (display)
    pub fn priority_entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.priority.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.playlist.is_empty()
    }

    /// Capture queue state for session resume
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            priority: self.priority.iter().cloned().collect(),
            playlist: self.playlist.clone(),
        }
    }

    /// Restore queue state from a resume snapshot
    pub fn restore(&mut self, snapshot: QueueSnapshot) {
        let cursor_valid =
            snapshot.playlist.is_empty() || snapshot.playlist.cursor < snapshot.playlist.len();
        self.priority = snapshot.priority.into();
        self.playlist = snapshot.playlist;
        if !cursor_valid {
            warn!(cursor = self.playlist.cursor, "Resume cursor out of range; resetting");
            self.playlist.cursor = 0;
        }
    }
}
