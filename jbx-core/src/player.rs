//! Player lifecycle controller
//!
//! Owns the state machine for the current play session. Issues commands to
//! the presentation surface over the sync channel, classifies its status
//! reports, and guarantees forward progress with heartbeat deadlines: a
//! session that stops reporting is forced through the same "ended" path as a
//! normal completion instead of hanging forever.
//!
//! One session is active at a time. Status reports whose track does not
//! match the armed session are discarded; a play command for a different
//! track implicitly supersedes the old session. Timeouts are the only
//! cancellation primitive.

use async_trait::async_trait;
use chrono::Utc;
use jbx_common::config::JbxConfig;
use jbx_common::events::{EventBus, JbxEvent};
use jbx_common::mailbox::{SurfaceCommand, SurfaceState, SurfaceStatus};
use jbx_common::model::{Track, TrackId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::{PlaySource, QueueManager};
use crate::sync::Mailbox;

/// Lifecycle states for a play session
///
/// Idle is both the initial and the terminal-per-track state; the controller
/// loops across tracks forever until explicit shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Initializing,
    Ready,
    Playing,
    Paused,
    Ending,
    Error,
    Recovering,
}

/// The one active play session
#[derive(Debug, Clone)]
pub struct PlaySession {
    pub track: Track,
    pub source: PlaySource,
    pub state: PlayerState,
    pub started_at: Instant,
    pub last_heartbeat_at: Instant,
    pub retry_count: u32,
    /// Armed deadline, None while Paused
    deadline: Option<Instant>,
}

/// Requests creation of the presentation surface (window, renderer)
///
/// The real implementation lives with the rendering collaborator; the
/// controller only needs a bounded yes/no.
#[async_trait]
pub trait SurfaceLauncher: Send + Sync {
    async fn launch(&self) -> std::result::Result<(), String>;
}

/// Launcher for tests and the bring-up harness; always succeeds
pub struct NoopLauncher;

#[async_trait]
impl SurfaceLauncher for NoopLauncher {
    async fn launch(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Drives play sessions and reacts to surface status reports
pub struct PlayerController {
    mailbox: Mailbox,
    events: Arc<EventBus>,
    launcher: Box<dyn SurfaceLauncher>,
    heartbeat_timeout: Duration,
    error_grace: Duration,
    dedup_window: Duration,
    surface_create_attempts: u32,
    surface_ready: bool,
    session: Option<PlaySession>,
    /// Track and issue time of the most recent play command, for redundant
    /// trigger suppression; cleared on confirmed completion
    last_play_cmd: Option<(TrackId, Instant)>,
}

impl PlayerController {
    pub fn new(
        mailbox: Mailbox,
        events: Arc<EventBus>,
        launcher: Box<dyn SurfaceLauncher>,
        config: &JbxConfig,
    ) -> Self {
        Self {
            mailbox,
            events,
            launcher,
            heartbeat_timeout: config.heartbeat_timeout(),
            error_grace: config.error_grace(),
            dedup_window: config.play_dedup_window(),
            surface_create_attempts: config.surface_create_attempts,
            surface_ready: false,
            session: None,
            last_play_cmd: None,
        }
    }

    /// Current lifecycle state (Idle when no session is armed)
    pub fn state(&self) -> PlayerState {
        self.session.as_ref().map(|s| s.state).unwrap_or(PlayerState::Idle)
    }

    pub fn session(&self) -> Option<&PlaySession> {
        self.session.as_ref()
    }

    /// Request surface creation, bounded
    ///
    /// A surface that cannot be created is a fatal configuration error, not
    /// something to loop on forever.
    async fn ensure_surface(&mut self) -> Result<()> {
        if self.surface_ready {
            return Ok(());
        }

        for attempt in 1..=self.surface_create_attempts {
            match self.launcher.launch().await {
                Ok(()) => {
                    info!(attempt, "Presentation surface created");
                    self.surface_ready = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Presentation surface creation failed");
                }
            }
        }

        Err(Error::SurfaceUnavailable {
            attempts: self.surface_create_attempts,
        })
    }

    /// Pull the next pending track from the queue and start playing it
    ///
    /// No-op when a session for the same track is already armed, or when the
    /// same track was commanded within the dedup window (redundant trigger).
    /// A pending track different from the armed session supersedes it: the
    /// old session state is discarded without touching the queue.
    pub async fn start_next(
        &mut self,
        queue: &mut QueueManager,
        now: Instant,
    ) -> Result<Option<TrackId>> {
        let Some(pending) = queue.peek_next() else {
            debug!("Nothing to play; staying idle");
            return Ok(None);
        };

        if let Some(session) = &self.session {
            if session.track.id == pending.track.id {
                debug!(track = %pending.track.id, "Session already armed for this track");
                return Ok(None);
            }
            info!(
                old = %session.track.id,
                new = %pending.track.id,
                "New play supersedes armed session"
            );
            self.session = None;
        }

        if let Some((last_id, issued_at)) = &self.last_play_cmd {
            if *last_id == pending.track.id
                && now.duration_since(*issued_at) < self.dedup_window
            {
                warn!(track = %last_id, "Suppressing duplicate play command inside dedup window");
                return Ok(None);
            }
        }

        self.ensure_surface().await?;

        let command = SurfaceCommand::play(pending.track.id.clone(), pending.track.display_title());
        self.mailbox.post_command(&command)?;

        self.session = Some(PlaySession {
            track: pending.track.clone(),
            source: pending.source,
            state: PlayerState::Initializing,
            started_at: now,
            last_heartbeat_at: now,
            retry_count: 0,
            deadline: Some(now + self.heartbeat_timeout),
        });
        self.last_play_cmd = Some((pending.track.id.clone(), now));

        let entry_id = match pending.source {
            PlaySource::Priority { entry_id } => Some(entry_id),
            PlaySource::Playlist { .. } => None,
        };
        info!(track = %pending.track.id, ?entry_id, "Play session armed");
        self.events.emit_lossy(JbxEvent::TrackStarted {
            track_id: pending.track.id.clone(),
            entry_id,
            timestamp: Utc::now(),
        });

        Ok(Some(pending.track.id))
    }

    /// Classify a status report from the surface
    ///
    /// Reports for a track other than the armed session's are stale and
    /// ignored; cross-context latency is bounded only by the poll interval,
    /// so track matching is the ordering guarantee.
    pub async fn handle_status(
        &mut self,
        queue: &mut QueueManager,
        status: SurfaceStatus,
        now: Instant,
    ) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            debug!(state = ?status.state, "Status with no armed session; ignoring");
            return Ok(());
        };

        if status.track_id.as_ref() != Some(&session.track.id) {
            debug!(
                reported = ?status.track_id,
                armed = %session.track.id,
                "Status for stale track; ignoring"
            );
            return Ok(());
        }

        match status.state {
            SurfaceState::Ready => {
                if session.state == PlayerState::Initializing {
                    session.state = PlayerState::Ready;
                }
                session.last_heartbeat_at = now;
            }
            SurfaceState::Playing => {
                if session.state != PlayerState::Paused {
                    session.state = PlayerState::Playing;
                }
                session.last_heartbeat_at = now;
                session.deadline = Some(now + self.heartbeat_timeout);
            }
            SurfaceState::Ended => {
                info!(track = %session.track.id, "Playback ended normally");
                self.finish(queue, true).await?;
            }
            SurfaceState::Error | SurfaceState::Unavailable => {
                // Error recovery gets slightly more grace than the heartbeat
                // before the forced advance
                warn!(track = %session.track.id, state = ?status.state, "Surface reported failure");
                session.state = PlayerState::Error;
                session.retry_count += 1;
                session.deadline = Some(now + self.error_grace);
            }
        }

        Ok(())
    }

    /// Check armed deadlines; called on a fixed tick by the session loop
    ///
    /// A heartbeat timeout forces exactly one auto-advance even if the tick
    /// fires repeatedly before state changes: finishing consumes the session.
    pub async fn check_deadlines(&mut self, queue: &mut QueueManager, now: Instant) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(deadline) = session.deadline else {
            return Ok(());
        };
        if now < deadline {
            return Ok(());
        }

        match session.state {
            PlayerState::Initializing | PlayerState::Ready | PlayerState::Playing => {
                warn!(
                    track = %session.track.id,
                    since_heartbeat_ms = now.duration_since(session.last_heartbeat_at).as_millis() as u64,
                    "Heartbeat deadline elapsed; recovering"
                );
                session.state = PlayerState::Recovering;
                self.events.emit_lossy(JbxEvent::PlaybackStalled {
                    track_id: session.track.id.clone(),
                    timestamp: Utc::now(),
                });
                self.finish(queue, false).await?;
            }
            PlayerState::Error => {
                let track_id = session.track.id.clone();
                warn!(track = %track_id, "Error grace elapsed; skipping track");
                self.events.emit_lossy(JbxEvent::PlaybackErrorSkipped {
                    track_id,
                    timestamp: Utc::now(),
                });
                self.finish(queue, false).await?;
            }
            PlayerState::Ending | PlayerState::Recovering => {
                // Terminal transition already in flight
                self.finish(queue, false).await?;
            }
            PlayerState::Idle | PlayerState::Paused => {}
        }

        Ok(())
    }

    /// Complete the armed session and advance the queue
    ///
    /// Exactly one queue confirmation per session. The controller re-enters
    /// Initializing for the next pending track immediately (auto-advance).
    async fn finish(&mut self, queue: &mut QueueManager, completed: bool) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.state = PlayerState::Ending;

        queue.confirm_completed(session.source);
        self.events.emit_lossy(JbxEvent::TrackCompleted {
            track_id: session.track.id.clone(),
            completed,
            timestamp: Utc::now(),
        });
        if completed {
            self.last_play_cmd = None;
        }
        self.events.emit_lossy(JbxEvent::QueueChanged {
            priority_len: queue.priority_len(),
            playlist_len: queue.playlist().len(),
            timestamp: Utc::now(),
        });

        // Idle, then straight back into Initializing for the next track
        let now = Instant::now();
        self.start_next(queue, now).await?;
        Ok(())
    }

    /// Admin pause; does not affect the queue
    pub fn pause(&mut self, fade_ms: u64) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::InvalidState("Pause with no armed session".into()));
        };
        if session.state != PlayerState::Playing {
            return Err(Error::InvalidState(format!(
                "Pause from {:?}",
                session.state
            )));
        }
        self.mailbox.post_command(&SurfaceCommand::pause(fade_ms))?;
        session.state = PlayerState::Paused;
        session.deadline = None;
        info!(track = %session.track.id, "Paused");
        Ok(())
    }

    /// Admin resume; re-arms the heartbeat deadline
    pub fn resume(&mut self, fade_ms: u64, now: Instant) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::InvalidState("Resume with no armed session".into()));
        };
        if session.state != PlayerState::Paused {
            return Err(Error::InvalidState(format!(
                "Resume from {:?}",
                session.state
            )));
        }
        self.mailbox.post_command(&SurfaceCommand::resume(fade_ms))?;
        session.state = PlayerState::Playing;
        session.last_heartbeat_at = now;
        session.deadline = Some(now + self.heartbeat_timeout);
        info!(track = %session.track.id, "Resumed");
        Ok(())
    }

    /// Admin skip: fade to black and let the surface report Ended
    ///
    /// The error grace deadline backstops a surface that never reports.
    pub fn skip(&mut self, now: Instant) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::InvalidState("Skip with no armed session".into()));
        };
        self.mailbox.post_command(&SurfaceCommand::fade_out_and_black())?;
        session.deadline = Some(now + self.error_grace);
        info!(track = %session.track.id, "Skip requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MailboxStore, MemoryStore};
    use jbx_common::config::DuplicatePolicy;
    use jbx_common::mailbox::{decode_command, CommandAction, COMMAND_KEY};

    struct FailingLauncher;

    #[async_trait]
    impl SurfaceLauncher for FailingLauncher {
        async fn launch(&self) -> std::result::Result<(), String> {
            Err("no display".into())
        }
    }

    fn track(id: &str) -> Track {
        Track::new(id, format!("Title {}", id), "Test Channel")
    }

    fn status(state: SurfaceState, id: &str) -> SurfaceStatus {
        SurfaceStatus::new(state, Some(TrackId::new(id)))
    }

    fn fixture() -> (PlayerController, QueueManager, Arc<dyn MailboxStore>) {
        let store: Arc<dyn MailboxStore> = Arc::new(MemoryStore::new());
        let config = JbxConfig::default();
        let mailbox = Mailbox::controller(Arc::clone(&store), config.poll_interval());
        let controller = PlayerController::new(
            mailbox,
            Arc::new(EventBus::new(16)),
            Box::new(NoopLauncher),
            &config,
        );
        let queue = QueueManager::new(DuplicatePolicy::Allow);
        (controller, queue, store)
    }

    fn posted_command(store: &Arc<dyn MailboxStore>) -> Option<SurfaceCommand> {
        store.read(COMMAND_KEY).and_then(|raw| decode_command(&raw))
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_arms_initializing_session() {
        let (mut controller, mut queue, store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();

        let started = controller.start_next(&mut queue, Instant::now()).await.unwrap();
        assert_eq!(started, Some(TrackId::new("a")));
        assert_eq!(controller.state(), PlayerState::Initializing);

        let cmd = posted_command(&store).unwrap();
        assert_eq!(cmd.action, CommandAction::Play);
        assert_eq!(cmd.track_id, Some(TrackId::new("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_playing_status_reaches_playing() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        controller.start_next(&mut queue, Instant::now()).await.unwrap();

        controller
            .handle_status(&mut queue, status(SurfaceState::Ready, "a"), Instant::now())
            .await
            .unwrap();
        assert_eq!(controller.state(), PlayerState::Ready);

        controller
            .handle_status(&mut queue, status(SurfaceState::Playing, "a"), Instant::now())
            .await
            .unwrap();
        assert_eq!(controller.state(), PlayerState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_track_status_ignored() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        controller.start_next(&mut queue, Instant::now()).await.unwrap();

        controller
            .handle_status(&mut queue, status(SurfaceState::Ended, "b"), Instant::now())
            .await
            .unwrap();

        // Session untouched, queue untouched
        assert_eq!(controller.state(), PlayerState::Initializing);
        assert_eq!(queue.priority_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_confirms_completion_and_advances() {
        let (mut controller, mut queue, store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        queue.enqueue_priority(track("b")).unwrap();
        controller.start_next(&mut queue, Instant::now()).await.unwrap();

        controller
            .handle_status(&mut queue, status(SurfaceState::Ended, "a"), Instant::now())
            .await
            .unwrap();

        // "a" removed, auto-advance armed "b"
        assert_eq!(queue.priority_len(), 1);
        assert_eq!(controller.state(), PlayerState::Initializing);
        let cmd = posted_command(&store).unwrap();
        assert_eq!(cmd.track_id, Some(TrackId::new("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_forces_single_advance() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();

        // Before the deadline nothing happens
        controller
            .check_deadlines(&mut queue, start + Duration::from_secs(9))
            .await
            .unwrap();
        assert_eq!(queue.priority_len(), 1);

        // Deadline elapses with no matching status
        let late = start + Duration::from_secs(10);
        controller.check_deadlines(&mut queue, late).await.unwrap();
        assert_eq!(queue.priority_len(), 0);

        // Repeated fires must not advance the (now empty) queue again
        controller
            .check_deadlines(&mut queue, late + Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(controller.state(), PlayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_heartbeat_refreshes_deadline() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();

        let mid = start + Duration::from_secs(8);
        controller
            .handle_status(&mut queue, status(SurfaceState::Playing, "a"), mid)
            .await
            .unwrap();

        // Past the original deadline but inside the refreshed one
        controller
            .check_deadlines(&mut queue, start + Duration::from_secs(12))
            .await
            .unwrap();
        assert_eq!(controller.state(), PlayerState::Playing);
        assert_eq!(queue.priority_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_gets_longer_grace_then_skips() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();

        let err_at = start + Duration::from_secs(2);
        controller
            .handle_status(&mut queue, status(SurfaceState::Error, "a"), err_at)
            .await
            .unwrap();
        assert_eq!(controller.state(), PlayerState::Error);

        // 10s after the error: inside the 11s grace
        controller
            .check_deadlines(&mut queue, err_at + Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(queue.priority_len(), 1);

        // Grace elapsed: forced advance
        controller
            .check_deadlines(&mut queue, err_at + Duration::from_secs(11))
            .await
            .unwrap();
        assert_eq!(queue.priority_len(), 0);
        assert_eq!(controller.state(), PlayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_do_not_touch_queue() {
        let (mut controller, mut queue, store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();
        controller
            .handle_status(&mut queue, status(SurfaceState::Playing, "a"), start)
            .await
            .unwrap();

        controller.pause(800).unwrap();
        assert_eq!(controller.state(), PlayerState::Paused);
        assert_eq!(
            posted_command(&store).unwrap().action,
            CommandAction::Pause { fade_ms: 800 }
        );

        // No deadline while paused, however long it sits
        controller
            .check_deadlines(&mut queue, start + Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(controller.state(), PlayerState::Paused);

        controller.resume(800, start + Duration::from_secs(3600)).unwrap();
        assert_eq!(controller.state(), PlayerState::Playing);
        assert_eq!(queue.priority_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_posts_fade_and_ended_advances() {
        let (mut controller, mut queue, store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        queue.enqueue_priority(track("b")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();
        controller
            .handle_status(&mut queue, status(SurfaceState::Playing, "a"), start)
            .await
            .unwrap();

        controller.skip(start).unwrap();
        assert_eq!(
            posted_command(&store).unwrap().action,
            CommandAction::FadeOutAndBlack
        );

        // The surface finishes the fade and reports Ended as usual
        controller
            .handle_status(&mut queue, status(SurfaceState::Ended, "a"), start + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(queue.priority_len(), 1);
        assert_eq!(
            controller.session().unwrap().track.id,
            TrackId::new("b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_backstop_advances_when_surface_never_reports() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        queue.enqueue_priority(track("b")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();
        controller
            .handle_status(&mut queue, status(SurfaceState::Playing, "a"), start)
            .await
            .unwrap();

        controller.skip(start).unwrap();

        // Inside the grace window the queue is untouched
        controller
            .check_deadlines(&mut queue, start + Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(queue.priority_len(), 2);

        // No Ended ever arrives; the grace deadline forces the advance
        controller
            .check_deadlines(&mut queue, start + Duration::from_secs(11))
            .await
            .unwrap();
        assert_eq!(queue.priority_len(), 1);
        assert_eq!(
            controller.session().unwrap().track.id,
            TrackId::new("b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_play_suppressed_inside_window() {
        let (mut controller, mut queue, _store) = fixture();
        queue.enqueue_priority(track("a")).unwrap();
        let start = Instant::now();
        controller.start_next(&mut queue, start).await.unwrap();

        // Simulate the session being torn down by a stall 1s in, putting the
        // same track back at the head inside the dedup window
        controller.session = None;
        let retry = controller
            .start_next(&mut queue, start + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(retry, None);

        // Outside the window the command goes through
        let later = controller
            .start_next(&mut queue, start + Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(later, Some(TrackId::new("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_creation_failure_is_fatal() {
        let store: Arc<dyn MailboxStore> = Arc::new(MemoryStore::new());
        let config = JbxConfig::default();
        let mailbox = Mailbox::controller(Arc::clone(&store), config.poll_interval());
        let mut controller = PlayerController::new(
            mailbox,
            Arc::new(EventBus::new(16)),
            Box::new(FailingLauncher),
            &config,
        );
        let mut queue = QueueManager::new(DuplicatePolicy::Allow);
        queue.enqueue_priority(track("a")).unwrap();

        let err = controller
            .start_next(&mut queue, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SurfaceUnavailable { attempts: 3 }
        ));
        // The request is still pending; nothing was silently dropped
        assert_eq!(queue.priority_len(), 1);
    }
}
