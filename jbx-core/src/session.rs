//! Controller session loop
//!
//! Glues the subsystems together: pulls status reports off the sync channel,
//! ticks the lifecycle deadlines, applies emergency playlist injections, and
//! persists queue state for resume. All queue and player mutation funnels
//! through this loop, one event at a time.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use jbx_common::config::JbxConfig;
use jbx_common::events::{EventBus, JbxEvent};
use jbx_common::model::Track;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogLoader;
use crate::credentials::CredentialRotation;
use crate::error::Result;
use crate::player::PlayerController;
use crate::queue::{QueueManager, QueueSnapshot};
use crate::sync::{EmergencyFeed, Inbound, Mailbox};

const SNAPSHOT_FILE: &str = "resume.json";

/// Interval for the deadline check tick
const TICK: std::time::Duration = std::time::Duration::from_secs(1);

/// The controller context's main loop and its owned state
pub struct Session {
    queue: QueueManager,
    player: PlayerController,
    loader: CatalogLoader,
    rotation: CredentialRotation,
    events: Arc<EventBus>,
    emergency: EmergencyFeed,
    inbound: tokio::sync::mpsc::Receiver<Inbound>,
    data_dir: PathBuf,
    playlist_id: String,
    /// Rotation events already surfaced on the bus
    emitted_rotation_events: usize,
    /// Set when the credential pool is exhausted and playback cannot be
    /// sustained; cleared by a successful load or an emergency injection
    degraded: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox: Mailbox,
        loader: CatalogLoader,
        rotation: CredentialRotation,
        events: Arc<EventBus>,
        emergency: EmergencyFeed,
        launcher: Box<dyn crate::player::SurfaceLauncher>,
        config: &JbxConfig,
        data_dir: PathBuf,
        playlist_id: String,
    ) -> Self {
        let inbound = mailbox.spawn_receiver();
        let player = PlayerController::new(mailbox, Arc::clone(&events), launcher, config);
        Self {
            queue: QueueManager::new(config.duplicate_policy),
            player,
            loader,
            rotation,
            events,
            emergency,
            inbound,
            data_dir,
            playlist_id,
            emitted_rotation_events: 0,
            degraded: false,
        }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn player(&self) -> &PlayerController {
        &self.player
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Restore persisted queue state, load the catalog, and arm the first
    /// play session
    pub async fn startup(&mut self) -> Result<()> {
        let resume_cursor = match self.load_snapshot().await {
            Some(snapshot) => {
                let cursor = (!snapshot.playlist.is_empty()).then(|| snapshot.playlist.cursor());
                info!(
                    priority = snapshot.priority.len(),
                    playlist = snapshot.playlist.len(),
                    "Restored queue state from resume snapshot"
                );
                self.queue.restore(snapshot);
                cursor
            }
            None => None,
        };

        self.reload_catalog(resume_cursor).await;

        if self.queue.playlist().is_empty() && self.queue.priority_len() == 0 {
            warn!("Startup finished with nothing to play");
        }
        self.player.start_next(&mut self.queue, Instant::now()).await?;
        self.save_snapshot().await;
        Ok(())
    }

    /// Run the fallback chain and install the result as the default playlist
    async fn reload_catalog(&mut self, resume_cursor: Option<usize>) {
        let playlist_id = self.playlist_id.clone();
        let outcome = self
            .loader
            .load(&playlist_id, &mut self.rotation, Utc::now())
            .await;
        self.emit_new_rotation_events();

        if outcome.pool_exhausted {
            self.events.emit_lossy(JbxEvent::CredentialPoolExhausted {
                timestamp: Utc::now(),
            });
        }

        match outcome.failure {
            None => {
                let provider = outcome
                    .provider
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                self.events.emit_lossy(JbxEvent::CatalogLoaded {
                    playlist_id,
                    track_count: outcome.tracks.len(),
                    provider,
                    timestamp: Utc::now(),
                });
                self.queue
                    .replace_default_playlist(outcome.tracks, resume_cursor);
                // Fresh load with no resume position gets a fresh order
                if resume_cursor.is_none() {
                    let mut rng = StdRng::from_entropy();
                    let playing = self.player.session().map(|s| s.track.id.clone());
                    self.queue.reshuffle_default(&mut rng, playing.as_ref());
                }
                self.degraded = false;
            }
            Some(failure) => {
                error!(playlist = %playlist_id, reason = %failure.reason, "Catalog load failed");
                self.events.emit_lossy(JbxEvent::CatalogFailed {
                    playlist_id,
                    reason: failure.reason,
                    timestamp: Utc::now(),
                });
                if outcome.pool_exhausted && self.queue.is_empty() {
                    warn!("Credential pool exhausted with an empty queue; degraded");
                    self.degraded = true;
                }
            }
        }
        self.emit_queue_changed();
    }

    /// Enqueue a user request and arm it if nothing is playing
    ///
    /// A request never interrupts the current track; it waits at the head of
    /// the priority queue for the next advance.
    pub async fn request_track(&mut self, track: Track) -> Result<Uuid> {
        let entry_id = self.queue.enqueue_priority(track)?;
        self.emit_queue_changed();
        if self.player.session().is_none() {
            self.player.start_next(&mut self.queue, Instant::now()).await?;
        }
        self.save_snapshot().await;
        Ok(entry_id)
    }

    pub fn pause(&mut self, fade_ms: u64) -> Result<()> {
        self.player.pause(fade_ms)
    }

    pub fn resume(&mut self, fade_ms: u64) -> Result<()> {
        self.player.resume(fade_ms, Instant::now())
    }

    pub fn skip(&mut self) -> Result<()> {
        self.player.skip(Instant::now())
    }

    /// Process one inbound sync-channel message
    ///
    /// The snapshot is saved only when the queue actually moved; heartbeat
    /// statuses arrive every few seconds and must not each cost a disk write.
    pub async fn handle_inbound(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Status(status) => {
                let before = (self.queue.priority_len(), self.queue.playlist().cursor());
                self.player
                    .handle_status(&mut self.queue, status, Instant::now())
                    .await?;
                if before != (self.queue.priority_len(), self.queue.playlist().cursor()) {
                    self.save_snapshot().await;
                }
            }
            Inbound::Command(cmd) => {
                // The controller never receives commands; a misrouted write
                debug!(?cmd.action, "Command on the controller side; ignoring");
            }
        }
        Ok(())
    }

    /// One deadline tick
    ///
    /// Also re-arms playback whenever the controller sits idle with pending
    /// work, so a suppressed or dropped play command delays the queue by at
    /// most one tick instead of stranding it.
    pub async fn tick(&mut self) -> Result<()> {
        let before = (self.queue.priority_len(), self.queue.playlist().cursor());
        self.player
            .check_deadlines(&mut self.queue, Instant::now())
            .await?;
        if self.player.session().is_none() && !self.queue.is_empty() {
            self.player.start_next(&mut self.queue, Instant::now()).await?;
        }
        if before != (self.queue.priority_len(), self.queue.playlist().cursor()) {
            self.save_snapshot().await;
        }
        Ok(())
    }

    /// Install an emergency playlist and resume playback
    pub async fn apply_emergency(&mut self, tracks: Vec<Track>) -> Result<()> {
        info!(count = tracks.len(), "Emergency playlist injected");
        self.events.emit_lossy(JbxEvent::EmergencyPlaylistInjected {
            tracks: tracks.clone(),
            timestamp: Utc::now(),
        });
        self.queue.replace_default_playlist(tracks, None);
        self.degraded = false;
        self.emit_queue_changed();
        if self.player.session().is_none() {
            self.player.start_next(&mut self.queue, Instant::now()).await?;
        }
        self.save_snapshot().await;
        Ok(())
    }

    /// Drive the session until `shutdown` flips to true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = time::interval(TICK);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut emergency_rx = self.emergency.subscribe();

        loop {
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound).await?,
                    None => {
                        warn!("Sync channel closed; shutting down");
                        break;
                    }
                },
                _ = ticker.tick() => self.tick().await?,
                injected = emergency_rx.recv() => match injected {
                    Ok(tracks) => self.apply_emergency(tracks).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Emergency feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
        }

        self.save_snapshot().await;
        Ok(())
    }

    fn emit_queue_changed(&self) {
        self.events.emit_lossy(JbxEvent::QueueChanged {
            priority_len: self.queue.priority_len(),
            playlist_len: self.queue.playlist().len(),
            timestamp: Utc::now(),
        });
    }

    /// Surface rotation events recorded since the last call
    fn emit_new_rotation_events(&mut self) {
        let events: Vec<_> = self
            .rotation
            .recent_events()
            .skip(self.emitted_rotation_events)
            .cloned()
            .collect();
        self.emitted_rotation_events += events.len();
        for event in events {
            self.events.emit_lossy(JbxEvent::CredentialRotated {
                from_credential: event.from_credential,
                to_credential: event.to_credential,
                reason: event.reason,
                timestamp: event.timestamp,
            });
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    /// Best-effort persistence; a failed save must never stop playback.
    /// All I/O goes through tokio::fs so the session task never blocks.
    async fn save_snapshot(&self) {
        let path = self.snapshot_path();
        let snapshot = self.queue.snapshot();
        let result = async {
            let json = serde_json::to_vec_pretty(&snapshot)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            tokio::fs::create_dir_all(&self.data_dir).await?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to save resume snapshot");
        }
    }

    async fn load_snapshot(&self) -> Option<QueueSnapshot> {
        let path = self.snapshot_path();
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Resume snapshot unreadable; starting fresh");
                None
            }
        }
    }
}
