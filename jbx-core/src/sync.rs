//! Cross-context sync channel
//!
//! The controller and presentation surface coordinate over a shared,
//! key-addressed, last-write-wins store. The store itself is an injected
//! trait so tests can run both contexts in-process without real timers.
//!
//! Two delivery paths feed one inbound queue per context:
//! 1. **Push**: a write notification from the store, filtered to writes made
//!    by the *other* context (a context does not observe its own writes via
//!    change notification).
//! 2. **Poll**: a fixed-interval re-read of the receive key, diffed against
//!    the last-seen raw value, to catch missed notifications.
//!
//! Delivery is at-least-once, order-preserved per sender. Handlers must
//! tolerate re-delivery of an identical payload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use jbx_common::mailbox::{
    decode_command, decode_status, ContextId, SurfaceCommand, SurfaceStatus, COMMAND_KEY,
    STATUS_KEY,
};
use jbx_common::model::Track;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Notification that a context wrote a mailbox key
#[derive(Debug, Clone)]
pub struct WriteNotice {
    pub writer: ContextId,
    pub key: String,
}

/// Injected key-value mailbox backing store
///
/// Last-write-wins per key; reads return the latest committed value.
pub trait MailboxStore: Send + Sync {
    /// Read the current value of a key
    fn read(&self, key: &str) -> Option<String>;

    /// Overwrite a key, recording which context wrote it
    fn write(&self, writer: ContextId, key: &str, value: String);

    /// Subscribe to write notifications
    fn subscribe(&self) -> broadcast::Receiver<WriteNotice>;
}

/// In-process store used by tests and the bring-up harness
pub struct MemoryStore {
    cells: RwLock<HashMap<String, String>>,
    notify: broadcast::Sender<WriteNotice>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            cells: RwLock::new(HashMap::new()),
            notify,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxStore for MemoryStore {
    fn read(&self, key: &str) -> Option<String> {
        self.cells.read().expect("mailbox lock poisoned").get(key).cloned()
    }

    fn write(&self, writer: ContextId, key: &str, value: String) {
        self.cells
            .write()
            .expect("mailbox lock poisoned")
            .insert(key.to_string(), value);
        // No receivers is fine; the poll path will pick the write up
        let _ = self.notify.send(WriteNotice {
            writer,
            key: key.to_string(),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<WriteNotice> {
        self.notify.subscribe()
    }
}

/// A message delivered to this context off the mailbox
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Controller -> surface (received by the surface context)
    Command(SurfaceCommand),
    /// Surface -> controller (received by the controller context)
    Status(SurfaceStatus),
}

/// One context's endpoint on the sync channel
pub struct Mailbox {
    store: Arc<dyn MailboxStore>,
    side: ContextId,
    poll_interval: Duration,
}

impl Mailbox {
    /// Controller endpoint: sends commands, receives status reports
    pub fn controller(store: Arc<dyn MailboxStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            side: ContextId::Controller,
            poll_interval,
        }
    }

    /// Surface endpoint: sends status reports, receives commands
    pub fn surface(store: Arc<dyn MailboxStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            side: ContextId::Surface,
            poll_interval,
        }
    }

    pub fn side(&self) -> ContextId {
        self.side
    }

    fn recv_key(&self) -> &'static str {
        match self.side {
            ContextId::Controller => STATUS_KEY,
            ContextId::Surface => COMMAND_KEY,
        }
    }

    /// Post a command (controller side only)
    pub fn post_command(&self, command: &SurfaceCommand) -> Result<()> {
        if self.side != ContextId::Controller {
            return Err(Error::Channel("Only the controller posts commands".into()));
        }
        let payload = serde_json::to_string(command).map_err(jbx_common::Error::from)?;
        trace!(key = COMMAND_KEY, %payload, "Posting command");
        self.store.write(self.side, COMMAND_KEY, payload);
        Ok(())
    }

    /// Post a status report (surface side only)
    pub fn post_status(&self, status: &SurfaceStatus) -> Result<()> {
        if self.side != ContextId::Surface {
            return Err(Error::Channel("Only the surface posts status".into()));
        }
        let payload = serde_json::to_string(status).map_err(jbx_common::Error::from)?;
        trace!(key = STATUS_KEY, %payload, "Posting status");
        self.store.write(self.side, STATUS_KEY, payload);
        Ok(())
    }

    /// Spawn the delivery task for this endpoint
    ///
    /// Messages arrive on the returned channel from both the push and poll
    /// paths. The task exits when the receiver is dropped.
    pub fn spawn_receiver(&self) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(32);
        let store = Arc::clone(&self.store);
        let side = self.side;
        let key = self.recv_key();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            deliver_loop(store, side, key, poll_interval, tx).await;
            debug!(?side, "Mailbox delivery task stopped");
        });

        rx
    }
}

/// Read the receive key and forward its value if it changed since last seen
///
/// Returns false when the inbound channel is closed.
async fn forward_if_changed(
    store: &Arc<dyn MailboxStore>,
    side: ContextId,
    key: &str,
    last_seen: &mut Option<String>,
    tx: &mpsc::Sender<Inbound>,
) -> bool {
    let Some(raw) = store.read(key) else {
        return true;
    };
    if last_seen.as_deref() == Some(raw.as_str()) {
        return true;
    }
    // Record even malformed payloads as seen so a bad write cannot spam logs
    // on every poll tick
    *last_seen = Some(raw.clone());

    let inbound = match side {
        ContextId::Controller => decode_status(&raw).map(Inbound::Status),
        ContextId::Surface => decode_command(&raw).map(Inbound::Command),
    };
    let Some(inbound) = inbound else {
        return true;
    };

    tx.send(inbound).await.is_ok()
}

async fn deliver_loop(
    store: Arc<dyn MailboxStore>,
    side: ContextId,
    key: &'static str,
    poll_interval: Duration,
    tx: mpsc::Sender<Inbound>,
) {
    let mut notices = store.subscribe();
    let mut poll = time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen: Option<String> = None;

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(n) if n.writer != side && n.key == key => {
                    if !forward_if_changed(&store, side, key, &mut last_seen, &tx).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(?side, missed, "Mailbox notifications lagged; re-reading");
                    if !forward_if_changed(&store, side, key, &mut last_seen, &tx).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = poll.tick() => {
                if !forward_if_changed(&store, side, key, &mut last_seen, &tx).await {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
}

/// Emergency playlist injection
///
/// A distinct broadcast path (not polled, fired once) that lets an external
/// recovery routine hand a ready-made playlist straight to the queue manager
/// when the normal load path has exhausted all fallbacks. Bypasses the
/// mailbox entirely: there is no track to communicate about yet.
#[derive(Clone)]
pub struct EmergencyFeed {
    tx: broadcast::Sender<Vec<Track>>,
}

impl EmergencyFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { tx }
    }

    /// Inject a replacement default playlist
    pub fn inject(&self, tracks: Vec<Track>) {
        let _ = self.tx.send(tracks);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Track>> {
        self.tx.subscribe()
    }
}

impl Default for EmergencyFeed {
    fn default() -> Self {
        Self::new()
    }
}
