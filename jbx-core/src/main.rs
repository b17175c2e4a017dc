//! JBX Core - controller entry point
//!
//! Wires the subsystems together and runs the controller session loop. The
//! presentation surface is a separate context reached over the sync channel;
//! for bring-up the `--simulate-surface` flag runs a scripted surface
//! in-process against the same mailbox store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jbx_common::config::{default_data_dir, JbxConfig};
use jbx_common::events::EventBus;
use jbx_common::mailbox::{CommandAction, SurfaceState, SurfaceStatus};
use jbx_common::model::TrackId;
use jbx_core::catalog::{CatalogLoader, CatalogProvider, FileCatalog};
use jbx_core::credentials::CredentialRotation;
use jbx_core::player::NoopLauncher;
use jbx_core::session::Session;
use jbx_core::sync::{EmergencyFeed, Inbound, Mailbox, MailboxStore, MemoryStore};

/// Command-line arguments for jbx-core
#[derive(Parser, Debug)]
#[command(name = "jbx-core")]
#[command(about = "Jukebox kiosk controller")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Playlist identifier loaded as the default playlist
    #[arg(short, long, default_value = "default", env = "JBX_PLAYLIST_ID")]
    playlist: String,

    /// Data directory for resume snapshots and the local catalog
    #[arg(short, long, env = "JBX_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Comma-separated credential pool for quota-metered providers
    #[arg(long, env = "JBX_CREDENTIALS", value_delimiter = ',')]
    credentials: Vec<String>,

    /// User-supplied credential appended to the pool
    #[arg(long, env = "JBX_CUSTOM_CREDENTIAL")]
    custom_credential: Option<String>,

    /// Run a scripted presentation surface in-process (bring-up)
    #[arg(long)]
    simulate_surface: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jbx_core=debug,jbx_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = JbxConfig::resolve(args.config.as_deref())
        .context("Failed to load configuration")?;
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    info!(playlist = %args.playlist, data_dir = %data_dir.display(), "Starting JBX controller");

    let providers: Vec<Box<dyn CatalogProvider>> =
        vec![Box::new(FileCatalog::new(data_dir.join("catalog.json")))];
    let loader = CatalogLoader::new(providers, &config);
    let rotation = CredentialRotation::new(
        args.credentials.clone(),
        args.custom_credential.clone(),
        &config,
    );

    let store: Arc<dyn MailboxStore> = Arc::new(MemoryStore::new());
    if args.simulate_surface {
        info!("Running simulated presentation surface in-process");
        let surface = Mailbox::surface(Arc::clone(&store), config.poll_interval());
        tokio::spawn(run_simulated_surface(surface));
    }

    let mailbox = Mailbox::controller(Arc::clone(&store), config.poll_interval());
    let events = Arc::new(EventBus::new(64));
    let mut session = Session::new(
        mailbox,
        loader,
        rotation,
        events,
        EmergencyFeed::new(),
        Box::new(NoopLauncher),
        &config,
        data_dir,
        args.playlist.clone(),
    );

    session.startup().await.context("Startup failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    session.run(shutdown_rx).await.context("Session loop error")?;
    info!("Controller shutdown complete");
    Ok(())
}

/// Scripted surface for bring-up: acknowledges commands and plays each track
/// for a fixed 30 seconds with periodic heartbeats
async fn run_simulated_surface(mailbox: Mailbox) {
    const TRACK_LENGTH: Duration = Duration::from_secs(30);

    let mut inbound = mailbox.spawn_receiver();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(4));
    let mut playing: Option<TrackId> = None;
    let mut paused = false;
    let mut ends_at: Option<Instant> = None;

    let post = |mailbox: &Mailbox, state: SurfaceState, id: Option<TrackId>| {
        if let Err(e) = mailbox.post_status(&SurfaceStatus::new(state, id)) {
            warn!(error = %e, "Simulated surface failed to post status");
        }
    };

    loop {
        tokio::select! {
            cmd = inbound.recv() => match cmd {
                Some(Inbound::Command(cmd)) => match cmd.action {
                    CommandAction::Play => {
                        debug!(track = ?cmd.track_id, "Simulated surface: play");
                        playing = cmd.track_id.clone();
                        paused = false;
                        ends_at = Some(Instant::now() + TRACK_LENGTH);
                        post(&mailbox, SurfaceState::Ready, playing.clone());
                        post(&mailbox, SurfaceState::Playing, playing.clone());
                    }
                    CommandAction::Pause { .. } => paused = true,
                    CommandAction::Resume { .. } => {
                        paused = false;
                        post(&mailbox, SurfaceState::Playing, playing.clone());
                    }
                    CommandAction::FadeOutAndBlack => {
                        post(&mailbox, SurfaceState::Ended, playing.take());
                        ends_at = None;
                    }
                },
                Some(other) => debug!(?other, "Simulated surface: unexpected inbound"),
                None => break,
            },
            _ = heartbeat.tick() => {
                if playing.is_some() && !paused {
                    if ends_at.is_some_and(|t| Instant::now() >= t) {
                        post(&mailbox, SurfaceState::Ended, playing.take());
                        ends_at = None;
                    } else {
                        post(&mailbox, SurfaceState::Playing, playing.clone());
                    }
                }
            }
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
