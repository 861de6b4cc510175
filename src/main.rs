//! Service binary: configuration, wiring, and the shutdown path.

#![warn(clippy::all, clippy::pedantic)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turntable::{
    broker::Broker,
    config::Config,
    db::Database,
    gateway,
    playback::{self, player::Player, radio::Radio},
    queue::Queue,
    state::State,
    supervisor::Supervisor,
    tasks::Tasks,
    tracks::StreamOption,
    voice::Voice,
    Error,
};

/// Songs kept in the library before the maintenance sweep evicts the
/// least-played, oldest ones.
const LIBRARY_CAP: u32 = 500;

/// A voice-channel music service.
#[derive(Parser, Clone)]
#[command(about, version)]
pub struct Args {
    /// Path to the JSON configuration file.
    #[clap(long, short, default_value = "config.json")]
    config: PathBuf,

    /// For insanely detailed debug logs.
    #[clap(long, short)]
    debug: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = Config::load(&args.config).await?;

    // No transcoder at startup is a configuration problem, not something
    // to limp along without.
    if !playback::transcoder_available().await {
        eyre::bail!("ffmpeg not found on PATH");
    }

    let db = Database::open(&config.db_path).await?;
    if let Err(e) = db.maintenance_sweep(LIBRARY_CAP).await {
        warn!("maintenance sweep failed: {e}");
    }

    // Persisted settings win over the config file.
    let stored = db.load_config().await?;
    let volume = stored.volume.unwrap_or(config.volume);
    let stream = stored
        .stream
        .clone()
        .unwrap_or_else(|| config.radio_url.clone());

    let guild_id = config.guild_id().unwrap_or_default();
    let idle_channel = config.idle_channel_id().unwrap_or_default();
    if guild_id == 0 || idle_channel == 0 {
        warn!("default guild/voice channel not configured; joins will fail");
    }

    let state = Arc::new(State::new(volume, stream, idle_channel));

    let (worker_tx, worker_rx) = mpsc::channel(32);
    let (queue_tx, queue_rx) = mpsc::channel(32);
    let (signal_tx, signal_rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();

    let broker = Broker::new(config.uds_path.clone(), worker_tx, cancel.child_token());
    if let Err(e) = broker.connect().await {
        // The worker may simply not be up yet; the first request retries.
        warn!("downloader worker not reachable: {e}");
    }

    let gateway = Arc::new(gateway::Headless);
    let voice = Voice::new(Arc::clone(&state), gateway, guild_id);
    let player = Player::new(Arc::clone(&state), Arc::clone(&voice));
    let radio = Radio::new(Arc::clone(&state), Arc::clone(&voice))?;
    let queue = Queue::load(db.clone(), queue_tx).await?;

    let stations = vec![
        StreamOption::new("default", config.radio_url.clone()),
        StreamOption::new("listen.moe", "https://listen.moe/stream"),
        StreamOption::new("listen.moe kpop", "https://listen.moe/kpop/stream"),
    ];

    let supervisor = Supervisor::new(
        Arc::clone(&state),
        db,
        queue,
        Arc::clone(&broker),
        Arc::clone(&voice),
        player,
        radio,
        signal_tx,
        stations,
        Duration::from_secs(config.idle_timeout),
    );

    // Park in the idle channel right away; not fatal if the gateway isn't
    // ready yet.
    if idle_channel != 0 {
        if let Err(e) = voice.join(idle_channel).await {
            warn!("couldn't join the idle channel at startup: {e}");
        }
    }

    let mut tasks = Tasks::new();
    tasks.spawn(Arc::clone(&supervisor).run(worker_rx, queue_rx, signal_rx, cancel.child_token()));
    tasks.spawn(Arc::clone(&supervisor).idle_watchdog(cancel.child_token()));

    {
        let supervisor = Arc::clone(&supervisor);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            tokio::signal::ctrl_c().await?;
            info!("interrupt received");

            supervisor.shutdown().await;
            cancel.cancel();

            Ok::<(), Error>(())
        });
    }

    info!("service up");
    tasks.select().await?;

    Ok(())
}
