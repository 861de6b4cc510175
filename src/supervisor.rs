//! The mode supervisor: the one place that moves the service between
//! Idle, Radio and DJ.
//!
//! It reacts to three inputs: user commands (the public methods), worker
//! events from the broker, and presence signals from the platform. All
//! mode decisions and all error-to-user-message conversion happen here;
//! downstream components stay policy-free.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broker::{self, Broker, WorkerEvent},
    db::Database,
    playback::{self, player::Player, radio::Radio},
    queue::{self, Queue, QueueEvent},
    state::{Mode, State},
    tracks::{Song, StreamOption},
    voice::{self, Voice},
};

/// Shorthand for a [`Result`] with a supervisor error.
pub type Result<T> = std::result::Result<T, Error>;

/// Pause between stopping the radio and starting a track over it.
const RADIO_TO_DJ_DELAY: Duration = Duration::from_millis(200);

/// Pause after the final track before deciding where to go.
const QUEUE_END_DELAY: Duration = Duration::from_secs(1);

/// Bound on the whole shutdown drain.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// User-facing failures. The `Display` strings are the messages users see.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("that doesn't look like a valid URL: {0}")]
    InvalidUrl(String),

    #[error("volume must be between 0.01 and 0.10")]
    InvalidVolume,

    #[error("cannot clear while downloads are in progress")]
    DownloadsActive,

    #[error("unknown radio station: {0}")]
    UnknownStation(String),

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("the downloaded file is missing")]
    FileMissing,

    #[error("downloader: {0}")]
    Broker(#[from] broker::Error),

    #[error("queue: {0}")]
    Queue(#[from] queue::Error),

    #[error("playback: {0}")]
    Playback(#[from] playback::Error),

    #[error("voice: {0}")]
    Voice(#[from] voice::Error),

    #[error("storage: {0}")]
    Db(#[from] sqlx::Error),
}

/// What a song request turned into.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Downloaded and queued.
    Queued(Song),

    /// The same URL was already in flight; nothing dispatched.
    Duplicate,

    /// A clear is running; silently not accepted.
    Ignored,

    /// The source is live; the radio streamer took it.
    RadioStarted(String),
}

/// What a playlist request turned into.
#[derive(Debug)]
pub enum PlaylistOutcome {
    /// Accepted; the worker announced this many tracks.
    Started(u32),
    Duplicate,
    Ignored,
}

/// Internal presence/playback signals fed into the event loop.
#[derive(Debug)]
pub enum Signal {
    /// The player's current song reached its end (or was stopped).
    SongEnded,

    /// The platform dropped our voice connection.
    VoiceDropped,
}

/// The top-level orchestrator.
pub struct Supervisor {
    state: Arc<State>,
    db: Database,
    queue: Arc<Queue>,
    broker: Arc<Broker>,
    voice: Arc<Voice>,
    player: Arc<Player>,
    radio: Arc<Radio>,

    signals: mpsc::Sender<Signal>,

    /// Latched for the whole clear sequence; see [`Supervisor::clear_queue`].
    clearing: AtomicBool,

    /// Voice channel the next DJ session should join.
    dj_channel: Mutex<Option<u64>>,

    /// Who asked for which playlist, for attribution of item events.
    playlist_requesters: Mutex<HashMap<String, String>>,

    /// Selectable radio sources.
    stations: Vec<StreamOption>,

    idle_timeout: Duration,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<State>,
        db: Database,
        queue: Arc<Queue>,
        broker: Arc<Broker>,
        voice: Arc<Voice>,
        player: Arc<Player>,
        radio: Arc<Radio>,
        signals: mpsc::Sender<Signal>,
        stations: Vec<StreamOption>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            state,
            db,
            queue,
            broker,
            voice,
            player,
            radio,
            signals,
            clearing: AtomicBool::new(false),
            dj_channel: Mutex::new(None),
            playlist_requesters: Mutex::new(HashMap::new()),
            stations,
            idle_timeout,
        });

        // The player reports ends through the signal channel. The manual
        // flag is consulted here, at fire time, while the command that
        // stopped the track still holds the latch; by the time the event
        // loop would look, the latch may already be gone.
        let tx = supervisor.signals.clone();
        let state = Arc::clone(&supervisor.state);
        supervisor.player.set_on_song_end(move || {
            if !state.manual_operation() {
                let _ = tx.try_send(Signal::SongEnded);
            }
        });

        supervisor
    }

    /// Handle for the platform adapter to report presence changes.
    pub fn signal_sender(&self) -> mpsc::Sender<Signal> {
        self.signals.clone()
    }

    /// The configured radio stations.
    pub fn stations(&self) -> &[StreamOption] {
        &self.stations
    }

    // ---- event loop ------------------------------------------------------

    /// Drains worker, queue and presence events until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut worker_rx: mpsc::Receiver<WorkerEvent>,
        mut queue_rx: mpsc::Receiver<QueueEvent>,
        mut signal_rx: mpsc::Receiver<Signal>,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),

                Some(event) = worker_rx.recv() => self.handle_worker_event(event).await,
                Some(event) = queue_rx.recv() => self.handle_queue_event(event).await,
                Some(signal) = signal_rx.recv() => match signal {
                    Signal::SongEnded => self.handle_song_end().await,
                    Signal::VoiceDropped => self.handle_voice_dropped().await,
                },

                else => return Ok(()),
            }
        }
    }

    async fn handle_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::PlaylistStarted {
                playlist_id,
                total_tracks,
            } => {
                info!(playlist = %playlist_id, total_tracks, "playlist download started");
            }

            WorkerEvent::PlaylistItem {
                track,
                playlist_url,
            } => {
                // During a clear the accounting already happened; the
                // track itself is thrown away.
                if self.is_clearing() {
                    debug!("dropping playlist item during clear");
                    return;
                }

                let requested_by = self
                    .playlist_requesters
                    .lock()
                    .get(&playlist_url)
                    .cloned()
                    .unwrap_or_default();

                let song = Song::from_download(&track, &track_url(&track, &playlist_url), &requested_by);
                if let Err(e) = self.enqueue(song).await {
                    warn!("couldn't queue playlist item: {e}");
                }
            }

            WorkerEvent::DownloadComplete { id, success, error } => {
                if success {
                    debug!(%id, "download complete");
                } else {
                    warn!(%id, error = error.as_deref().unwrap_or("unknown"), "download failed");
                }
            }
        }
    }

    async fn handle_queue_event(&self, event: QueueEvent) {
        let QueueEvent::TrackAdded { song, position } = event;
        debug!(title = %song.title, position, "track added");

        if self.is_clearing() || self.state.manual_operation() {
            return;
        }

        match self.state.mode() {
            Mode::Idle => self.enter_dj().await,
            Mode::Radio => {
                self.radio.stop().await;
                tokio::time::sleep(RADIO_TO_DJ_DELAY).await;
                self.enter_dj().await;
            }
            Mode::Dj => {
                // Already playing; the new track waits its turn. If the
                // player went quiet between songs, kick it.
                if !self.player.is_playing() && !self.player.is_paused() {
                    self.play_current().await;
                }
            }
            Mode::Transitioning => {}
        }
    }

    /// The song-end chain: advance, or wind down to radio/idle.
    async fn handle_song_end(&self) {
        if self.state.is_shutting_down()
            || self.state.manual_operation()
            || self.is_clearing()
        {
            return;
        }

        if let Some(song) = self.queue.current() {
            if let Err(e) = self.db.mark_played(song.id).await {
                debug!("couldn't record play: {e}");
            }
        }

        match self.queue.advance().await {
            Ok(_) => self.play_current().await,
            Err(queue::Error::NoNext) => self.after_queue_end().await,
            Err(e) => warn!("couldn't advance the queue: {e}"),
        }
    }

    /// Queue exhausted: wait a moment, then either idle out or hand the
    /// channel to the radio.
    async fn after_queue_end(&self) {
        tokio::time::sleep(QUEUE_END_DELAY).await;

        if self.state.is_shutting_down() || self.is_clearing() {
            return;
        }

        if self.state.in_idle_channel() {
            self.state.set_mode(Mode::Idle);
            info!("queue finished, going idle");
        } else {
            self.state.set_mode(Mode::Radio);
            info!("queue finished, starting radio");
            if let Err(e) = self.radio.start(self.state.radio_stream()) {
                warn!("couldn't start radio after queue end: {e}");
                self.state.set_mode(Mode::Idle);
            }
        }
    }

    /// S6 path: the platform yanked the connection out from under us.
    async fn handle_voice_dropped(&self) {
        self.voice.handle_disconnect();

        if self.state.is_shutting_down() {
            return;
        }

        // Quiet everything without letting end callbacks advance the
        // cursor, then park in the idle channel so the current track can
        // restart from where the queue stands.
        let _manual = self.manual_guard();

        self.player.stop().await;
        self.radio.stop().await;

        let idle = self.state.idle_channel();
        if let Err(e) = self.voice.join(idle).await {
            warn!("couldn't rejoin the idle channel: {e}");
        }
        self.state.set_mode(Mode::Idle);
    }

    // ---- user commands ---------------------------------------------------

    /// Downloads one track and queues it.
    pub async fn request_song(
        &self,
        url: &str,
        requested_by: &str,
        channel_id: u64,
    ) -> Result<RequestOutcome> {
        validate_url(url)?;

        if self.is_clearing() {
            return Ok(RequestOutcome::Ignored);
        }

        self.state.touch();
        *self.dj_channel.lock() = Some(channel_id);

        let Some(track) = self.broker.download(url).await? else {
            return Ok(RequestOutcome::Duplicate);
        };

        if track.is_stream {
            // Live sources belong to the radio streamer.
            let stream_url = url.to_owned();
            self.start_radio_stream(&stream_url).await?;
            return Ok(RequestOutcome::RadioStarted(stream_url));
        }

        let song = Song::from_download(&track, url, requested_by);
        if self.is_clearing() {
            return Ok(RequestOutcome::Ignored);
        }

        let queued = self.enqueue(song).await?;
        Ok(RequestOutcome::Queued(queued))
    }

    /// Kicks off a playlist download; items arrive as worker events.
    pub async fn request_playlist(
        &self,
        url: &str,
        requested_by: &str,
        channel_id: u64,
    ) -> Result<PlaylistOutcome> {
        validate_url(url)?;

        if self.is_clearing() {
            return Ok(PlaylistOutcome::Ignored);
        }

        self.state.touch();
        *self.dj_channel.lock() = Some(channel_id);
        self.playlist_requesters
            .lock()
            .insert(url.to_owned(), requested_by.to_owned());

        match self.broker.start_playlist(url, 100).await? {
            Some(started) => Ok(PlaylistOutcome::Started(started.total_tracks)),
            None => Ok(PlaylistOutcome::Duplicate),
        }
    }

    /// Passes a search through to the worker.
    pub async fn search(
        &self,
        query: &str,
        platform: &str,
        limit: u32,
    ) -> Result<Vec<broker::protocol::SearchResult>> {
        self.state.touch();
        Ok(self.broker.search(query, platform, limit).await?)
    }

    /// Stops the current track and starts the next one.
    ///
    /// Returns the new current song, or `None` when the queue ran out.
    pub async fn skip(&self) -> Result<Option<Song>> {
        if !self.player.is_playing() && !self.player.is_paused() {
            return Err(Error::NothingPlaying);
        }

        self.state.touch();
        let _manual = self.manual_guard();

        self.player.stop().await;

        match self.queue.advance().await {
            Ok(song) => {
                self.play_current().await;
                Ok(Some(song))
            }
            Err(queue::Error::NoNext) => {
                self.after_queue_end().await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn pause(&self) {
        self.state.touch();
        self.player.pause().await;
    }

    pub async fn resume(&self) -> Result<()> {
        self.state.touch();
        Ok(self.player.resume().await?)
    }

    /// Stops whatever is playing and goes Idle without leaving the channel.
    pub async fn stop(&self) {
        self.state.touch();
        let _manual = self.manual_guard();

        self.player.stop().await;
        self.radio.stop().await;
        self.state.set_mode(Mode::Idle);
    }

    /// Empties the queue.
    ///
    /// Refused while downloads are outstanding. While the clear runs, new
    /// requests are silently ignored and late worker events are dropped
    /// (their accounting still applies).
    pub async fn clear_queue(&self) -> Result<()> {
        if self.broker.pending_downloads() > 0 {
            return Err(Error::DownloadsActive);
        }

        self.clearing.store(true, Ordering::Release);
        info!("clearing the queue");

        self.player.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let result = self.queue.clear().await;
        self.broker.reset_accounting();
        self.playlist_requesters.lock().clear();

        tokio::time::sleep(Duration::from_millis(500)).await;
        self.clearing.store(false, Ordering::Release);

        result?;
        if self.state.mode() == Mode::Dj {
            self.state.set_mode(Mode::Idle);
        }
        Ok(())
    }

    /// Switches to a named station, or the configured default.
    pub async fn start_radio(&self, station: Option<&str>) -> Result<String> {
        let url = match station {
            None => self.state.radio_stream(),
            Some(name) => self
                .stations
                .iter()
                .find(|option| option.name.eq_ignore_ascii_case(name))
                .map(|option| option.url.clone())
                .ok_or_else(|| Error::UnknownStation(name.to_owned()))?,
        };

        self.start_radio_stream(&url).await?;
        Ok(url)
    }

    async fn start_radio_stream(&self, url: &str) -> Result<()> {
        self.state.touch();
        let _manual = self.manual_guard();

        self.state.set_mode(Mode::Transitioning);
        self.player.stop().await;
        self.radio.stop().await;

        let idle = self.state.idle_channel();
        let channel = if self.state.connected() {
            self.state.current_channel().unwrap_or(idle)
        } else {
            idle
        };
        self.voice.join(channel).await?;

        self.state.set_radio_stream(url.to_owned());
        self.db.save_stream(url).await?;

        self.radio.start(url.to_owned())?;
        self.state.set_mode(Mode::Radio);

        Ok(())
    }

    pub async fn stop_radio(&self) {
        self.state.touch();
        self.radio.stop().await;
        self.state.set_mode(Mode::Idle);
    }

    /// Sets and persists the playback volume.
    pub async fn set_volume(&self, volume: f32) -> Result<f32> {
        if !self.state.set_volume(volume) {
            return Err(Error::InvalidVolume);
        }

        self.db.save_volume(volume).await?;
        Ok(volume)
    }

    /// The current queue song while in DJ mode.
    pub fn now_playing(&self) -> Option<Song> {
        (self.state.mode() == Mode::Dj).then(|| self.queue.current()).flatten()
    }

    pub fn upcoming(&self, limit: usize) -> Vec<Song> {
        self.queue.upcoming(limit)
    }

    // ---- transitions -----------------------------------------------------

    /// Joins the requester's channel and starts the current song.
    async fn enter_dj(&self) {
        self.state.set_mode(Mode::Transitioning);

        let channel = self
            .dj_channel
            .lock()
            .unwrap_or_else(|| self.state.idle_channel());

        if let Err(e) = self.voice.join(channel).await {
            warn!(channel, "couldn't join for dj mode: {e}");
            self.state.set_mode(Mode::Idle);
            return;
        }

        self.state.set_mode(Mode::Dj);
        self.play_current().await;
    }

    /// Plays the song under the cursor, skipping unplayable ones.
    async fn play_current(&self) {
        loop {
            let Some(song) = self.queue.current() else {
                self.after_queue_end().await;
                return;
            };

            match self.player.play(song.clone()).await {
                Ok(()) => return,
                Err(playback::Error::MissingFile(path)) => {
                    warn!(title = %song.title, %path, "file gone, skipping track");
                    match self.queue.advance().await {
                        Ok(_) => {}
                        Err(_) => {
                            self.after_queue_end().await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(title = %song.title, "couldn't start track: {e}");
                    return;
                }
            }
        }
    }

    /// Queues a completed song and lets the queue event drive the mode.
    ///
    /// A completed non-stream track must point at a readable file when it
    /// enters the queue; a pathless or vanished download is refused here
    /// rather than persisted.
    async fn enqueue(&self, song: Song) -> Result<Song> {
        if !song.is_stream {
            let Some(path) = song.path() else {
                return Err(Error::FileMissing);
            };
            if tokio::fs::metadata(path).await.is_err() {
                return Err(Error::FileMissing);
            }
        }

        let item = self.queue.add(song).await?;
        Ok(item.song)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Tears everything down inside a bounded window.
    pub async fn shutdown(&self) {
        self.state.set_shutting_down();
        info!("shutting down");

        let drain = async {
            self.radio.shutdown().await;
            self.player.shutdown().await;
            self.broker.shutdown().await;
            self.voice.shutdown().await;
        };

        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("shutdown drain exceeded its deadline, abandoning stragglers");
        }

        self.state.set_mode(Mode::Idle);
    }

    /// Periodically returns an abandoned connection to the idle channel.
    pub async fn idle_watchdog(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> crate::Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if self.state.is_shutting_down() {
                return Ok(());
            }
            if self.state.manual_operation()
                || self.is_clearing()
                || self.player.is_playing()
                || self.radio.is_streaming()
            {
                continue;
            }

            let idle_for = Duration::from_secs(self.state.idle_for_secs());
            if idle_for >= self.idle_timeout
                && self.state.connected()
                && !self.state.in_idle_channel()
            {
                info!("idle too long, returning to the idle channel");
                let idle = self.state.idle_channel();
                if let Err(e) = self.voice.join(idle).await {
                    warn!("couldn't return to the idle channel: {e}");
                }
                self.state.set_mode(Mode::Idle);
            }
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn is_clearing(&self) -> bool {
        self.clearing.load(Ordering::Acquire)
    }

    fn manual_guard(&self) -> ManualGuard<'_> {
        self.state.set_manual_operation(true);
        ManualGuard(&self.state)
    }
}

/// Releases the manual-operation latch on drop.
struct ManualGuard<'a>(&'a State);

impl Drop for ManualGuard<'_> {
    fn drop(&mut self) {
        self.0.set_manual_operation(false);
    }
}

/// Accepts http(s) URLs only.
fn validate_url(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(Error::InvalidUrl(url.to_owned())),
    }
}

/// Playlist item events don't carry a per-item URL; derive a stable
/// logical identity from the playlist and the item's title.
fn track_url(track: &crate::broker::protocol::DownloadedTrack, playlist_url: &str) -> String {
    format!("{playlist_url}#{}", track.title)
}
