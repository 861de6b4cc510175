//! RPC client for the downloader worker.
//!
//! The worker lives behind a Unix stream socket and speaks length-prefixed
//! JSON (see [`protocol`]). One reader task per connection routes responses
//! to their awaiting callers by request id and forwards unsolicited events
//! to the supervisor; frame writes are serialized by a mutex so only one
//! frame is ever on the wire at a time.
//!
//! The broker also owns the pending-download accounting and the duplicate
//! in-flight suppression for single downloads and playlists.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::protocol::{
    Completion, DownloadParams, DownloadedTrack, Event, Incoming, PlaylistInfo, PlaylistItem,
    PlaylistParams, PlaylistStarted, Request, Response, SearchParams, SearchResult, SearchResults,
};

pub mod protocol;

/// Shorthand for a [`Result`] with a broker error.
pub type Result<T> = std::result::Result<T, Error>;

/// How long to wait for the socket dial.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-operation response deadlines.
const PING_TIMEOUT: Duration = Duration::from_secs(30);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(180);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const PLAYLIST_TIMEOUT: Duration = Duration::from_secs(600);

/// Reconnect attempts before giving up and going Disconnected.
const RECONNECT_ATTEMPTS: u32 = 5;

/// Errors surfaced to broker callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not connected to the downloader worker")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("worker error: {0}")]
    Worker(String),

    #[error("protocol failure: {0}")]
    Protocol(#[from] protocol::Error),

    #[error("unexpected response payload: {0}")]
    BadPayload(serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of the worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Worker events forwarded to the supervisor.
///
/// Accounting already happened by the time one of these is delivered; the
/// supervisor only decides what to do with the payload.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    PlaylistStarted {
        playlist_id: String,
        total_tracks: u32,
    },
    PlaylistItem {
        track: DownloadedTrack,
        playlist_url: String,
    },
    DownloadComplete {
        id: String,
        success: bool,
        error: Option<String>,
    },
}

/// Progress of one in-flight playlist, keyed by URL.
#[derive(Debug, Default)]
struct PlaylistProgress {
    /// Item total from the `start_playlist_download` response.
    announced: Option<u32>,
    /// `playlist_item_downloaded` events observed so far.
    seen: u32,
}

/// Counter and duplicate-suppression state, under one lock.
#[derive(Debug, Default)]
struct Accounting {
    /// Outstanding expected download-complete events.
    pending: u32,
    /// Single-download URLs currently in flight.
    singles: HashSet<String>,
    /// Playlist URLs currently in flight.
    playlists: HashMap<String, PlaylistProgress>,
}

/// The downloader RPC client. Shared as an [`Arc`].
pub struct Broker {
    socket_path: PathBuf,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,

    /// Write half of the socket; `None` while disconnected. The mutex also
    /// serializes whole-frame writes.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    /// Completion slots for in-flight requests, keyed by request id.
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,

    accounting: Mutex<Accounting>,

    /// Connection state; doubles as the single-reconnect-loop gate.
    conn: Mutex<ConnState>,
}

impl Broker {
    /// Creates a disconnected broker. Call [`Broker::connect`] (or let the
    /// first request do it) to dial the worker.
    pub fn new(
        socket_path: PathBuf,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket_path,
            events,
            cancel,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            accounting: Mutex::new(Accounting::default()),
            conn: Mutex::new(ConnState::Disconnected),
        })
    }

    /// Current connection state.
    pub fn conn_state(&self) -> ConnState {
        *self.conn.lock()
    }

    /// Outstanding expected download events.
    pub fn pending_downloads(&self) -> u32 {
        self.accounting.lock().pending
    }

    /// True while any download or playlist is in flight.
    pub fn downloads_active(&self) -> bool {
        let accounting = self.accounting.lock();
        accounting.pending > 0 || !accounting.singles.is_empty() || !accounting.playlists.is_empty()
    }

    /// Zeroes the pending counter and forgets all in-flight URLs.
    ///
    /// Used by queue clear and after a lost connection, when the matching
    /// completion events will never arrive.
    pub fn reset_accounting(&self) {
        let mut accounting = self.accounting.lock();
        accounting.pending = 0;
        accounting.singles.clear();
        accounting.playlists.clear();
    }

    /// Dials the worker socket and starts the reader task.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            match *conn {
                ConnState::Connected => return Ok(()),
                ConnState::Connecting | ConnState::Reconnecting => {
                    return Err(Error::NotConnected)
                }
                ConnState::Disconnected => *conn = ConnState::Connecting,
            }
        }

        match self.dial().await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.conn.lock() = ConnState::Disconnected;
                Err(e)
            }
        }
    }

    async fn dial(self: &Arc<Self>) -> Result<()> {
        let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| Error::Timeout)??;

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.conn.lock() = ConnState::Connected;

        let broker = Arc::clone(self);
        tokio::spawn(async move { broker.read_loop(read_half).await });

        info!(path = %self.socket_path.display(), "connected to downloader worker");
        Ok(())
    }

    /// Single reader per connection. Exits on cancellation or the first
    /// read/decode failure, which triggers the reconnect loop.
    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return,
                frame = protocol::read_frame(&mut reader) => frame,
            };

            let body = match frame {
                Ok(body) => body,
                Err(e) => {
                    warn!("worker read failed: {e}");
                    break;
                }
            };

            match protocol::decode(&body) {
                Ok(Incoming::Response(response)) => self.route_response(response),
                Ok(Incoming::Event(event)) => self.handle_event(&event),
                Err(e) => {
                    // A malformed frame means we lost framing sync.
                    warn!("dropping connection over malformed frame: {e}");
                    break;
                }
            }
        }

        if !self.cancel.is_cancelled() {
            self.reconnect().await;
        }
    }

    /// Hands a response to whichever caller is waiting on its id.
    fn route_response(&self, response: Response) {
        let slot = self.pending.lock().remove(&response.id);

        match slot {
            // The caller gave up already (timeout); nothing to tell.
            None => debug!(id = %response.id, "response with no waiter"),
            Some(tx) => {
                let _ = tx.send(response);
            }
        }
    }

    /// Applies accounting for one event, then forwards it off the reader
    /// task so a slow supervisor cannot stall frame reads.
    fn handle_event(&self, event: &Event) {
        let forwarded = match event.event.as_str() {
            "playlist_started" => {
                let Ok(started) = serde_json::from_value::<PlaylistStarted>(event.data.clone())
                else {
                    warn!("dropping malformed playlist_started event");
                    return;
                };

                self.accounting.lock().pending += started.total_tracks;
                WorkerEvent::PlaylistStarted {
                    playlist_id: started.playlist_id,
                    total_tracks: started.total_tracks,
                }
            }

            "playlist_item_downloaded" => {
                let Ok(item) = serde_json::from_value::<PlaylistItem>(event.data.clone()) else {
                    warn!("dropping malformed playlist_item_downloaded event");
                    return;
                };

                {
                    let mut accounting = self.accounting.lock();
                    if let Some(progress) = accounting.playlists.get_mut(&item.playlist.url) {
                        progress.seen += 1;
                        if progress.announced.is_some_and(|total| progress.seen >= total) {
                            accounting.playlists.remove(&item.playlist.url);
                        }
                    }
                }

                WorkerEvent::PlaylistItem {
                    track: item.track,
                    playlist_url: item.playlist.url,
                }
            }

            "download_complete" | "download_failed" => {
                let Ok(completion) = serde_json::from_value::<Completion>(event.data.clone())
                else {
                    warn!("dropping malformed completion event");
                    return;
                };

                {
                    let mut accounting = self.accounting.lock();
                    accounting.pending = accounting.pending.saturating_sub(1);
                }

                let success =
                    event.event == "download_complete" && completion.status != "error";
                WorkerEvent::DownloadComplete {
                    id: completion.id,
                    success,
                    error: completion.error,
                }
            }

            other => {
                debug!(event = other, "ignoring unknown worker event");
                return;
            }
        };

        let tx = self.events.clone();
        tokio::spawn(async move {
            let _ = tx.send(forwarded).await;
        });
    }

    /// Registers a completion slot and puts one frame on the wire.
    ///
    /// On success the request is owned by the worker; the caller must
    /// follow up with [`Broker::await_response`] to consume the slot.
    ///
    /// With `owes_completion` the pending counter is bumped before the
    /// frame is written: once the frame is on the wire the reader may
    /// process the matching completion event at any moment, and its
    /// decrement must never be observable ahead of the increment. A
    /// failed write rolls the reservation back.
    async fn dispatch(
        self: &Arc<Self>,
        command: &str,
        params: Value,
        owes_completion: bool,
    ) -> Result<(String, oneshot::Receiver<Response>)> {
        if self.cancel.is_cancelled() {
            return Err(Error::NotConnected);
        }

        if self.conn_state() == ConnState::Disconnected {
            self.connect().await?;
        }

        let id = request_id();
        let request = Request::new(command, id.clone(), params);
        let body = protocol::encode(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        if owes_completion {
            self.accounting.lock().pending += 1;
        }

        let rollback = |this: &Self| {
            this.pending.lock().remove(&id);
            if owes_completion {
                let mut accounting = this.accounting.lock();
                accounting.pending = accounting.pending.saturating_sub(1);
            }
        };

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                rollback(self);
                return Err(Error::NotConnected);
            };

            if let Err(e) = protocol::write_frame(writer, &body).await {
                rollback(self);
                warn!("worker write failed: {e}");
                return Err(e.into());
            }
        }

        Ok((id, rx))
    }

    /// Blocks on a dispatched request's completion slot.
    ///
    /// Exactly one of: the response, a timeout error, or a not-connected
    /// error reaches the caller; the correlation entry is removed on every
    /// path.
    async fn await_response(
        &self,
        id: &str,
        rx: oneshot::Receiver<Response>,
        deadline: Duration,
    ) -> Result<Response> {
        match timeout(deadline, rx).await {
            Ok(Ok(response)) => {
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(Error::Worker(response.error_message()))
                }
            }
            // Slot dropped: the connection died and pending was drained.
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.lock().remove(id);
                Err(Error::Timeout)
            }
        }
    }

    /// Dispatch and wait in one step, for operations with no accounting.
    async fn send_request(
        self: &Arc<Self>,
        command: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Response> {
        let (id, rx) = self.dispatch(command, params, false).await?;
        self.await_response(&id, rx, deadline).await
    }

    /// Health check.
    pub async fn ping(self: &Arc<Self>) -> Result<()> {
        let params = serde_json::json!({ "timestamp": chrono::Utc::now().to_rfc3339() });
        self.send_request("ping", params, PING_TIMEOUT).await?;
        Ok(())
    }

    /// Requests a single download.
    ///
    /// Returns `Ok(None)` when the same URL is already in flight, without
    /// dispatching a second request. Otherwise blocks until the worker
    /// finishes (or the 300 s deadline passes) and returns the track.
    pub async fn download(self: &Arc<Self>, url: &str) -> Result<Option<DownloadedTrack>> {
        {
            let mut accounting = self.accounting.lock();
            if !accounting.singles.insert(url.to_owned()) {
                debug!(%url, "duplicate download suppressed");
                return Ok(None);
            }
        }

        let params = DownloadParams {
            url: url.to_owned(),
            max_duration_seconds: 3600,
            max_size_mb: 200,
            allow_live: true,
        };
        let params = serde_json::to_value(&params).map_err(Error::BadPayload)?;

        // The pending reservation rides inside dispatch, ahead of the
        // write; a failed dispatch never reached the worker, so no
        // completion event is owed.
        let dispatched = self.dispatch("download_audio", params, true).await;
        let (id, rx) = match dispatched {
            Ok(pair) => pair,
            Err(e) => {
                self.accounting.lock().singles.remove(url);
                return Err(e);
            }
        };

        let result = self.await_response(&id, rx, DOWNLOAD_TIMEOUT).await;

        // In-flight window ends with the request, success or not.
        self.accounting.lock().singles.remove(url);

        match result {
            Ok(response) => {
                let track = serde_json::from_value(response.data).map_err(Error::BadPayload)?;
                Ok(Some(track))
            }
            Err(e) => Err(e),
        }
    }

    /// Kicks off a playlist download.
    ///
    /// Returns `Ok(None)` for a duplicate in-flight playlist URL. The item
    /// total arrives both in the response and in the `playlist_started`
    /// event; only the event increments the pending counter.
    pub async fn start_playlist(
        self: &Arc<Self>,
        url: &str,
        max_items: u32,
    ) -> Result<Option<PlaylistStarted>> {
        {
            let mut accounting = self.accounting.lock();
            if accounting.playlists.contains_key(url) {
                debug!(%url, "duplicate playlist suppressed");
                return Ok(None);
            }
            accounting
                .playlists
                .insert(url.to_owned(), PlaylistProgress::default());
        }

        let params = PlaylistParams {
            url: url.to_owned(),
            max_items,
        };
        let params = serde_json::to_value(&params).map_err(Error::BadPayload)?;

        match self
            .send_request("start_playlist_download", params, PLAYLIST_TIMEOUT)
            .await
        {
            Ok(response) => {
                let started: PlaylistStarted =
                    serde_json::from_value(response.data).map_err(Error::BadPayload)?;

                let mut accounting = self.accounting.lock();
                if let Some(progress) = accounting.playlists.get_mut(url) {
                    progress.announced = Some(started.total_tracks);
                    if progress.seen >= started.total_tracks {
                        accounting.playlists.remove(url);
                    }
                }

                Ok(Some(started))
            }
            Err(e) => {
                self.accounting.lock().playlists.remove(url);
                Err(e)
            }
        }
    }

    /// Re-requests one item of a playlist by index, e.g. after a failed
    /// item event. Same payload shape as a single download.
    pub async fn download_playlist_item(
        self: &Arc<Self>,
        url: &str,
        index: u32,
    ) -> Result<DownloadedTrack> {
        let params = serde_json::json!({ "url": url, "index": index });

        let response = self
            .send_request("download_playlist_item", params, DOWNLOAD_TIMEOUT)
            .await?;
        serde_json::from_value(response.data).map_err(Error::BadPayload)
    }

    /// Fetches playlist metadata without downloading.
    pub async fn playlist_info(self: &Arc<Self>, url: &str, max_items: u32) -> Result<PlaylistInfo> {
        let params = PlaylistParams {
            url: url.to_owned(),
            max_items,
        };
        let params = serde_json::to_value(&params).map_err(Error::BadPayload)?;

        let response = self
            .send_request("get_playlist_info", params, SEARCH_TIMEOUT)
            .await?;
        serde_json::from_value(response.data).map_err(Error::BadPayload)
    }

    /// Searches the given platform.
    pub async fn search(
        self: &Arc<Self>,
        query: &str,
        platform: &str,
        limit: u32,
    ) -> Result<Vec<SearchResult>> {
        let params = SearchParams {
            query: query.to_owned(),
            platform: platform.to_owned(),
            limit,
            include_live: false,
        };
        let params = serde_json::to_value(&params).map_err(Error::BadPayload)?;

        let response = self.send_request("search", params, SEARCH_TIMEOUT).await?;
        let results: SearchResults =
            serde_json::from_value(response.data).map_err(Error::BadPayload)?;

        Ok(results.results)
    }

    /// Reconnect loop: back-off over [`RECONNECT_ATTEMPTS`] tries, with all
    /// pending requests failed up front. Only one loop runs at a time.
    async fn reconnect(self: &Arc<Self>) {
        {
            let mut conn = self.conn.lock();
            if *conn == ConnState::Reconnecting {
                return;
            }
            *conn = ConnState::Reconnecting;
        }

        self.drop_connection().await;

        for attempt in 1..=RECONNECT_ATTEMPTS {
            if self.cancel.is_cancelled() {
                break;
            }

            let delay = Duration::from_secs(u64::from(attempt.min(10)));
            tokio::time::sleep(delay).await;

            match self.dial().await {
                Ok(()) => {
                    info!(attempt, "reconnected to downloader worker");
                    return;
                }
                Err(e) => warn!(attempt, "reconnect failed: {e}"),
            }
        }

        warn!("giving up on the downloader worker");
        *self.conn.lock() = ConnState::Disconnected;
    }

    /// Drops the writer, fails every waiter, and forgets in-flight
    /// accounting whose events can no longer arrive.
    async fn drop_connection(&self) {
        *self.writer.lock().await = None;
        self.pending.lock().clear();
        self.reset_accounting();
    }

    /// Cancels the reader and closes the connection for good.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.drop_connection().await;
        *self.conn.lock() = ConnState::Disconnected;
    }
}

/// Opaque random request id: 32 hex characters.
fn request_id() -> String {
    format!("{:032x}", fastrand::u128(..))
}
