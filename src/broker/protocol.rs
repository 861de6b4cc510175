//! Wire format for the downloader worker RPC.
//!
//! Every message is a 4-byte big-endian length header followed by a JSON
//! body. Three body shapes exist: requests (client to worker), responses
//! (correlated by request id), and unsolicited events.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Shorthand for a [`Result`] with a protocol error.
pub type Result<T> = std::result::Result<T, Error>;

/// Largest frame the worker may send us.
pub const MAX_INBOUND_FRAME: usize = 10 * 1024 * 1024;

/// Largest frame we may put on the wire.
pub const MAX_OUTBOUND_FRAME: usize = 100 * 1024 * 1024;

/// Framing and message-shape failures.
///
/// An oversized or malformed inbound frame poisons the connection; the
/// broker reacts by reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A request put on the wire, correlated to its response by `id`.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    #[serde(rename = "type")]
    kind: &'static str,
    pub command: String,
    pub id: String,
    pub params: Value,
    pub timestamp: String,
}

impl Request {
    /// Builds a request with a fresh timestamp.
    pub fn new(command: &str, id: String, params: Value) -> Self {
        Self {
            kind: "request",
            command: command.to_owned(),
            id,
            params,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// The worker's answer to one [`Request`].
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub status: String,
    pub id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// The worker's error message, or a placeholder when it sent none.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "worker reported an unspecified error".to_owned())
    }
}

/// An unsolicited message from the worker.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Any message the worker can send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Incoming {
    Response(Response),
    Event(Event),
}

/// `download_audio` request parameters.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadParams {
    pub url: String,
    pub max_duration_seconds: u32,
    pub max_size_mb: u32,
    pub allow_live: bool,
}

/// Track payload returned for a finished download, and carried inside
/// `playlist_item_downloaded` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedTrack {
    pub title: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub platform: Option<String>,
}

/// `search` request parameters.
#[derive(Debug, Clone, Serialize)]
pub struct SearchParams {
    pub query: String,
    pub platform: String,
    pub limit: u32,
    pub include_live: bool,
}

/// One hit from a `search` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub platform: String,
}

/// `search` response data.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

/// `start_playlist_download` / `get_playlist_info` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistParams {
    pub url: String,
    pub max_items: u32,
}

/// `start_playlist_download` response data.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistStarted {
    pub playlist_id: String,
    pub total_tracks: u32,
}

/// `get_playlist_info` response data.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistInfo {
    #[serde(default)]
    pub playlist_title: String,
    pub total_tracks: u32,
    pub is_playlist: bool,
}

/// `playlist_item_downloaded` event data.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistItem {
    pub track: DownloadedTrack,
    pub playlist: PlaylistRef,
}

/// The playlist a downloaded item belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistRef {
    pub url: String,
}

/// `download_complete` / `download_failed` event data.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_INBOUND_FRAME {
        return Err(Error::FrameTooLarge(len, MAX_INBOUND_FRAME));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Bytes::from(body))
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_OUTBOUND_FRAME {
        return Err(Error::FrameTooLarge(body.len(), MAX_OUTBOUND_FRAME));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}

/// Parses a frame body into a response or event.
pub fn decode(body: &[u8]) -> Result<Incoming> {
    Ok(serde_json::from_slice(body)?)
}

/// Serializes a request for the wire.
pub fn encode(request: &Request) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}
