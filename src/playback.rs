//! Shared playback machinery: the Opus encoder configuration, the external
//! transcoder child, and the error classification that drives radio
//! reconnect delays.
//!
//! Both pipelines (track player, radio streamer) read s16le PCM from an
//! `ffmpeg` child, encode 20 ms Opus frames, and push them into the voice
//! connection's frame channel.

use std::{path::Path, process::Stdio, time::Duration};

use audiopus::{coder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use tracing::warn;

pub mod player;
pub mod radio;

/// Shorthand for a [`Result`] with a playback error.
pub type Result<T> = std::result::Result<T, Error>;

/// Output sample rate expected by the voice connection.
pub const SAMPLE_RATE: u32 = 48_000;

/// Stereo, always.
pub const CHANNELS: u32 = 2;

/// Samples per channel in one 20 ms frame.
pub const FRAME_SAMPLES: usize = 960;

/// Bytes of s16le PCM backing one frame.
pub const FRAME_PCM_BYTES: usize = FRAME_SAMPLES * CHANNELS as usize * 2;

/// Upper bound for one encoded Opus frame.
pub const MAX_OPUS_BYTES: usize = 1000;

/// Deadline for pushing one frame into the voice channel.
pub const FRAME_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between SIGINT and SIGKILL at transcoder teardown.
const TRANSCODER_GRACE: Duration = Duration::from_secs(2);

/// Errors raised inside the playback pipelines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out sending a frame to the voice connection")]
    SendTimeout,

    #[error("timed out reading a frame from the stream")]
    ReadTimeout,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream returned http status {0}")]
    HttpStatus(u16, Option<u64>),

    #[error("opus encoder failure: {0}")]
    Encoder(#[from] audiopus::Error),

    #[error("could not start the transcoder: {0}")]
    Transcoder(std::io::Error),

    #[error("media file missing: {0}")]
    MissingFile(String),

    #[error("no voice connection")]
    NotConnected,

    #[error("a track is already playing")]
    Busy,

    #[error("shutting down")]
    ShuttingDown,
}

/// Coarse error kinds, each mapped to a reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Normal stream boundary; reconnect almost immediately.
    Eof,
    /// The source is throttling us; back off for a long time.
    RateLimit,
    Timeout,
    Network,
    Other,
}

/// Buckets an error into its [`ErrorKind`].
pub fn classify(error: &Error) -> ErrorKind {
    match error {
        Error::Io(e) => match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => ErrorKind::Network,
            _ => classify_message(&e.to_string()),
        },

        Error::ReadTimeout | Error::SendTimeout => ErrorKind::Timeout,

        Error::HttpStatus(429, _) => ErrorKind::RateLimit,
        Error::HttpStatus(..) => ErrorKind::Other,

        Error::Http(e) => {
            if e.is_timeout() {
                ErrorKind::Timeout
            } else if e.is_connect() {
                ErrorKind::Network
            } else {
                classify_message(&e.to_string())
            }
        }

        Error::Transcoder(_) => ErrorKind::Network,

        _ => ErrorKind::Other,
    }
}

/// Substring fallback for errors that only carry a message.
fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_ascii_lowercase();

    if message.contains("rate limit") || message.contains("too many requests") {
        ErrorKind::RateLimit
    } else if message.contains("eof") {
        ErrorKind::Eof
    } else if message.contains("timeout") || message.contains("timed out") {
        ErrorKind::Timeout
    } else if ["network", "connection", "refused", "reset"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        ErrorKind::Network
    } else {
        ErrorKind::Other
    }
}

/// Reconnect delay for an error kind.
///
/// `consecutive_network` is the streamer's run of network failures; the
/// delay steps up at 5 and 10. `retry_after` comes from a 429's
/// `Retry-After` header and never shortens the 30 s floor.
pub fn retry_delay(
    kind: ErrorKind,
    consecutive_network: u32,
    retry_after: Option<Duration>,
) -> Duration {
    match kind {
        ErrorKind::Eof => Duration::from_millis(100),
        ErrorKind::RateLimit => retry_after
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_secs(30)),
        ErrorKind::Timeout => Duration::from_secs(2),
        ErrorKind::Network => {
            if consecutive_network >= 10 {
                Duration::from_secs(10)
            } else if consecutive_network >= 5 {
                Duration::from_secs(5)
            } else {
                Duration::from_secs(1)
            }
        }
        ErrorKind::Other => Duration::from_secs(3),
    }
}

/// The Opus encoder both pipelines share the configuration of.
pub struct OpusEncoder {
    inner: coder::Encoder,
    output: [u8; MAX_OPUS_BYTES],
}

impl OpusEncoder {
    pub fn new() -> Result<Self> {
        let mut inner =
            coder::Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        inner.set_bitrate(Bitrate::BitsPerSecond(128_000))?;

        Ok(Self {
            inner,
            output: [0u8; MAX_OPUS_BYTES],
        })
    }

    /// Encodes one full PCM frame (interleaved s16le) into an Opus packet.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes> {
        let len = self.inner.encode(pcm, &mut self.output)?;
        Ok(Bytes::copy_from_slice(&self.output[..len]))
    }
}

/// Converts little-endian PCM bytes into interleaved samples.
pub fn pcm_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// An `ffmpeg` child decoding some source to 48 kHz stereo s16le on
/// stdout, with the volume filter applied.
pub struct Transcoder {
    child: Child,
    stdout: ChildStdout,
}

impl Transcoder {
    /// Decodes a local media file.
    pub fn file(path: &Path, volume: f32) -> Result<Self> {
        let child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(Self::output_args(volume))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Transcoder)?;

        Self::wrap(child)
    }

    /// Decodes whatever is written to the returned stdin handle, with the
    /// input-reconnect options live streams want.
    pub fn stream(volume: f32) -> Result<(Self, ChildStdin)> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "2",
                "-i",
                "pipe:0",
            ])
            .args(Self::output_args(volume))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Transcoder)?;

        let stdin = child.stdin.take().ok_or(Error::Transcoder(
            std::io::Error::other("transcoder stdin unavailable"),
        ))?;

        Ok((Self::wrap(child)?, stdin))
    }

    fn wrap(mut child: Child) -> Result<Self> {
        let stdout = child.stdout.take().ok_or(Error::Transcoder(
            std::io::Error::other("transcoder stdout unavailable"),
        ))?;

        Ok(Self { child, stdout })
    }

    fn output_args(volume: f32) -> Vec<String> {
        vec![
            "-af".to_owned(),
            format!("volume={volume}"),
            "-f".to_owned(),
            "s16le".to_owned(),
            "-ar".to_owned(),
            SAMPLE_RATE.to_string(),
            "-ac".to_owned(),
            CHANNELS.to_string(),
            "pipe:1".to_owned(),
        ]
    }

    /// Reads exactly one frame of PCM, or less at end of stream.
    ///
    /// Returns `None` on a clean EOF at a frame boundary.
    pub async fn read_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.stdout.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Ok((filled > 0).then_some(filled));
            }
            filled += n;
        }

        Ok(Some(filled))
    }

    /// Asks the child to stop: SIGINT, a short grace period, then kill.
    pub async fn shutdown(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal send to our own child process.
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }

            if timeout(TRANSCODER_GRACE, self.child.wait()).await.is_ok() {
                return;
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!("transcoder refused to die: {e}");
        }
    }
}

/// Verifies the transcoder executable is reachable. Called once at
/// startup; absence then is a fatal configuration error.
pub async fn transcoder_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
