//! The network-backed radio streamer.
//!
//! One streaming task per station. The inner cycle pulls the HTTP body
//! through the transcoder and pushes Opus frames to the voice connection;
//! the outer loop classifies whatever ended the cycle and reconnects with
//! a delay derived from the error kind. Live radio is expected to drop
//! out; only cancellation, shutdown, or a missing voice connection end
//! the task.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use reqwest::Client;
use tokio::{io::AsyncWriteExt, sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    playback::{
        self, classify, retry_delay, ErrorKind, OpusEncoder, Transcoder, FRAME_PCM_BYTES,
        FRAME_SEND_TIMEOUT,
    },
    state::{Op, State},
    voice::Voice,
};

use super::{Error, Result};

/// Deadline for one PCM frame read off the transcoder.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the HTTP response headers.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` waits for the streaming task.
const STOP_GRACE: Duration = Duration::from_secs(3);

struct Active {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl Active {
    fn finished(&self) -> bool {
        *self.done.borrow()
    }
}

/// The radio streamer. At most one streaming task per instance.
pub struct Radio {
    state: Arc<State>,
    voice: Arc<Voice>,
    client: Client,
    active: Mutex<Option<Active>>,
}

impl Radio {
    pub fn new(state: Arc<State>, voice: Arc<Voice>) -> Result<Arc<Self>> {
        let client = Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Arc::new(Self {
            state,
            voice,
            client,
            active: Mutex::new(None),
        }))
    }

    pub fn is_streaming(&self) -> bool {
        self.active.lock().as_ref().is_some_and(|a| !a.finished())
    }

    /// Starts streaming `url` until stopped.
    pub fn start(self: &Arc<Self>, url: String) -> Result<()> {
        if self.state.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(previous) if !previous.finished() => return Err(Error::Busy),
                _ => *active = None,
            }
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        *self.active.lock() = Some(Active {
            cancel: cancel.clone(),
            done: done_rx,
        });

        self.state.set_op(Op::Streaming, true);
        info!(%url, "radio starting");

        let radio = Arc::clone(self);
        tokio::spawn(async move {
            radio.run(&url, &cancel).await;
            radio.state.set_op(Op::Streaming, false);
            let _ = done_tx.send(true);
            debug!("radio task gone");
        });

        Ok(())
    }

    /// Stops the stream and waits briefly for the task.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        active.cancel.cancel();
        let mut done = active.done;
        let _ = timeout(STOP_GRACE, done.wait_for(|finished| *finished)).await;

        info!("radio stopped");
    }

    pub async fn shutdown(&self) {
        self.stop().await;
    }

    /// Outer reconnect loop.
    async fn run(&self, url: &str, cancel: &CancellationToken) {
        let mut consecutive_network = 0u32;

        loop {
            if cancel.is_cancelled() || self.state.is_shutting_down() {
                return;
            }
            if self.voice.frame_sender().is_none() {
                warn!("radio has no voice connection, giving up");
                return;
            }

            let error = match self.cycle(url, cancel, &mut consecutive_network).await {
                // A cycle only returns cleanly when asked to stop.
                Ok(()) => return,
                Err(e) => e,
            };

            let kind = classify(&error);
            if kind == ErrorKind::Network {
                consecutive_network += 1;
            }

            let retry_after = match error {
                Error::HttpStatus(429, secs) => secs.map(Duration::from_secs),
                _ => None,
            };

            let delay = retry_delay(kind, consecutive_network, retry_after);
            warn!(?kind, ?delay, "radio cycle ended: {error}");

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connect-decode-stream cycle. Resets the network counter after
    /// the first frame reaches the voice connection.
    async fn cycle(
        &self,
        url: &str,
        cancel: &CancellationToken,
        consecutive_network: &mut u32,
    ) -> Result<()> {
        let Some(frames) = self.voice.frame_sender() else {
            return Err(Error::NotConnected);
        };

        let response = match timeout(RESPONSE_TIMEOUT, self.client.get(url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::ReadTimeout),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            return Err(Error::HttpStatus(429, retry_after));
        }
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16(), None));
        }

        // Volume changes apply here, on the next reconnect cycle.
        let (mut transcoder, mut stdin) = Transcoder::stream(self.state.volume())?;
        let mut encoder = OpusEncoder::new()?;

        // Feed the HTTP body into the transcoder from the side.
        let feeder = tokio::spawn(async move {
            let mut response = response;
            while let Ok(Some(chunk)) = response.chunk().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        self.voice.set_speaking(true);

        let result = self
            .pump(&mut transcoder, &mut encoder, &frames, cancel, consecutive_network)
            .await;

        self.voice.set_speaking(false);
        feeder.abort();
        transcoder.shutdown().await;

        result
    }

    async fn pump(
        &self,
        transcoder: &mut Transcoder,
        encoder: &mut OpusEncoder,
        frames: &tokio::sync::mpsc::Sender<bytes::Bytes>,
        cancel: &CancellationToken,
        consecutive_network: &mut u32,
    ) -> Result<()> {
        let mut buf = vec![0u8; FRAME_PCM_BYTES];
        let mut streamed_any = false;

        loop {
            if self.state.is_shutting_down() {
                return Ok(());
            }

            let read = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                read = timeout(FRAME_READ_TIMEOUT, transcoder.read_frame(&mut buf)) => read,
            };

            let filled = match read {
                Ok(Ok(Some(filled))) => filled,
                Ok(Ok(None)) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::ReadTimeout),
            };

            buf[filled..].fill(0);

            let pcm = playback::pcm_from_bytes(&buf);
            let packet = encoder.encode(&pcm)?;

            match timeout(FRAME_SEND_TIMEOUT, frames.send(packet)).await {
                Ok(Ok(())) => {
                    if !streamed_any {
                        streamed_any = true;
                        *consecutive_network = 0;
                    }
                }
                Ok(Err(_)) => return Err(Error::NotConnected),
                Err(_) => return Err(Error::SendTimeout),
            }
        }
    }
}
