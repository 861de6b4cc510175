//! The file-backed track player.
//!
//! One playback task per song: read PCM from the transcoder, encode,
//! push frames into the voice connection. Control state (cancellation
//! token, done signal, callback suppression) is created fresh for every
//! `play`, so a stale stop aimed at a previous task can never hit the
//! new one.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    playback::{
        self, classify, ErrorKind, OpusEncoder, Transcoder, FRAME_PCM_BYTES, FRAME_SEND_TIMEOUT,
    },
    state::{Op, State},
    tracks::Song,
    voice::Voice,
};

use super::{Error, Result};

/// How long `stop` waits for the playback task to acknowledge before the
/// player is considered free anyway.
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

/// Callback slot fired when a song finishes or is stopped (never on pause).
type OnSongEnd = Box<dyn Fn() + Send + Sync>;

/// Control handles of the one in-flight playback task.
struct Active {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,

    /// Set by pause so the end callback stays silent.
    quiet: Arc<AtomicBool>,
}

impl Active {
    fn finished(&self) -> bool {
        *self.done.borrow()
    }
}

/// The track player. At most one playback task exists per instance.
pub struct Player {
    state: Arc<State>,
    voice: Arc<Voice>,

    active: Mutex<Option<Active>>,

    /// Held across the awaits inside `play`, where the `active` slot alone
    /// can't exclude a second caller yet.
    starting: AtomicBool,

    /// The song a paused player resumes (from the beginning).
    resume_slot: Mutex<Option<Song>>,
    paused: AtomicBool,

    /// Shared with playback tasks so they can fire it at end of song.
    on_song_end: Arc<Mutex<Option<OnSongEnd>>>,
}

impl Player {
    pub fn new(state: Arc<State>, voice: Arc<Voice>) -> Arc<Self> {
        Arc::new(Self {
            state,
            voice,
            active: Mutex::new(None),
            starting: AtomicBool::new(false),
            resume_slot: Mutex::new(None),
            paused: AtomicBool::new(false),
            on_song_end: Arc::new(Mutex::new(None)),
        })
    }

    /// Installs the song-end callback. One slot; later calls replace it.
    pub fn set_on_song_end(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_song_end.lock() = Some(Box::new(callback));
    }

    /// Whether a playback task is currently alive.
    pub fn is_playing(&self) -> bool {
        self.active.lock().as_ref().is_some_and(|a| !a.finished())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Starts playing `song` from its local file.
    ///
    /// Errors while a previous task still runs; a finished task's slot is
    /// reclaimed here.
    pub async fn play(&self, song: Song) -> Result<()> {
        if self.state.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        let _starting = StartGuard(&self.starting);

        {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(previous) if !previous.finished() => return Err(Error::Busy),
                _ => *active = None,
            }
        }

        let Some(frames) = self.voice.frame_sender() else {
            return Err(Error::NotConnected);
        };

        let path = song
            .path()
            .ok_or_else(|| Error::MissingFile(song.url.clone()))?
            .to_path_buf();
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(Error::MissingFile(path.display().to_string()));
        }

        // Volume is sampled once; changes apply from the next track.
        let transcoder = Transcoder::file(&path, self.state.volume())?;
        let encoder = OpusEncoder::new()?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let quiet = Arc::new(AtomicBool::new(false));

        *self.active.lock() = Some(Active {
            cancel: cancel.clone(),
            done: done_rx,
            quiet: Arc::clone(&quiet),
        });
        *self.resume_slot.lock() = Some(song.clone());
        self.paused.store(false, Ordering::Release);

        self.state.set_op(Op::Playing, true);
        self.voice.set_speaking(true);

        info!(title = %song.title, "playing track");

        let state = Arc::clone(&self.state);
        let voice = Arc::clone(&self.voice);
        let on_end = Arc::clone(&self.on_song_end);

        tokio::spawn(async move {
            let result = pump(transcoder, encoder, &frames, &cancel).await;

            voice.set_speaking(false);
            state.set_op(Op::Playing, false);

            // A dead or saturated voice connection is not a song end; the
            // supervisor's disconnect path owns what happens next.
            let silent = quiet.load(Ordering::Acquire)
                || matches!(result, Err(Error::SendTimeout | Error::NotConnected));
            match result {
                Ok(()) => debug!("track finished"),
                Err(e) => warn!("track ended early: {e}"),
            }

            if !silent {
                if let Some(callback) = on_end.lock().as_ref() {
                    callback();
                }
            }

            let _ = done_tx.send(true);
        });

        Ok(())
    }

    /// Stops the current track, waiting briefly for the task to wind down.
    ///
    /// The song-end callback fires (an external stop counts as an end);
    /// callers that must not react to it latch the manual-operation flag
    /// first.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        active.cancel.cancel();
        Self::wait_done(active.done).await;
    }

    /// Pauses by cancelling the task; resume restarts the same song from
    /// the beginning. Pausing while paused (or idle) is a no-op.
    pub async fn pause(&self) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        let Some(active) = self.active.lock().take() else {
            return;
        };

        self.paused.store(true, Ordering::Release);
        active.quiet.store(true, Ordering::Release);
        active.cancel.cancel();
        Self::wait_done(active.done).await;

        info!("playback paused");
    }

    /// Restarts the paused song. A no-op during shutdown or when nothing
    /// is paused.
    pub async fn resume(&self) -> Result<()> {
        if self.state.is_shutting_down() {
            return Ok(());
        }
        if !self.paused.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(song) = self.resume_slot.lock().clone() else {
            return Ok(());
        };

        info!(title = %song.title, "resuming track from the start");
        self.play(song).await
    }

    /// Stops playback and drops control state for teardown.
    pub async fn shutdown(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.quiet.store(true, Ordering::Release);
            active.cancel.cancel();
            Self::wait_done(active.done).await;
        }

        *self.resume_slot.lock() = None;
        *self.on_song_end.lock() = None;
    }

    async fn wait_done(mut done: watch::Receiver<bool>) {
        let _ = timeout(STOP_GRACE, done.wait_for(|finished| *finished)).await;
    }
}

/// Clears the `starting` latch when `play` returns, on every path.
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The read → encode → send loop.
async fn pump(
    mut transcoder: Transcoder,
    mut encoder: OpusEncoder,
    frames: &tokio::sync::mpsc::Sender<bytes::Bytes>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; FRAME_PCM_BYTES];

    let result = loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            read = transcoder.read_frame(&mut buf) => read,
        };

        let filled = match read {
            Ok(Some(filled)) => filled,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        // A short tail is padded with silence to a whole frame.
        buf[filled..].fill(0);

        let pcm = playback::pcm_from_bytes(&buf);
        let packet = match encoder.encode(&pcm) {
            Ok(packet) => packet,
            Err(e) => break Err(e.into()),
        };

        match timeout(FRAME_SEND_TIMEOUT, frames.send(packet)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break Err(Error::NotConnected),
            Err(_) => break Err(Error::SendTimeout),
        }

        if filled < buf.len() {
            // Padded tail was the last frame.
            break Ok(());
        }
    };

    // Classification is only used for logging here; tracks don't retry.
    if let Err(e) = &result {
        let kind = classify(e);
        if kind != ErrorKind::Eof {
            debug!(?kind, "track pipeline error");
        }
    }

    transcoder.shutdown().await;
    result
}
