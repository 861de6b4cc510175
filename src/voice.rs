//! The single voice-channel slot and the gateway seam.
//!
//! The platform gateway library is an external collaborator; this module
//! only defines the boundary it must satisfy ([`Gateway`]) and the owner
//! of the one connection the service holds ([`Voice`]). Join and leave are
//! guarded by the state store's operation flags so overlapping operations
//! and shutdown races cannot produce two live connections.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::{Op, State};

/// Shorthand for a [`Result`] with a voice error.
pub type Result<T> = std::result::Result<T, Error>;

/// Pause between a disconnect and the follow-up join.
const REJOIN_DELAY: Duration = Duration::from_millis(500);

/// Time given to the voice handshake after a successful join.
const HANDSHAKE_DELAY: Duration = Duration::from_millis(300);

/// Join attempts before giving up.
const JOIN_ATTEMPTS: u32 = 3;

/// Errors for join/leave operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shutting down")]
    ShuttingDown,

    #[error("another operation is in progress")]
    Busy,

    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("gateway failure: {0}")]
    Gateway(String),
}

/// Commands the platform adapter services for a live connection.
#[derive(Debug)]
pub enum VoiceControl {
    /// Toggle the speaking indicator.
    Speaking(bool),

    /// Tear the connection down.
    Disconnect,
}

/// A live attachment to one voice channel.
///
/// Opus frames flow through `frames`; everything else goes over the
/// control channel. Dropping the handle without [`VoiceHandle::disconnect`]
/// leaves teardown to the adapter noticing the closed channels.
#[derive(Debug)]
pub struct VoiceHandle {
    channel_id: u64,
    frames: mpsc::Sender<Bytes>,
    control: mpsc::UnboundedSender<VoiceControl>,
}

impl VoiceHandle {
    pub fn new(
        channel_id: u64,
        frames: mpsc::Sender<Bytes>,
        control: mpsc::UnboundedSender<VoiceControl>,
    ) -> Self {
        Self {
            channel_id,
            frames,
            control,
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// A clone of the Opus frame sender for a playback task.
    pub fn frames(&self) -> mpsc::Sender<Bytes> {
        self.frames.clone()
    }

    pub fn set_speaking(&self, speaking: bool) {
        let _ = self.control.send(VoiceControl::Speaking(speaking));
    }

    fn disconnect(&self) {
        let _ = self.control.send(VoiceControl::Disconnect);
    }
}

/// The seam the platform adapter implements.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Attaches to a voice channel and returns the live handle.
    async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<VoiceHandle>;
}

/// Owner of the service's one voice connection.
pub struct Voice {
    state: Arc<State>,
    gateway: Arc<dyn Gateway>,
    guild_id: u64,
    slot: Mutex<Option<VoiceHandle>>,
}

impl Voice {
    pub fn new(state: Arc<State>, gateway: Arc<dyn Gateway>, guild_id: u64) -> Arc<Self> {
        Arc::new(Self {
            state,
            gateway,
            guild_id,
            slot: Mutex::new(None),
        })
    }

    /// Joins `channel_id`, retrying with a growing delay.
    ///
    /// Rejected during shutdown or while another guarded operation runs.
    /// Joining the channel we already occupy is a no-op.
    pub async fn join(&self, channel_id: u64) -> Result<()> {
        if self.state.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        if self.state.current_channel() == Some(channel_id) && self.state.connected() {
            return Ok(());
        }

        let Some(_guard) = self.state.try_op_guard(Op::Joining) else {
            return Err(Error::Busy);
        };

        if self.state.connected() {
            self.drop_handle();
            tokio::time::sleep(REJOIN_DELAY).await;
        }

        let mut last_error = Error::NotConnected;
        for attempt in 1..=JOIN_ATTEMPTS {
            match self.gateway.connect(self.guild_id, channel_id).await {
                Ok(handle) => {
                    *self.slot.lock() = Some(handle);
                    self.state.set_connected(true);
                    self.state.set_current_channel(Some(channel_id));

                    // Give the voice handshake a moment before frames flow.
                    tokio::time::sleep(HANDSHAKE_DELAY).await;

                    info!(channel = channel_id, "joined voice channel");
                    return Ok(());
                }
                Err(e) => {
                    warn!(channel = channel_id, attempt, "join failed: {e}");
                    last_error = e;

                    if attempt < JOIN_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(2 * u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Disconnects and clears the current channel. Tolerates shutdown.
    pub async fn leave(&self) {
        let _guard = self.state.op_guard(Op::Leaving);

        self.drop_handle();
        self.state.set_current_channel(None);
    }

    /// Reacts to an unexpected platform disconnect: local state only, no
    /// rejoin here. The supervisor decides whether to return to idle.
    pub fn handle_disconnect(&self) {
        warn!("voice connection dropped by the platform");

        *self.slot.lock() = None;
        self.state.set_connected(false);
        self.state.set_current_channel(None);
    }

    /// Whether a handle currently occupies the slot.
    pub fn is_connected(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Frame sender of the live connection, for playback tasks.
    pub fn frame_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.slot.lock().as_ref().map(VoiceHandle::frames)
    }

    /// Speaking indicator passthrough; ignored when not connected.
    pub fn set_speaking(&self, speaking: bool) {
        if let Some(handle) = self.slot.lock().as_ref() {
            handle.set_speaking(speaking);
        }
    }

    /// Flags shutdown in the store and disconnects.
    pub async fn shutdown(&self) {
        self.state.set_shutting_down();
        self.drop_handle();
        self.state.set_current_channel(None);
    }

    fn drop_handle(&self) {
        if let Some(handle) = self.slot.lock().take() {
            handle.disconnect();
        }
        self.state.set_connected(false);
    }
}
