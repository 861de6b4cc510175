//! Stand-in gateway adapter.
//!
//! The real chat platform adapter lives outside this crate and implements
//! [`Gateway`] over the platform's voice stack. [`Headless`] satisfies the
//! same seam for local runs: joins always succeed and Opus frames are
//! drained and discarded at their natural pace.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::voice::{Gateway, Result, VoiceControl, VoiceHandle};

/// Frames buffered towards the adapter before senders start blocking.
const FRAME_BUFFER: usize = 16;

/// A gateway with no platform behind it.
pub struct Headless;

#[async_trait]
impl Gateway for Headless {
    async fn connect(&self, guild_id: u64, channel_id: u64) -> Result<VoiceHandle> {
        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        debug!(guild_id, channel_id, "headless gateway connect");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames_rx.recv() => {
                        if frame.is_none() {
                            break;
                        }
                    }
                    control = control_rx.recv() => match control {
                        Some(VoiceControl::Speaking(speaking)) => {
                            debug!(speaking, "headless speaking change");
                        }
                        Some(VoiceControl::Disconnect) | None => break,
                    },
                }
            }

            debug!(channel_id, "headless gateway disconnected");
        });

        Ok(VoiceHandle::new(channel_id, frames_tx, control_tx))
    }
}
