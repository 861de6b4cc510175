//! Process-wide mutable state behind a single read/write lock.
//!
//! Every component reads its guards from here: the current mode, the
//! operation flags, the volume, and the shutdown latch. Setters for
//! operation flags and activity become no-ops once shutdown begins, so a
//! late writer can never re-mark the system busy while it is tearing down.

use std::time::Instant;

use parking_lot::RwLock;

/// Lower bound of the stored volume. Values map directly onto the
/// transcoder's `volume=` filter.
pub const MIN_VOLUME: f32 = 0.01;

/// Upper bound of the stored volume.
pub const MAX_VOLUME: f32 = 0.10;

/// What the service is doing with its one voice connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Parked in the idle channel, emitting nothing.
    #[default]
    Idle,

    /// Streaming a live radio source.
    Radio,

    /// Playing user-queued tracks.
    Dj,

    /// Between modes during a user-initiated switch.
    Transitioning,
}

/// A long-running operation currently holding a flag in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Joining,
    Leaving,
    Streaming,
    Playing,
}

#[derive(Debug)]
struct Inner {
    mode: Mode,
    shutting_down: bool,
    manual_operation: bool,

    joining: bool,
    leaving: bool,
    streaming: bool,
    playing: bool,

    volume: f32,
    radio_stream: String,

    connected: bool,
    current_channel: Option<u64>,
    idle_channel: u64,

    last_activity: Instant,
}

/// The shared state store.
///
/// All accessors take the lock for the duration of the call only; nothing
/// here blocks or awaits.
#[derive(Debug)]
pub struct State {
    inner: RwLock<Inner>,
}

impl State {
    /// Creates the store with the configured defaults.
    ///
    /// An out-of-range `volume` falls back to the midpoint rather than
    /// being stored, keeping the invariant that reads are always in range.
    pub fn new(volume: f32, radio_stream: String, idle_channel: u64) -> Self {
        let volume = if (MIN_VOLUME..=MAX_VOLUME).contains(&volume) {
            volume
        } else {
            (MIN_VOLUME + MAX_VOLUME) / 2.0
        };

        Self {
            inner: RwLock::new(Inner {
                mode: Mode::Idle,
                shutting_down: false,
                manual_operation: false,
                joining: false,
                leaving: false,
                streaming: false,
                playing: false,
                volume,
                radio_stream,
                connected: false,
                current_channel: None,
                idle_channel,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.read().mode
    }

    /// Swaps the mode, returning the previous one. Counts as activity.
    pub fn set_mode(&self, mode: Mode) -> Mode {
        let mut inner = self.inner.write();
        let previous = inner.mode;
        inner.mode = mode;
        if !inner.shutting_down {
            inner.last_activity = Instant::now();
        }
        previous
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.read().shutting_down
    }

    pub fn set_shutting_down(&self) {
        self.inner.write().shutting_down = true;
    }

    pub fn manual_operation(&self) -> bool {
        self.inner.read().manual_operation
    }

    /// Latches (or releases) the manual-operation flag that suppresses
    /// automatic reactions while a multi-step command runs.
    pub fn set_manual_operation(&self, active: bool) {
        self.inner.write().manual_operation = active;
    }

    /// Sets one operation flag. A no-op during shutdown.
    pub fn set_op(&self, op: Op, active: bool) {
        let mut inner = self.inner.write();
        if inner.shutting_down {
            return;
        }

        match op {
            Op::Joining => inner.joining = active,
            Op::Leaving => inner.leaving = active,
            Op::Streaming => inner.streaming = active,
            Op::Playing => inner.playing = active,
        }

        if active {
            inner.last_activity = Instant::now();
        }
    }

    /// Sets an operation flag and returns a guard that clears it on drop,
    /// so early returns cannot leave a stale flag behind.
    pub fn op_guard(&self, op: Op) -> OpGuard<'_> {
        self.set_op(op, true);
        OpGuard { state: self, op }
    }

    /// Claims an operation flag only if no other operation holds one,
    /// atomically under the store's lock. `None` means busy.
    pub fn try_op_guard(&self, op: Op) -> Option<OpGuard<'_>> {
        {
            let mut inner = self.inner.write();
            if !inner.shutting_down
                && (inner.joining || inner.leaving || inner.streaming || inner.playing)
            {
                return None;
            }

            if !inner.shutting_down {
                match op {
                    Op::Joining => inner.joining = true,
                    Op::Leaving => inner.leaving = true,
                    Op::Streaming => inner.streaming = true,
                    Op::Playing => inner.playing = true,
                }
                inner.last_activity = Instant::now();
            }
        }

        Some(OpGuard { state: self, op })
    }

    /// True iff any operation flag is set and the store is not shutting
    /// down. During shutdown this is always false so teardown is never
    /// blocked by stale flags.
    pub fn operation_in_progress(&self) -> bool {
        let inner = self.inner.read();
        !inner.shutting_down
            && (inner.joining || inner.leaving || inner.streaming || inner.playing)
    }

    pub fn volume(&self) -> f32 {
        self.inner.read().volume
    }

    /// Stores `volume` if it lies inside `[MIN_VOLUME, MAX_VOLUME]`.
    ///
    /// Returns whether the value was accepted; out-of-range values leave
    /// the stored volume untouched.
    pub fn set_volume(&self, volume: f32) -> bool {
        if !(MIN_VOLUME..=MAX_VOLUME).contains(&volume) {
            return false;
        }

        self.inner.write().volume = volume;
        true
    }

    pub fn radio_stream(&self) -> String {
        self.inner.read().radio_stream.clone()
    }

    pub fn set_radio_stream(&self, url: String) {
        self.inner.write().radio_stream = url;
    }

    pub fn connected(&self) -> bool {
        self.inner.read().connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.write().connected = connected;
    }

    pub fn current_channel(&self) -> Option<u64> {
        self.inner.read().current_channel
    }

    pub fn set_current_channel(&self, channel: Option<u64>) {
        self.inner.write().current_channel = channel;
    }

    pub fn idle_channel(&self) -> u64 {
        self.inner.read().idle_channel
    }

    /// Whether the voice connection currently sits in the idle channel.
    pub fn in_idle_channel(&self) -> bool {
        let inner = self.inner.read();
        inner.current_channel == Some(inner.idle_channel)
    }

    /// Marks user-visible activity, resetting the idle watchdog.
    /// A no-op during shutdown.
    pub fn touch(&self) {
        let mut inner = self.inner.write();
        if !inner.shutting_down {
            inner.last_activity = Instant::now();
        }
    }

    /// Seconds since the last recorded activity.
    pub fn idle_for_secs(&self) -> u64 {
        self.inner.read().last_activity.elapsed().as_secs()
    }
}

/// Clears its operation flag when dropped. See [`State::op_guard`].
pub struct OpGuard<'a> {
    state: &'a State,
    op: Op,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.state.set_op(self.op, false);
    }
}
