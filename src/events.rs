//! Event system for the player core
//!
//! One-to-many broadcasting over `tokio::sync::broadcast`. Emission is
//! non-blocking and lossy toward slow subscribers, which keeps the decode
//! and control paths from ever stalling on an observer. Nothing on the
//! real-time output path emits events directly; the mixer records underruns
//! in atomics and the worker turns them into events off the hot path.

use crate::source::SongId;
use tokio::sync::broadcast;
use tracing::debug;

/// Playback state as reported to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
}

/// Events emitted by the player
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// A song became the current (head) stream and produced its first audio
    SongStarted { song: SongId },

    /// The current song was fully played out and retired
    SongFinished { song: SongId },

    /// The current song changed (skip, overtake, or auto-advance)
    SongChanged {
        old: Option<SongId>,
        new: Option<SongId>,
    },

    /// Play/pause state changed
    StateChanged { state: PlaybackState },

    /// Master volume changed
    VolumeChanged { volume: f32 },

    /// The upcoming-stream queue was reconciled against the host list
    QueueChanged,

    /// The output callback ran short of decoded audio
    Underrun { missing_frames: u64 },

    /// A stream failed to open or decode and was skipped
    SongFailed { song: SongId, message: String },
}

/// Broadcast bus for [`PlayerEvent`]
///
/// Clone freely; all clones share one channel. Subscribers receive events
/// emitted after they subscribe and may lag (old events are dropped for
/// that subscriber only).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; `Err` means no subscriber is listening.
    pub fn emit(
        &self,
        event: PlayerEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case.
    pub fn emit_lossy(&self, event: PlayerEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(?event, "event dropped (no subscribers)");
        }
    }

    /// Channel capacity this bus was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
