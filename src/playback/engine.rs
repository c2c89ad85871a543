//! Player facade
//!
//! [`Player`] ties the pipeline together: it owns the audio output stream,
//! the decode worker thread, the stream queue under the coarse player lock,
//! and the event bus. Control methods are short structure edits under that
//! lock; anything that can block (opening media, tearing a stream down,
//! calling into the host's song source) happens with the lock released.
//! The lock is never held while the device callback runs, which only ever
//! touches the lock-free render structures.

use crate::audio::clip::SmoothClip;
use crate::audio::output::AudioOutput;
use crate::config::PlayerConfig;
use crate::error::Result;
use crate::events::{EventBus, PlaybackState, PlayerEvent};
use crate::playback::fader::{FadeDirection, Fader};
use crate::playback::mixer::{MixerControls, RtMixer};
use crate::playback::queue::StreamQueue;
use crate::playback::worker;
use crate::source::{SongDesc, SongId, SongSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Event channel depth; a subscriber this far behind starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Mutable player state, guarded by the coarse player lock.
pub(crate) struct PlayerState {
    pub(crate) queue: StreamQueue,
    /// Song a control call asked to make current, awaiting worker pickup.
    pub(crate) pending_song: Option<SongDesc>,
    /// Worker should retire the head and move on (explicit skip).
    pub(crate) advance_requested: bool,
    /// Pull the next song at EOF instead of stopping.
    pub(crate) auto_advance: bool,
}

/// State shared between the facade and the decode worker thread.
pub(crate) struct PlayerCore {
    pub(crate) state: Mutex<PlayerState>,
    /// Wakes a parked worker when control state changes.
    pub(crate) wake: Condvar,
    pub(crate) stop: AtomicBool,
    pub(crate) controls: MixerControls,
    pub(crate) fader: Arc<Fader>,
    pub(crate) events: EventBus,
    pub(crate) source: Arc<dyn SongSource>,
    /// Negotiated output rate; streams resample to this.
    pub(crate) sample_rate: u32,
    pub(crate) channels: u16,
    pub(crate) target_fill_bytes: usize,
    pub(crate) peek_count: usize,
}

impl PlayerCore {
    /// The player lock. Poisoning is not propagated; the queue state stays
    /// usable after a panicked holder.
    pub(crate) fn state(&self) -> MutexGuard<'_, PlayerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn wake_worker(&self) {
        self.wake.notify_one();
    }
}

/// The audio player.
///
/// Constructed against a host-provided [`SongSource`]; playback then runs on
/// its own decode thread and the device callback until drop. All control
/// methods are cheap and safe to call from any thread.
pub struct Player {
    core: Arc<PlayerCore>,
    output: AudioOutput,
    worker: Option<thread::JoinHandle<()>>,
}

impl Player {
    /// Open the audio device, start the render callback, and spawn the
    /// decode worker. Playback begins paused; call [`Player::play`].
    pub fn new(config: PlayerConfig, source: Arc<dyn SongSource>) -> Result<Player> {
        config.validate()?;

        let mut output = AudioOutput::open(
            config.device_name.as_deref(),
            config.sample_rate,
            config.channels,
        )?;
        // The device may have negotiated something other than requested;
        // the whole pipeline follows the device.
        let sample_rate = output.sample_rate();
        let channels = output.channels();
        let bytes_per_sec = sample_rate as usize * channels as usize * 4;
        let target_fill_bytes = (bytes_per_sec as f32 * config.target_fill_secs) as usize;

        let (queue, rt_list) = StreamQueue::new(config.peek_count);
        let fader = Arc::new(Fader::new(config.fade_ms));
        let controls = MixerControls::new(config.volume);
        let events = EventBus::new(EVENT_CAPACITY);

        let core = Arc::new(PlayerCore {
            state: Mutex::new(PlayerState {
                queue,
                pending_song: None,
                advance_requested: false,
                auto_advance: config.next_song_on_eof,
            }),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            controls: controls.share(),
            fader: Arc::clone(&fader),
            events,
            source,
            sample_rate,
            channels,
            target_fill_bytes,
            peek_count: config.peek_count,
        });

        let mut mixer = RtMixer::new(
            rt_list,
            fader,
            SmoothClip::new(config.soft_clip_x1, config.soft_clip_x2),
            controls,
            channels,
        );
        output.start(move |data: &mut [f32]| mixer.fill(data))?;

        let worker_core = Arc::clone(&core);
        let worker = thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || worker::run(worker_core))?;

        info!(
            device = %output.device_name(),
            sample_rate,
            channels,
            volume = config.volume,
            "player started"
        );

        Ok(Player {
            core,
            output,
            worker: Some(worker),
        })
    }

    /// Start or resume playback with a fade-in. With nothing queued, the
    /// worker pulls the first song from the source.
    pub fn play(&self) {
        let was_playing = self.core.controls.playing.swap(true, Ordering::Relaxed);
        self.core.fader.change(FadeDirection::In, self.core.sample_rate);
        if !was_playing {
            self.core.events.emit_lossy(PlayerEvent::StateChanged {
                state: PlaybackState::Playing,
            });
        }
        self.core.wake_worker();
    }

    /// Fade out and pause. The callback keeps consuming until the ramp
    /// finishes, then renders silence; buffered audio stays put.
    pub fn pause(&self) {
        let was_playing = self.core.controls.playing.swap(false, Ordering::Relaxed);
        self.core.fader.change(FadeDirection::Out, self.core.sample_rate);
        if was_playing {
            self.core.events.emit_lossy(PlayerEvent::StateChanged {
                state: PlaybackState::Paused,
            });
        }
        self.core.wake_worker();
    }

    pub fn is_playing(&self) -> bool {
        self.core.controls.playing.load(Ordering::Relaxed)
    }

    /// Make `desc` the current song and play it. If the song is already
    /// pre-opened as a peek it is promoted in place rather than reopened.
    pub fn play_song(&self, desc: SongDesc) {
        {
            let mut state = self.core.state();
            state.pending_song = Some(desc);
        }
        self.play();
    }

    /// Drop the current song and advance to whatever comes next. Restarts
    /// the gain ramp so the cut is not audible as a click.
    pub fn skip(&self) {
        {
            let mut state = self.core.state();
            state.advance_requested = true;
        }
        self.core.fader.change(FadeDirection::In, self.core.sample_rate);
        self.core.wake_worker();
    }

    /// Seek the current song to an absolute position in seconds. Serviced
    /// by the decode worker; position updates once the flush completes.
    pub fn seek(&self, seconds: f64) {
        let head = { self.core.state().queue.head().cloned() };
        if let Some(stream) = head {
            stream.request_seek(seconds);
            self.core.wake_worker();
        }
    }

    /// Seek relative to the current position, clamped to the song.
    pub fn seek_by(&self, delta_secs: f64) {
        let head = { self.core.state().queue.head().cloned() };
        if let Some(stream) = head {
            let mut target = (stream.position_secs() + delta_secs).max(0.0);
            if let Some(duration) = stream.duration_secs() {
                target = target.min(duration);
            }
            stream.request_seek(target);
            self.core.wake_worker();
        }
    }

    /// Master volume in [0, 1]; takes effect on the next callback.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.core.controls.set_volume(volume);
        self.core
            .events
            .emit_lossy(PlayerEvent::VolumeChanged { volume });
    }

    pub fn volume(&self) -> f32 {
        self.core.controls.volume()
    }

    /// Consumed-frame clock of the current song, in seconds.
    pub fn position(&self) -> Option<f64> {
        self.core
            .state()
            .queue
            .head()
            .map(|stream| stream.position_secs())
    }

    /// Duration of the current song, `None` when the container does not
    /// report one.
    pub fn duration(&self) -> Option<f64> {
        self.core
            .state()
            .queue
            .head()
            .and_then(|stream| stream.duration_secs())
    }

    pub fn current_song(&self) -> Option<SongId> {
        self.core.state().queue.head().map(|stream| stream.id())
    }

    /// Toggle pulling the next song at EOF. When disabled, the player
    /// pauses at the end of the current song.
    pub fn set_auto_advance(&self, enabled: bool) {
        {
            let mut state = self.core.state();
            state.auto_advance = enabled;
        }
        self.core.wake_worker();
    }

    pub fn auto_advance(&self) -> bool {
        self.core.state().auto_advance
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.core.events.subscribe()
    }

    /// Underrun episodes since start.
    pub fn underrun_count(&self) -> u64 {
        self.core.controls.underruns.load(Ordering::Relaxed)
    }

    /// Device callback reported an error since the last check.
    pub fn output_error(&self) -> bool {
        self.output.has_error()
    }

    /// Negotiated output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.core.sample_rate
    }

    fn shutdown(&mut self) {
        // Teardown does not wait on an in-flight ramp; snap it to its end
        // so the remaining callbacks render a steady gain.
        self.core.fader.finish();
        self.core.stop.store(true, Ordering::Release);
        self.core.wake.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("decode worker panicked during shutdown");
            }
        }
        if let Err(e) = self.output.stop() {
            warn!(error = %e, "audio output did not stop cleanly");
        }
        // Stream teardown happens here, after the lock is released.
        let retired = {
            let mut state = self.core.state();
            let mut retired = state.queue.clear();
            retired.extend(state.queue.take_recovered());
            retired
        };
        drop(retired);
        info!("player stopped");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}
