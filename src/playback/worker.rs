//! Background decode loop
//!
//! One std thread runs [`run`] until the stop flag is raised. Each iteration
//! resolves which stream should be head, retires streams the output has
//! played out, pulls the next song early when the head runs out of input
//! with nothing queued behind it, reconciles the peek tail against the
//! host's upcoming list, and tops up every stream's buffer. All blocking
//! work (media opens, decode bursts, stream teardown, host source calls)
//! happens with the player lock released; the lock only ever guards short
//! structure edits. An iteration
//! that does nothing parks on the condvar with a short timeout, so control
//! changes are observed within [`PARK_INTERVAL`] even when a wakeup is
//! missed.

use crate::events::{PlaybackState, PlayerEvent};
use crate::playback::engine::PlayerCore;
use crate::playback::stream::SongStream;
use crate::source::{SongDesc, SongId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Idle park timeout; bounds how stale the worker's view can get.
pub(crate) const PARK_INTERVAL: Duration = Duration::from_millis(10);

/// How long a song that failed to open is ignored before a retry.
const REOPEN_BACKOFF: Duration = Duration::from_secs(5);

/// Worker-thread private bookkeeping.
#[derive(Default)]
struct WorkerLocal {
    /// Underrun episodes already turned into events.
    reported_underruns: u64,
    /// Recent open failures, suppressed until their backoff expires.
    failed_opens: Vec<(SongId, Instant)>,
    /// Head id an end-of-input next-song pull was already made for.
    eof_requested: Option<SongId>,
    /// Successor that pull appended; kept ahead of host reconciliation
    /// until it becomes head or leaves the queue.
    eof_successor: Option<SongId>,
}

impl WorkerLocal {
    fn suppressed(&mut self, song: SongId) -> bool {
        let now = Instant::now();
        self.failed_opens
            .retain(|(_, at)| now.duration_since(*at) < REOPEN_BACKOFF);
        self.failed_opens.iter().any(|(id, _)| *id == song)
    }

    fn record_failure(&mut self, song: SongId) {
        self.failed_opens.push((song, Instant::now()));
    }
}

/// Worker entry point; returns when the stop flag is observed.
pub(crate) fn run(core: Arc<PlayerCore>) {
    info!("decode worker started");
    let mut local = WorkerLocal::default();
    while !core.stop.load(Ordering::Acquire) {
        let did_work = iteration(&core, &mut local);
        if !did_work && !core.stop.load(Ordering::Acquire) {
            park(&core);
        }
    }
    info!("decode worker stopped");
}

fn iteration(core: &Arc<PlayerCore>, local: &mut WorkerLocal) -> bool {
    let mut did_work = false;
    did_work |= service_skip(core);
    did_work |= ensure_head(core, local);
    did_work |= retire_finished(core);
    did_work |= eof_advance(core, local);
    did_work |= refresh_peeks(core, local);
    did_work |= fill_buffers(core);
    sweep_recovered(core);
    notify(core, local);
    did_work
}

/// Collect stream copies the queue's slot list rescued during earlier
/// edits (a render guard can keep a retired head's parked copy alive past
/// its drain) and drop them with the lock released.
fn sweep_recovered(core: &Arc<PlayerCore>) {
    let recovered = { core.state().queue.take_recovered() };
    drop(recovered);
}

/// A skip retires the head immediately. The next peek is already the new
/// head as far as the render path is concerned; with no peeks,
/// `ensure_head` pulls the next song right after.
fn service_skip(core: &Arc<PlayerCore>) -> bool {
    let (retired, new_head) = {
        let mut state = core.state();
        if !state.advance_requested {
            return false;
        }
        state.advance_requested = false;
        let retired = state.queue.pop_head();
        (retired, state.queue.head().map(|s| s.id()))
    };
    let Some(old) = retired else {
        return true;
    };
    debug!(song = %old.id(), "skip requested, retiring current song");
    core.events.emit_lossy(PlayerEvent::SongChanged {
        old: Some(old.id()),
        new: new_head,
    });
    true
}

/// Make the head stream match what the control side asked for, promoting a
/// matching peek (overtake) before opening anything. With nothing queued
/// and playback wanted, fall back to the host source.
fn ensure_head(core: &Arc<PlayerCore>, local: &mut WorkerLocal) -> bool {
    let pending = {
        let mut state = core.state();
        match state.pending_song.take() {
            Some(desc) => {
                let old = state.queue.head().map(|s| s.id());
                if old == Some(desc.id) {
                    debug!(song = %desc.id, "requested song is already current");
                    return false;
                }
                if let Some(retired) = state.queue.promote(desc.id) {
                    drop(state);
                    core.events.emit_lossy(PlayerEvent::SongChanged {
                        old,
                        new: Some(desc.id),
                    });
                    drop(retired);
                    return true;
                }
                Some(desc)
            }
            None => None,
        }
    };
    if let Some(desc) = pending {
        return install_head(core, desc, local);
    }

    if !core.controls.playing.load(Ordering::Relaxed) {
        return false;
    }
    let queue_empty = { core.state().queue.is_empty() };
    if !queue_empty {
        return false;
    }
    let Some(desc) = core.source.next_song() else {
        return false;
    };
    if local.suppressed(desc.id) {
        return false;
    }
    debug!(song = %desc.id, label = %desc.label, "pulled next song from source");
    install_head(core, desc, local)
}

/// Open `desc` (no lock held) and install it as head.
fn install_head(core: &Arc<PlayerCore>, desc: SongDesc, local: &mut WorkerLocal) -> bool {
    let song = desc.id;
    match SongStream::open(desc, core.sample_rate, core.channels) {
        Ok(stream) => {
            let (old, retired) = {
                let mut state = core.state();
                let old = state.queue.head().map(|s| s.id());
                let retired = state.queue.set_head(stream);
                (old, retired)
            };
            core.events.emit_lossy(PlayerEvent::SongChanged {
                old,
                new: Some(song),
            });
            drop(retired);
            true
        }
        Err(e) => {
            warn!(song = %song, error = %e, "failed to open song");
            local.record_failure(song);
            core.events.emit_lossy(PlayerEvent::SongFailed {
                song,
                message: e.to_string(),
            });
            true
        }
    }
}

/// Retire a head the output has fully played out. With auto-advance off
/// this is where playback stops.
fn retire_finished(core: &Arc<PlayerCore>) -> bool {
    let (finished, new_head, auto_advance) = {
        let mut state = core.state();
        let done = state.queue.head().map_or(false, |h| h.player_hit_end());
        if !done {
            return false;
        }
        let finished = state.queue.pop_head();
        (
            finished,
            state.queue.head().map(|s| s.id()),
            state.auto_advance,
        )
    };
    let Some(stream) = finished else {
        return false;
    };
    info!(song = %stream.id(), label = %stream.desc().label, "song finished");
    core.events.emit_lossy(PlayerEvent::SongFinished { song: stream.id() });
    core.events.emit_lossy(PlayerEvent::SongChanged {
        old: Some(stream.id()),
        new: new_head,
    });
    if !auto_advance && core.controls.playing.swap(false, Ordering::Relaxed) {
        core.events.emit_lossy(PlayerEvent::StateChanged {
            state: PlaybackState::Paused,
        });
    }
    // Stream teardown happens here, outside the lock.
    true
}

/// When the head has no more input and nothing is queued behind it, pull
/// the next song from the source right away so playback can roll straight
/// into it. Hosts that answer `next_song` but publish no upcoming list get
/// gapless transitions through this path.
///
/// One pull per head: `eof_requested` latches on success, and the latch
/// drops as soon as that head is gone.
fn eof_advance(core: &Arc<PlayerCore>, local: &mut WorkerLocal) -> bool {
    let head = {
        let state = core.state();
        let head_id = state.queue.head().map(|h| h.id());
        if local.eof_requested != head_id {
            local.eof_requested = None;
        }
        if let Some(succ) = local.eof_successor {
            if head_id == Some(succ) || state.queue.find(succ).is_none() {
                local.eof_successor = None;
            }
        }
        if state.queue.len() != 1 || !state.auto_advance {
            return false;
        }
        state.queue.head().cloned()
    };
    if !core.controls.playing.load(Ordering::Relaxed) {
        return false;
    }
    let Some(head) = head else {
        return false;
    };
    let head_id = head.id();
    if !head.reader_hit_end() || local.eof_requested == Some(head_id) {
        return false;
    }

    let Some(desc) = core.source.next_song() else {
        return false;
    };
    if local.suppressed(desc.id) {
        return false;
    }
    let song = desc.id;
    debug!(song = %song, label = %desc.label, "pulling next song at end of input");
    match SongStream::open(desc, core.sample_rate, core.channels) {
        Ok(stream) => {
            let installed = {
                let mut state = core.state();
                let unchanged = state.queue.len() == 1
                    && state.queue.head().map_or(false, |h| h.id() == head_id)
                    && state.auto_advance;
                if unchanged {
                    state.queue.push_peek(Arc::clone(&stream));
                }
                unchanged
            };
            if installed {
                local.eof_requested = Some(head_id);
                local.eof_successor = Some(song);
                core.events.emit_lossy(PlayerEvent::QueueChanged);
            }
            // An open the queue moved on from is dropped here, outside
            // the lock.
            true
        }
        Err(e) => {
            warn!(song = %song, error = %e, "failed to open next song");
            local.record_failure(song);
            core.events.emit_lossy(PlayerEvent::SongFailed {
                song,
                message: e.to_string(),
            });
            true
        }
    }
}

/// Desired peek ids for the current upcoming list, in order, with the
/// head, duplicates, and suppressed failures filtered out.
fn desired_peek_ids(
    core: &Arc<PlayerCore>,
    upcoming: &[SongDesc],
    local: &mut WorkerLocal,
) -> Vec<SongId> {
    let head_id = { core.state().queue.head().map(|h| h.id()) };
    let mut desired = Vec::new();
    for desc in upcoming.iter().take(core.peek_count) {
        if Some(desc.id) == head_id || desired.contains(&desc.id) || local.suppressed(desc.id) {
            continue;
        }
        desired.push(desc.id);
    }
    desired
}

/// Keep the peek tail aligned with the host's upcoming list, opening any
/// missing streams without the lock held. Peeks are only maintained while
/// auto-advance is on; turning it off drains them.
fn refresh_peeks(core: &Arc<PlayerCore>, local: &mut WorkerLocal) -> bool {
    let (has_head, auto_advance) = {
        let state = core.state();
        (!state.queue.is_empty(), state.auto_advance)
    };
    if !has_head {
        return false;
    }
    let mut upcoming = if auto_advance {
        core.source.upcoming_songs(core.peek_count)
    } else {
        Vec::new()
    };

    // A successor pulled at end of input plays next no matter what the
    // host reports, so it is spliced in ahead of the upcoming list until
    // it takes over as head.
    if let Some(succ) = local.eof_successor {
        if !upcoming.iter().any(|d| d.id == succ) {
            match { core.state().queue.find(succ).map(|s| s.desc().clone()) } {
                Some(desc) => upcoming.insert(0, desc),
                None => local.eof_successor = None,
            }
        }
    }

    let desired = desired_peek_ids(core, &upcoming, local);
    let in_sync = {
        let state = core.state();
        let actual: Vec<SongId> = state.queue.entries().iter().skip(1).map(|s| s.id()).collect();
        actual == desired
    };
    if in_sync {
        return false;
    }

    let missing: Vec<SongDesc> = {
        let state = core.state();
        state.queue.missing_peeks(&upcoming)
    }
    .into_iter()
    .filter(|desc| !local.suppressed(desc.id))
    .collect();

    let mut opened = Vec::with_capacity(missing.len());
    for desc in missing {
        let song = desc.id;
        match SongStream::open(desc, core.sample_rate, core.channels) {
            Ok(stream) => opened.push(stream),
            Err(e) => {
                warn!(song = %song, error = %e, "failed to open peek stream");
                local.record_failure(song);
                core.events.emit_lossy(PlayerEvent::SongFailed {
                    song,
                    message: e.to_string(),
                });
            }
        }
    }

    let retired = {
        let mut state = core.state();
        state.queue.reconcile_peeks(&upcoming, &mut opened)
    };
    debug!(retired = retired.len(), "peek streams reconciled");
    core.events.emit_lossy(PlayerEvent::QueueChanged);
    // Retired streams and unused opens are dropped here, outside the lock.
    true
}

/// Top up every queued stream that is below target and still has input,
/// servicing pending seeks along the way.
fn fill_buffers(core: &Arc<PlayerCore>) -> bool {
    let streams: Vec<Arc<SongStream>> = { core.state().queue.entries().to_vec() };
    let mut did_work = false;
    for stream in streams {
        let wants_decode = stream.seek_pending()
            || (!stream.reader_hit_end() && stream.buffered_bytes() < core.target_fill_bytes);
        if !wants_decode {
            continue;
        }
        match stream.decode_step(core.target_fill_bytes) {
            Ok(worked) => did_work |= worked,
            Err(e) => {
                // The stream marked itself ended; playback drains past it.
                did_work = true;
                core.events.emit_lossy(PlayerEvent::SongFailed {
                    song: stream.id(),
                    message: e.to_string(),
                });
            }
        }
    }
    did_work
}

/// Off-path event reporting: first-audio notifications, and underruns the
/// render callback recorded in atomics.
fn notify(core: &Arc<PlayerCore>, local: &mut WorkerLocal) {
    let streams: Vec<Arc<SongStream>> = { core.state().queue.entries().to_vec() };
    for stream in streams {
        if stream.take_started_notification() {
            info!(song = %stream.id(), label = %stream.desc().label, "song started");
            core.events
                .emit_lossy(PlayerEvent::SongStarted { song: stream.id() });
        }
    }
    let episodes = core.controls.underruns.load(Ordering::Relaxed);
    if episodes > local.reported_underruns {
        local.reported_underruns = episodes;
        core.events.emit_lossy(PlayerEvent::Underrun {
            missing_frames: core.controls.missing_frames.load(Ordering::Relaxed),
        });
    }
}

/// Sleep until woken or the interval elapses. Intents posted just before
/// the park are re-checked under the lock so they are not missed.
fn park(core: &Arc<PlayerCore>) {
    let state = core.state();
    if core.stop.load(Ordering::Acquire)
        || state.pending_song.is_some()
        || state.advance_requested
        || state.queue.head().map_or(false, |h| h.seek_pending())
    {
        return;
    }
    let _ = core.wake.wait_timeout(state, PARK_INTERVAL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FADE_MS;
    use crate::events::EventBus;
    use crate::playback::engine::{PlayerCore, PlayerState};
    use crate::playback::fader::Fader;
    use crate::playback::mixer::MixerControls;
    use crate::playback::queue::StreamQueue;
    use crate::source::{MediaFile, SongSource};
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::collections::VecDeque;
    use std::sync::{Condvar, Mutex};
    use std::thread;
    use tempfile::TempDir;
    use tokio::sync::broadcast::Receiver;

    const RATE: u32 = 44100;

    fn wav_desc(dir: &TempDir, name: &str, frames: u32) -> SongDesc {
        let path = dir.path().join(format!("{}.wav", name));
        let spec = WavSpec {
            channels: 2,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(2000i16).unwrap();
            writer.write_sample(2000i16).unwrap();
        }
        writer.finalize().unwrap();
        SongDesc::new(name, Arc::new(MediaFile::new(path)))
    }

    struct ListSource {
        next: Mutex<VecDeque<SongDesc>>,
        upcoming: Mutex<Vec<SongDesc>>,
    }

    impl ListSource {
        fn new() -> Arc<Self> {
            Arc::new(ListSource {
                next: Mutex::new(VecDeque::new()),
                upcoming: Mutex::new(Vec::new()),
            })
        }

        fn push_next(&self, desc: SongDesc) {
            self.next.lock().unwrap().push_back(desc);
        }

        fn set_upcoming(&self, descs: Vec<SongDesc>) {
            *self.upcoming.lock().unwrap() = descs;
        }
    }

    impl SongSource for ListSource {
        fn next_song(&self) -> Option<SongDesc> {
            self.next.lock().unwrap().pop_front()
        }

        fn upcoming_songs(&self, count: usize) -> Vec<SongDesc> {
            self.upcoming
                .lock()
                .unwrap()
                .iter()
                .take(count)
                .cloned()
                .collect()
        }
    }

    fn test_core(source: Arc<dyn SongSource>) -> Arc<PlayerCore> {
        let (queue, _rt_list) = StreamQueue::new(3);
        Arc::new(PlayerCore {
            state: Mutex::new(PlayerState {
                queue,
                pending_song: None,
                advance_requested: false,
                auto_advance: true,
            }),
            wake: Condvar::new(),
            stop: std::sync::atomic::AtomicBool::new(false),
            controls: MixerControls::new(1.0),
            fader: Arc::new(Fader::new(FADE_MS)),
            events: EventBus::new(64),
            source,
            sample_rate: RATE,
            channels: 2,
            target_fill_bytes: RATE as usize * 2 * 4 * 10,
            peek_count: 3,
        })
    }

    fn spawn_worker(core: &Arc<PlayerCore>) -> thread::JoinHandle<()> {
        let core = Arc::clone(core);
        thread::spawn(move || run(core))
    }

    fn stop_worker(core: &Arc<PlayerCore>, handle: thread::JoinHandle<()>) {
        core.stop.store(true, Ordering::Release);
        core.wake.notify_all();
        handle.join().unwrap();
    }

    fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn drain_events(rx: &mut Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn plays_requested_song_to_completion() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        let core = test_core(source);
        let mut rx = core.events.subscribe();

        let desc = wav_desc(&dir, "song", 2000);
        let song = desc.id;
        {
            core.state().pending_song = Some(desc);
        }
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        wait_until("song decoded", || {
            core.state()
                .queue
                .head()
                .map_or(false, |h| h.id() == song && h.reader_hit_end())
        });

        // Act as the render side: drain the stream dry.
        let head = core.state().queue.head().cloned().unwrap();
        let mut buf = vec![0u8; 4096];
        while !head.player_hit_end() {
            if head.pop_pcm(&mut buf) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        wait_until("song retired", || core.state().queue.is_empty());
        stop_worker(&core, handle);

        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::SongChanged { new: Some(id), .. } if *id == song)));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::SongStarted { song: id } if *id == song)));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::SongFinished { song: id } if *id == song)));
    }

    #[test]
    fn skip_pulls_the_next_song_from_the_source() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        let first = wav_desc(&dir, "first", RATE * 2);
        let second = wav_desc(&dir, "second", RATE * 2);
        let second_id = second.id;
        source.push_next(first.clone());
        source.push_next(second);

        let core = test_core(Arc::clone(&source) as Arc<dyn SongSource>);
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        let first_id = first.id;
        wait_until("first song current", || {
            core.state().queue.head().map_or(false, |h| h.id() == first_id)
        });

        {
            core.state().advance_requested = true;
        }
        core.wake_worker();

        wait_until("second song current", || {
            core.state().queue.head().map_or(false, |h| h.id() == second_id)
        });
        stop_worker(&core, handle);
    }

    #[test]
    fn peeks_track_the_upcoming_list() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        let head = wav_desc(&dir, "head", RATE * 4);
        let b = wav_desc(&dir, "b", 500);
        let c = wav_desc(&dir, "c", 500);
        source.push_next(head.clone());
        source.set_upcoming(vec![b.clone(), c.clone()]);

        let core = test_core(Arc::clone(&source) as Arc<dyn SongSource>);
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        let want = vec![head.id, b.id, c.id];
        wait_until("peeks opened", || {
            let state = core.state();
            let ids: Vec<_> = state.queue.entries().iter().map(|s| s.id()).collect();
            ids == want
        });

        // Shrinking the upcoming list retires the stale peek.
        source.set_upcoming(vec![c.clone()]);
        let want = vec![head.id, c.id];
        wait_until("stale peek retired", || {
            let state = core.state();
            let ids: Vec<_> = state.queue.entries().iter().map(|s| s.id()).collect();
            ids == want
        });
        stop_worker(&core, handle);
    }

    #[test]
    fn head_at_end_of_input_queues_the_next_song_early() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        let first = wav_desc(&dir, "first", 2000);
        let second = wav_desc(&dir, "second", 2000);
        let (first_id, second_id) = (first.id, second.id);
        source.push_next(first);
        source.push_next(second);
        // The host answers next_song only; upcoming stays empty.

        let core = test_core(Arc::clone(&source) as Arc<dyn SongSource>);
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        // The successor is queued as soon as the head is fully decoded,
        // before any of it has played.
        wait_until("successor queued", || {
            let state = core.state();
            let ids: Vec<_> = state.queue.entries().iter().map(|s| s.id()).collect();
            ids == vec![first_id, second_id]
        });

        // Reconciliation against the empty upcoming list leaves it alone.
        thread::sleep(Duration::from_millis(50));
        {
            let state = core.state();
            let ids: Vec<_> = state.queue.entries().iter().map(|s| s.id()).collect();
            assert_eq!(ids, vec![first_id, second_id]);
        }

        // Drain the head dry; the successor takes over.
        let head = core.state().queue.head().cloned().unwrap();
        let mut buf = vec![0u8; 4096];
        while !head.player_hit_end() {
            if head.pop_pcm(&mut buf) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        wait_until("successor promoted", || {
            core.state().queue.head().map_or(false, |h| h.id() == second_id)
        });
        stop_worker(&core, handle);
    }

    #[test]
    fn auto_advance_off_pauses_at_eof() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        let only = wav_desc(&dir, "only", 1000);
        source.push_next(only.clone());
        source.push_next(wav_desc(&dir, "never", 1000));

        let core = test_core(Arc::clone(&source) as Arc<dyn SongSource>);
        {
            core.state().auto_advance = false;
        }
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        let only_id = only.id;
        wait_until("song decoded", || {
            core.state()
                .queue
                .head()
                .map_or(false, |h| h.id() == only_id && h.reader_hit_end())
        });
        let head = core.state().queue.head().cloned().unwrap();
        let mut buf = vec![0u8; 4096];
        while !head.player_hit_end() {
            if head.pop_pcm(&mut buf) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        wait_until("playback stopped", || {
            !core.controls.playing.load(Ordering::Relaxed)
        });
        // No advance: the queue stays empty and the second song unopened.
        thread::sleep(Duration::from_millis(50));
        assert!(core.state().queue.is_empty());
        stop_worker(&core, handle);
    }

    #[test]
    fn seek_is_serviced_after_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        source.push_next(wav_desc(&dir, "seekable", RATE));

        let core = test_core(Arc::clone(&source) as Arc<dyn SongSource>);
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        wait_until("song decoded", || {
            core.state().queue.head().map_or(false, |h| h.reader_hit_end())
        });

        let head = core.state().queue.head().cloned().unwrap();
        head.request_seek(0.25);
        core.wake_worker();

        wait_until("seek serviced", || !head.seek_pending());
        wait_until("position moved", || {
            let frames = head.player_time_frames() as i64;
            (frames - (RATE as i64 / 4)).unsigned_abs() < RATE as u64 / 10
        });
        stop_worker(&core, handle);
    }

    #[test]
    fn open_failure_emits_event_and_backs_off() {
        let dir = TempDir::new().unwrap();
        let source = ListSource::new();
        // A file that is not valid audio.
        let bad_path = dir.path().join("bad.wav");
        std::fs::write(&bad_path, b"not a wav at all").unwrap();
        let bad = SongDesc::new("bad", Arc::new(MediaFile::new(bad_path)));
        let bad_id = bad.id;
        source.push_next(bad);

        let core = test_core(Arc::clone(&source) as Arc<dyn SongSource>);
        let mut rx = core.events.subscribe();
        core.controls.playing.store(true, Ordering::Relaxed);
        let handle = spawn_worker(&core);

        wait_until("failure reported", || {
            drain_events(&mut rx)
                .iter()
                .any(|e| matches!(e, PlayerEvent::SongFailed { song, .. } if *song == bad_id))
        });
        assert!(core.state().queue.is_empty());
        stop_worker(&core, handle);
    }
}
