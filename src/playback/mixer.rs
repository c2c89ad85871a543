//! Real-time render path
//!
//! [`RtMixer`] is the object moved into the audio callback. Its `fill` runs
//! with the device's deadline: no allocation, no blocking, no error paths.
//! It pops PCM from the head stream (falling through to the next queued
//! stream only at a true end of song, which is what makes transitions
//! gapless), applies ramp x master volume x per-song gain per sample, soft
//! clips, and degrades any shortfall to silence.

use crate::audio::clip::SmoothClip;
use crate::playback::fader::Fader;
use crate::playback::slot_list::ListReader;
use crate::playback::stream::SongStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Pop scratch size in samples; covers 8192 stereo frames per pass.
const SCRATCH_SAMPLES: usize = 16384;

/// Most streams one fill can cross. Head plus peeks never exceeds this;
/// further segments reuse the last gain.
const MAX_SEGMENTS: usize = 8;

/// Shared knobs the control side adjusts while the mixer runs.
pub struct MixerControls {
    /// Master volume as f32 bits.
    pub volume_bits: Arc<AtomicU32>,
    /// False while paused; the mixer renders through an unfinished
    /// fade-out regardless.
    pub playing: Arc<AtomicBool>,
    /// Underrun episodes since start, for event reporting.
    pub underruns: Arc<AtomicU64>,
    /// Total frames replaced with silence during underruns.
    pub missing_frames: Arc<AtomicU64>,
}

impl MixerControls {
    pub fn new(volume: f32) -> Self {
        MixerControls {
            volume_bits: Arc::new(AtomicU32::new(volume.to_bits())),
            playing: Arc::new(AtomicBool::new(false)),
            underruns: Arc::new(AtomicU64::new(0)),
            missing_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn share(&self) -> Self {
        MixerControls {
            volume_bits: Arc::clone(&self.volume_bits),
            playing: Arc::clone(&self.playing),
            underruns: Arc::clone(&self.underruns),
            missing_frames: Arc::clone(&self.missing_frames),
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

/// The render object. One per output stream; owned by the device callback.
pub struct RtMixer {
    queue: ListReader<Arc<SongStream>>,
    fader: Arc<Fader>,
    clip: SmoothClip,
    controls: MixerControls,
    channels: usize,
    scratch: Vec<f32>,
    /// Inside an underrun episode; cleared by the first healthy fill.
    in_underrun: bool,
}

impl RtMixer {
    pub fn new(
        queue: ListReader<Arc<SongStream>>,
        fader: Arc<Fader>,
        clip: SmoothClip,
        controls: MixerControls,
        channels: u16,
    ) -> Self {
        RtMixer {
            queue,
            fader,
            clip,
            controls,
            channels: channels as usize,
            scratch: vec![0.0; SCRATCH_SAMPLES],
            in_underrun: false,
        }
    }

    /// Fill `out` with interleaved frames. Called from the device callback.
    ///
    /// A buffer larger than the scratch renders in scratch-sized passes;
    /// the scratch never grows on this path.
    pub fn fill(&mut self, out: &mut [f32]) {
        let channels = self.channels;
        let playing = self.controls.playing.load(Ordering::Relaxed);

        // Paused with no fade left to render: pure silence.
        if !playing && self.fader.finished() {
            out.fill(0.0);
            self.in_underrun = false;
            return;
        }

        let vol = self.controls.volume();
        // Whole frames only, so no pass splits a frame across two pops.
        let total_samples = out.len() - out.len() % channels;
        let pass_samples = self.scratch.len() - self.scratch.len() % channels;
        let mut filled = 0usize;
        let mut starved = false;

        while filled < total_samples {
            let want_samples = (total_samples - filled).min(pass_samples);
            let want_bytes = want_samples * 4;

            // Pop PCM, noting where stream boundaries fall so each segment
            // keeps its own song gain.
            let mut copied_bytes = 0usize;
            let mut segments = [(0usize, 1.0f32); MAX_SEGMENTS];
            let mut seg_len = 0usize;
            {
                let guard = self.queue.guard();
                for stream in guard.iter() {
                    let bytes: &mut [u8] =
                        bytemuck::cast_slice_mut(&mut self.scratch[..want_samples]);
                    let n = stream.pop_pcm(&mut bytes[copied_bytes..want_bytes]);
                    if n > 0 {
                        copied_bytes += n;
                        let end_sample = copied_bytes / 4;
                        if seg_len < MAX_SEGMENTS {
                            segments[seg_len] = (end_sample, stream.gain_factor());
                            seg_len += 1;
                        } else {
                            segments[MAX_SEGMENTS - 1].0 = end_sample;
                        }
                    }
                    if copied_bytes == want_bytes {
                        break;
                    }
                    if !stream.reader_hit_end() {
                        // Mid-song shortfall; skipping ahead would drop
                        // audio.
                        starved = playing;
                        break;
                    }
                }
            }

            let copied_samples = copied_bytes / 4;
            let pass_frames = copied_samples / channels;
            let mut seg = 0usize;
            for frame in 0..pass_frames {
                self.fader.frame_tick();
                let ramp = self.fader.sample_factor();
                for ch in 0..channels {
                    let i = frame * channels + ch;
                    while seg + 1 < seg_len && i >= segments[seg].0 {
                        seg += 1;
                    }
                    let gain = ramp * vol * segments[seg].1;
                    out[filled + i] = self.clip.apply(self.scratch[i] * gain);
                }
            }
            filled += pass_frames * channels;

            // A short pass means the queue has nothing more to give.
            if copied_samples < want_samples {
                break;
            }
        }

        out[filled..].fill(0.0);

        if starved {
            let missing = ((total_samples - filled) / channels) as u64;
            self.controls
                .missing_frames
                .fetch_add(missing, Ordering::Relaxed);
            if !self.in_underrun {
                self.in_underrun = true;
                self.controls.underruns.fetch_add(1, Ordering::Relaxed);
                warn!(missing_frames = missing, "audio underrun, inserting silence");
            }
        } else {
            self.in_underrun = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FADE_MS;
    use crate::playback::fader::FadeDirection;
    use crate::playback::queue::StreamQueue;
    use crate::source::{MediaFile, SongDesc};
    use hound::{SampleFormat, WavSpec, WavWriter};
    use tempfile::TempDir;

    const RATE: u32 = 44100;

    /// Stereo WAV with every sample equal to `value`.
    fn flat_song(dir: &TempDir, name: &str, frames: u32, value: f32) -> SongDesc {
        let path = dir.path().join(format!("{}.wav", name));
        let spec = WavSpec {
            channels: 2,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        let s = (value * i16::MAX as f32) as i16;
        for _ in 0..frames {
            writer.write_sample(s).unwrap();
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        SongDesc::new(name, Arc::new(MediaFile::new(path)))
    }

    fn mixer_with_queue() -> (StreamQueue, RtMixer, MixerControls, Arc<Fader>) {
        let (queue, reader) = StreamQueue::new(3);
        let fader = Arc::new(Fader::new(FADE_MS));
        let controls = MixerControls::new(1.0);
        let mixer = RtMixer::new(
            reader,
            Arc::clone(&fader),
            SmoothClip::default(),
            controls.share(),
            2,
        );
        (queue, mixer, controls, fader)
    }

    #[test]
    fn paused_with_finished_ramp_renders_silence() {
        let (_queue, mut mixer, controls, _fader) = mixer_with_queue();
        assert!(!controls.playing.load(Ordering::Relaxed));
        let mut out = vec![1.0f32; 256];
        mixer.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn applies_volume_and_song_gain() {
        let dir = TempDir::new().unwrap();
        let (mut queue, mut mixer, controls, _fader) = mixer_with_queue();

        let desc = flat_song(&dir, "flat", 2000, 0.5).with_gain(0.8);
        let stream = SongStream::open(desc, RATE, 2).unwrap();
        while stream.decode_step(usize::MAX).unwrap() {}
        queue.set_head(stream);

        controls.playing.store(true, Ordering::Relaxed);
        controls.set_volume(0.5);

        let mut out = vec![0.0f32; 400];
        mixer.fill(&mut out);

        // 0.5 sample x 0.5 volume x 0.8 gain = 0.2, below the clip knee.
        for &s in &out {
            assert!((s - 0.2).abs() < 0.01, "sample {}", s);
        }
        assert_eq!(controls.underruns.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn underrun_fills_shortfall_with_silence_once_per_episode() {
        let dir = TempDir::new().unwrap();
        let (mut queue, mut mixer, controls, _fader) = mixer_with_queue();

        // Long song, deliberately under-decoded so end-of-input is not hit.
        let desc = flat_song(&dir, "long", RATE * 3, 0.4);
        let stream = SongStream::open(desc, RATE, 2).unwrap();
        stream.decode_step(usize::MAX).unwrap();
        assert!(!stream.reader_hit_end());

        // Drain down to exactly 600 buffered frames.
        let buffered_frames = stream.buffered_bytes() / 8;
        assert!(buffered_frames > 600);
        let mut sink = vec![0u8; (buffered_frames - 600) * 8];
        assert_eq!(stream.pop_pcm(&mut sink), sink.len());

        queue.set_head(stream);
        controls.playing.store(true, Ordering::Relaxed);

        // Ask for 1000 frames: 600 real, 400 silence, one underrun.
        let mut out = vec![7.0f32; 1000 * 2];
        mixer.fill(&mut out);
        assert!(out[..600 * 2].iter().all(|&s| (s - 0.4).abs() < 0.01));
        assert!(out[600 * 2..].iter().all(|&s| s == 0.0));
        assert_eq!(controls.underruns.load(Ordering::Relaxed), 1);
        assert_eq!(controls.missing_frames.load(Ordering::Relaxed), 400);

        // Still starved: same episode, no second count.
        mixer.fill(&mut out);
        assert_eq!(controls.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn finished_head_falls_through_to_next_stream() {
        let dir = TempDir::new().unwrap();
        let (mut queue, mut mixer, controls, _fader) = mixer_with_queue();

        let first = SongStream::open(flat_song(&dir, "first", 300, 0.3), RATE, 2).unwrap();
        let second = SongStream::open(flat_song(&dir, "second", 500, 0.6), RATE, 2).unwrap();
        while first.decode_step(usize::MAX).unwrap() {}
        while second.decode_step(usize::MAX).unwrap() {}
        queue.set_head(Arc::clone(&first));
        let mut opened = vec![Arc::clone(&second)];
        queue.reconcile_peeks(&[second.desc().clone()], &mut opened);

        controls.playing.store(true, Ordering::Relaxed);
        let mut out = vec![0.0f32; 600 * 2];
        mixer.fill(&mut out);

        // First 300 frames from the finished head, the rest seamlessly
        // from the next stream; no underrun recorded.
        assert!(out[..300 * 2].iter().all(|&s| (s - 0.3).abs() < 0.01));
        assert!(out[300 * 2..].iter().all(|&s| (s - 0.6).abs() < 0.01));
        assert_eq!(controls.underruns.load(Ordering::Relaxed), 0);

        // The drained head reports completion on the following fill.
        let mut more = vec![0.0f32; 64];
        mixer.fill(&mut more);
        assert!(first.player_hit_end());
    }

    #[test]
    fn ramp_scales_frames_during_fade_in() {
        let dir = TempDir::new().unwrap();
        let (mut queue, mut mixer, controls, fader) = mixer_with_queue();

        let stream = SongStream::open(flat_song(&dir, "tone", 44100, 0.5), RATE, 2).unwrap();
        while stream.decode_step(usize::MAX).unwrap() {}
        queue.set_head(stream);

        controls.playing.store(true, Ordering::Relaxed);
        fader.change(FadeDirection::In, RATE);

        let ramp_frames = (RATE as u64 * FADE_MS / 1000) as usize;
        let mut out = vec![0.0f32; (ramp_frames + 100) * 2];
        mixer.fill(&mut out);

        // Early in the ramp the output is quiet, by the end it is full.
        assert!(out[0] < 0.01);
        let late = out[(ramp_frames + 50) * 2];
        assert!((late - 0.5).abs() < 0.01, "late sample {}", late);
        // Monotone over the ramp for a constant source.
        let quarter = out[(ramp_frames / 4) * 2];
        let half = out[(ramp_frames / 2) * 2];
        assert!(quarter < half);
    }

    #[test]
    fn fills_larger_than_the_scratch_render_in_passes() {
        let dir = TempDir::new().unwrap();
        let (mut queue, mut mixer, controls, _fader) = mixer_with_queue();

        let stream = SongStream::open(flat_song(&dir, "long", RATE * 2, 0.5), RATE, 2).unwrap();
        while stream.decode_step(usize::MAX).unwrap() {}
        queue.set_head(stream);
        controls.playing.store(true, Ordering::Relaxed);

        // Three times the preallocated scratch in one callback.
        let mut out = vec![0.0f32; SCRATCH_SAMPLES * 3];
        mixer.fill(&mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 0.01));
        assert_eq!(controls.underruns.load(Ordering::Relaxed), 0);
    }
}
