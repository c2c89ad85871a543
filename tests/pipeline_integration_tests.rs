//! Decode pipeline end to end over generated WAV fixtures
//!
//! Covers the paths the unit tests treat in isolation working together:
//! decode, channel adaptation, resampling into the stream buffer, and the
//! render-side mix across a gapless transition between source formats.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::sync::Arc;
use tempfile::TempDir;
use tonearm::audio::SmoothClip;
use tonearm::config::FADE_MS;
use tonearm::playback::fader::Fader;
use tonearm::playback::mixer::{MixerControls, RtMixer};
use tonearm::playback::queue::StreamQueue;
use tonearm::playback::stream::SongStream;
use tonearm::source::{MediaFile, SongDesc};

const OUT_RATE: u32 = 44100;

/// WAV with every sample equal to `value`, at an arbitrary source format.
fn flat_wav(dir: &TempDir, name: &str, rate: u32, channels: u16, frames: u32, value: f32) -> SongDesc {
    let path = dir.path().join(format!("{}.wav", name));
    let spec = WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec).unwrap();
    let s = (value * i16::MAX as f32) as i16;
    for _ in 0..frames {
        for _ in 0..channels {
            writer.write_sample(s).unwrap();
        }
    }
    writer.finalize().unwrap();
    SongDesc::new(name, Arc::new(MediaFile::new(path)))
}

fn decode_fully(stream: &SongStream) {
    while stream.decode_step(usize::MAX).unwrap() {}
    assert!(stream.reader_hit_end());
}

fn pop_all(stream: &SongStream) -> Vec<f32> {
    let mut pcm = Vec::new();
    let mut scratch = vec![0u8; 8192];
    loop {
        let n = stream.pop_pcm(&mut scratch);
        if n == 0 {
            break;
        }
        pcm.extend_from_slice(&scratch[..n]);
    }
    bytemuck::cast_slice(&pcm).to_vec()
}

#[test]
fn mono_source_is_resampled_and_fanned_out_to_stereo() {
    let dir = TempDir::new().unwrap();
    // One second of 22.05 kHz mono, heading to 44.1 kHz stereo.
    let desc = flat_wav(&dir, "mono", 22050, 1, 22050, 0.5);
    let stream = SongStream::open(desc, OUT_RATE, 2).unwrap();
    decode_fully(&stream);

    let samples = pop_all(&stream);
    let frames = samples.len() / 2;

    // About one second at the output rate, give or take the resampler's
    // fixed delay.
    assert!(
        (frames as i64 - OUT_RATE as i64).unsigned_abs() < 4096,
        "got {} frames",
        frames
    );

    // Mono fan-out puts the identical signal on both channels.
    for frame in samples.chunks_exact(2) {
        assert_eq!(frame[0], frame[1]);
    }

    // Away from the delay-filled head and the ringing tail, the level is
    // the source level.
    let mid = &samples[(frames / 2) * 2..(frames / 2 + 500) * 2];
    for &s in mid {
        assert!((s - 0.5).abs() < 0.05, "mid sample {}", s);
    }

    let secs = stream.duration_secs().unwrap();
    assert!((secs - 1.0).abs() < 0.05, "duration {}", secs);
}

#[test]
fn gapless_transition_across_source_formats() {
    let dir = TempDir::new().unwrap();
    let (mut queue, rt_list) = StreamQueue::new(3);
    let fader = Arc::new(Fader::new(FADE_MS));
    let controls = MixerControls::new(1.0);
    let mut mixer = RtMixer::new(
        rt_list,
        Arc::clone(&fader),
        SmoothClip::default(),
        controls.share(),
        2,
    );

    // Half a second of 22.05 kHz mono, then a second of 48 kHz stereo.
    let first = SongStream::open(
        flat_wav(&dir, "first", 22050, 1, 11025, 0.3),
        OUT_RATE,
        2,
    )
    .unwrap();
    let second = SongStream::open(
        flat_wav(&dir, "second", 48000, 2, 48000, 0.6),
        OUT_RATE,
        2,
    )
    .unwrap();
    decode_fully(&first);
    decode_fully(&second);

    let first_frames = first.buffered_bytes() / 8;
    queue.set_head(Arc::clone(&first));
    let mut opened = vec![Arc::clone(&second)];
    queue.reconcile_peeks(&[second.desc().clone()], &mut opened);

    controls.playing.store(true, std::sync::atomic::Ordering::Relaxed);

    // One fill spanning the boundary plus enough of the second song to
    // get past its resampler delay.
    let want_frames = first_frames + 8000;
    let mut out = vec![0.0f32; want_frames * 2];
    mixer.fill(&mut out);

    // No shortfall: the head ending is not an underrun.
    assert_eq!(controls.underruns.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(
        controls.missing_frames.load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    // Mid-first region sits at the first song's level.
    let mid_first = &out[(first_frames / 2) * 2..(first_frames / 2 + 200) * 2];
    for &s in mid_first {
        assert!((s - 0.3).abs() < 0.05, "first-song sample {}", s);
    }

    // Well past the boundary the second song's level has settled in.
    let mid_second = &out[(first_frames + 6000) * 2..(first_frames + 6500) * 2];
    for &s in mid_second {
        assert!((s - 0.6).abs() < 0.05, "second-song sample {}", s);
    }

    // The first stream drained across the boundary and reports it on the
    // next fill.
    let mut more = vec![0.0f32; 128];
    mixer.fill(&mut more);
    assert!(first.player_hit_end());
    assert!(second.player_started());
}

#[test]
fn seek_lands_near_target_through_the_full_pipeline() {
    let dir = TempDir::new().unwrap();
    // Two seconds of 48 kHz stereo resampled down to 44.1 kHz.
    let desc = flat_wav(&dir, "seek", 48000, 2, 96000, 0.4);
    let stream = SongStream::open(desc, OUT_RATE, 2).unwrap();
    decode_fully(&stream);

    stream.request_seek(1.0);
    assert!(stream.seek_pending());
    stream.decode_step(usize::MAX).unwrap();
    assert!(!stream.seek_pending());

    // Position restarts at the landed target in output frames.
    let pos = stream.player_time_frames() as i64;
    assert!(
        (pos - OUT_RATE as i64).unsigned_abs() < OUT_RATE as u64 / 10,
        "position {}",
        pos
    );

    // Decoding resumes and runs out the remaining second.
    while stream.decode_step(usize::MAX).unwrap() {}
    assert!(stream.reader_hit_end());
    let samples = pop_all(&stream);
    let frames = samples.len() / 2;
    assert!(
        (frames as i64 - OUT_RATE as i64).unsigned_abs() < 4096,
        "remaining frames {}",
        frames
    );
}
