//! Per-song stream state
//!
//! A [`SongStream`] ties together one song's decoder, resampler, and PCM
//! buffer, plus the cross-thread bookkeeping the pipeline needs: how far
//! decoding has run (`reader_time`), how far playback has consumed
//! (`player_time`), and the end-of-stream flags each side sets for the
//! other. The decode-side pieces live under their own mutex; the output
//! side touches only atomics and the buffer's reader half, so the render
//! path never contends with a blocked decode.

use crate::audio::decoder::StreamDecoder;
use crate::audio::resampler::{adapt_channels, StreamResampler};
use crate::error::Result;
use crate::playback::chunk_buffer::{ChunkBuffer, ChunkReader, ChunkWriter};
use crate::source::{SongDesc, SongId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Unknown duration sentinel for the `time_len` atomic.
const LEN_UNKNOWN: u64 = u64::MAX;

/// Decode-thread context for one stream. Guarded by `SongStream::decode`;
/// the output side never takes that lock.
struct DecodeState {
    decoder: StreamDecoder,
    resampler: StreamResampler,
    writer: ChunkWriter,
    /// Output frames decoded into the buffer so far.
    reader_time: u64,
    /// Pending seek target in seconds, serviced by the next decode step.
    seek_to: Option<f64>,
    failed: bool,
}

/// One song's playback stream.
pub struct SongStream {
    desc: SongDesc,
    out_rate: u32,
    out_channels: u16,
    /// Output-side buffer half. Locked only from the render path, always
    /// with `try_lock`.
    reader: Mutex<ChunkReader>,
    decode: Mutex<DecodeState>,
    /// Frames consumed by the output side.
    player_time: AtomicU64,
    /// Total output frames, `LEN_UNKNOWN` when the container has no count.
    time_len: AtomicU64,
    reader_hit_end: AtomicBool,
    player_started: AtomicBool,
    player_hit_end: AtomicBool,
    started_notified: AtomicBool,
}

impl SongStream {
    /// Open the song's media and build the decode pipeline for it.
    ///
    /// Blocking: probes the container and reads codec headers. Called from
    /// the decode worker with no player lock held.
    pub fn open(desc: SongDesc, out_rate: u32, out_channels: u16) -> Result<Arc<SongStream>> {
        let media = desc.open_media()?;
        let decoder = StreamDecoder::open(media, desc.extension_hint())?;
        let src_rate = decoder.sample_rate();
        let resampler = StreamResampler::new(src_rate, out_rate, out_channels)?;
        let (writer, reader) = ChunkBuffer::new();

        let time_len = decoder
            .total_frames()
            .map(|n| n * out_rate as u64 / src_rate as u64)
            .unwrap_or(LEN_UNKNOWN);

        info!(
            song = %desc.id,
            label = %desc.label,
            src_rate,
            src_channels = decoder.channels(),
            "opened song stream"
        );

        Ok(Arc::new(SongStream {
            desc,
            out_rate,
            out_channels,
            reader: Mutex::new(reader),
            decode: Mutex::new(DecodeState {
                decoder,
                resampler,
                writer,
                reader_time: 0,
                seek_to: None,
                failed: false,
            }),
            player_time: AtomicU64::new(0),
            time_len: AtomicU64::new(time_len),
            reader_hit_end: AtomicBool::new(false),
            player_started: AtomicBool::new(false),
            player_hit_end: AtomicBool::new(false),
            started_notified: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> SongId {
        self.desc.id
    }

    pub fn desc(&self) -> &SongDesc {
        &self.desc
    }

    /// Per-song gain scalar, safe to read from the render path (immutable
    /// after open).
    pub fn gain_factor(&self) -> f32 {
        self.desc.gain_factor
    }

    /// Frames consumed by the output side.
    pub fn player_time_frames(&self) -> u64 {
        self.player_time.load(Ordering::Relaxed)
    }

    pub fn position_secs(&self) -> f64 {
        self.player_time_frames() as f64 / self.out_rate as f64
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match self.time_len.load(Ordering::Relaxed) {
            LEN_UNKNOWN => None,
            frames => Some(frames as f64 / self.out_rate as f64),
        }
    }

    /// Decode side has pushed the last byte of the song.
    pub fn reader_hit_end(&self) -> bool {
        self.reader_hit_end.load(Ordering::Acquire)
    }

    /// Output side has consumed everything after the decode side finished.
    pub fn player_hit_end(&self) -> bool {
        self.player_hit_end.load(Ordering::Acquire)
    }

    pub fn player_started(&self) -> bool {
        self.player_started.load(Ordering::Acquire)
    }

    /// One-shot: true the first time it is called after playback of this
    /// stream audibly started. The worker turns this into a song-started
    /// event.
    pub fn take_started_notification(&self) -> bool {
        self.player_started() && !self.started_notified.swap(true, Ordering::AcqRel)
    }

    /// Decode failed irrecoverably (demux error mid-stream, open races).
    pub fn failed(&self) -> bool {
        self.decode.lock().map(|d| d.failed).unwrap_or(true)
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn buffered_bytes(&self) -> usize {
        match self.reader.try_lock() {
            Ok(reader) => reader.len(),
            Err(_) => 0,
        }
    }

    /// Ask the decode side to jump to `seconds`. Takes effect at the next
    /// decode step; the buffer is flushed there, not here.
    pub fn request_seek(&self, seconds: f64) {
        if let Ok(mut decode) = self.decode.lock() {
            decode.seek_to = Some(seconds.max(0.0));
        }
    }

    /// True if a requested seek has not been serviced yet.
    pub fn seek_pending(&self) -> bool {
        self.decode.lock().map(|d| d.seek_to.is_some()).unwrap_or(false)
    }

    /// Render-path pop: copy up to `out.len()` buffered PCM bytes into
    /// `out`. Never blocks; a contended lock reads as empty. Marks
    /// `player_hit_end` when the decode side has finished and the buffer
    /// ran dry.
    pub fn pop_pcm(&self, out: &mut [u8]) -> usize {
        let Ok(mut reader) = self.reader.try_lock() else {
            return 0;
        };
        let n = reader.pop(out);
        if n > 0 {
            self.player_started.store(true, Ordering::Release);
            let frame_bytes = self.out_channels as u64 * 4;
            self.player_time
                .fetch_add(n as u64 / frame_bytes, Ordering::Relaxed);
        } else if self.reader_hit_end() && reader.is_empty() {
            self.player_hit_end.store(true, Ordering::Release);
        }
        n
    }

    /// Run one bounded decode burst: service a pending seek, then decode
    /// and buffer PCM until the buffer holds `target_fill` bytes, the song
    /// ends, or the per-call budget is spent. Returns true if any work was
    /// done.
    pub fn decode_step(&self, target_fill: usize) -> Result<bool> {
        let mut decode = match self.decode.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if decode.failed {
            return Ok(false);
        }

        let mut did_work = false;

        if let Some(target_secs) = decode.seek_to.take() {
            did_work = true;
            self.service_seek(&mut decode, target_secs);
        }

        if self.reader_hit_end() {
            decode.writer.cleanup();
            return Ok(did_work);
        }

        // One burst decodes at most a second of output audio so seeks and
        // other streams are never starved behind a long fill.
        let burst_budget = self.out_rate as usize * self.out_channels as usize * 4;
        let mut pushed = 0usize;

        while decode.writer.len() < target_fill && pushed < burst_budget {
            let block = match decode.decoder.next_block() {
                Ok(Some(block)) => block.to_vec(),
                Ok(None) => {
                    let tail = decode.resampler.flush()?;
                    if !tail.is_empty() {
                        pushed += self.push_samples(&mut decode, &tail);
                    }
                    self.reader_hit_end.store(true, Ordering::Release);
                    debug!(song = %self.desc.id, "decode reached end of stream");
                    did_work = true;
                    break;
                }
                Err(e) => {
                    warn!(song = %self.desc.id, error = %e, "decode failed, ending stream");
                    decode.failed = true;
                    self.reader_hit_end.store(true, Ordering::Release);
                    return Err(e);
                }
            };
            let adapted = adapt_channels(
                &block,
                decode.decoder.channels(),
                self.out_channels,
            );
            let resampled = decode.resampler.process(&adapted)?;
            if !resampled.is_empty() {
                pushed += self.push_samples(&mut decode, &resampled);
            }
            did_work = true;
        }

        decode.writer.cleanup();
        Ok(did_work)
    }

    fn push_samples(&self, decode: &mut DecodeState, samples: &[f32]) -> usize {
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        decode.writer.push(bytes);
        decode.reader_time += (samples.len() / self.out_channels as usize) as u64;
        bytes.len()
    }

    fn service_seek(&self, decode: &mut DecodeState, target_secs: f64) {
        match decode.decoder.seek(target_secs) {
            Ok(actual_secs) => {
                decode.resampler.reset();
                // The render path only try_locks the reader, so holding it
                // here keeps pops off the old chain while it is torn down
                // and off the end flags until position and flags are reset
                // together.
                {
                    let _reader = match self.reader.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    decode.writer.clear();
                    let frames = (actual_secs * self.out_rate as f64) as u64;
                    decode.reader_time = frames;
                    self.player_time.store(frames, Ordering::Relaxed);
                    self.reader_hit_end.store(false, Ordering::Release);
                    self.player_hit_end.store(false, Ordering::Release);
                }
                decode.failed = false;
                info!(song = %self.desc.id, target_secs, actual_secs, "seek serviced");
            }
            Err(e) => {
                warn!(song = %self.desc.id, target_secs, error = %e, "seek failed, position unchanged");
            }
        }
    }
}

impl std::fmt::Debug for SongStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongStream")
            .field("id", &self.desc.id)
            .field("label", &self.desc.label)
            .field("player_time", &self.player_time_frames())
            .field("reader_hit_end", &self.reader_hit_end())
            .field("player_hit_end", &self.player_hit_end())
            .finish()
    }
}
