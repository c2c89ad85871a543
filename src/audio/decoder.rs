//! Symphonia-backed stream decoding
//!
//! One [`StreamDecoder`] per open song. Packets are demuxed and decoded
//! incrementally: each [`StreamDecoder::next_block`] call yields the next
//! packet's worth of interleaved f32 samples at the source rate and channel
//! layout, so the caller controls how far ahead of playback decoding runs.

use crate::error::{Error, Result};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, warn};

/// Incremental decoder for one media stream.
pub struct StreamDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    time_base: Option<TimeBase>,
    total_frames: Option<u64>,
    /// Reused across packets; sized to the decoder's frame capacity.
    sample_buf: Option<SampleBuffer<f32>>,
    /// Undecodable packets skipped so far; logged on the first and every
    /// 100th after that.
    skipped_packets: u64,
    hit_end: bool,
}

impl StreamDecoder {
    /// Probe and open `source`, selecting the first decodable audio track.
    pub fn open(source: Box<dyn MediaSource>, extension_hint: Option<&str>) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension_hint {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::StreamOpen(format!("unsupported media: {}", e)))?;

        let reader = probed.format;
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::StreamOpen("no audio track".into()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::StreamOpen(format!("no decoder for track: {}", e)))?;

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::StreamOpen("unknown sample rate".into()))?;
        let channels = codec_params
            .channels
            .ok_or_else(|| Error::StreamOpen("unknown channel layout".into()))?
            .count() as u16;

        debug!(
            track_id,
            sample_rate,
            channels,
            total_frames = ?codec_params.n_frames,
            "opened stream"
        );

        Ok(StreamDecoder {
            reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base: codec_params.time_base,
            total_frames: codec_params.n_frames,
            sample_buf: None,
            skipped_packets: 0,
            hit_end: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total source frames, when the container reports them.
    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.total_frames
            .map(|frames| frames as f64 / self.sample_rate as f64)
    }

    /// True once `next_block` has returned `None`.
    pub fn hit_end(&self) -> bool {
        self.hit_end
    }

    /// Decode the next packet into interleaved f32 samples at the source
    /// rate. Returns `None` at end of stream. Undecodable packets are
    /// skipped with a warning; demux failures other than end-of-stream are
    /// errors.
    pub fn next_block(&mut self) -> Result<Option<&[f32]>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                // Symphonia signals end of stream as an IO error.
                Err(SymphoniaError::IoError(_)) => {
                    self.hit_end = true;
                    return Ok(None);
                }
                Err(e) => return Err(Error::Decode(format!("demux failed: {}", e))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let capacity = decoded.capacity() as u64;
                    let buf = self
                        .sample_buf
                        .get_or_insert_with(|| SampleBuffer::<f32>::new(capacity, spec));
                    buf.copy_interleaved_ref(decoded);
                    break;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    self.skipped_packets += 1;
                    if self.skipped_packets % 100 == 1 {
                        warn!(
                            error = %e,
                            skipped = self.skipped_packets,
                            "skipping undecodable packet"
                        );
                    }
                    continue;
                }
                Err(e) => return Err(Error::Decode(e.to_string())),
            }
        }
        Ok(self.sample_buf.as_ref().map(|b| b.samples()))
    }

    /// Seek to a position in seconds; returns the position actually reached
    /// (coarse seeks land on a packet boundary at or before the target).
    pub fn seek(&mut self, seconds: f64) -> Result<f64> {
        let seeked = self
            .reader
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time: Time::from(seconds.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Seek(format!("seek to {:.3}s failed: {}", seconds, e)))?;
        // Codec state carries across packets; it must restart at the new
        // position.
        self.decoder.reset();
        self.hit_end = false;

        let actual = match self.time_base {
            Some(tb) => {
                let t = tb.calc_time(seeked.actual_ts);
                t.seconds as f64 + t.frac
            }
            None => seconds,
        };
        Ok(actual)
    }
}
