//! Streaming sample-rate conversion
//!
//! Wraps a rubato FFT resampler behind a carry buffer so the decode loop can
//! feed it packets of any size: input frames accumulate until a full block
//! is available, whole blocks are resampled, and the remainder waits for the
//! next packet. [`StreamResampler::flush`] drains the carry and the
//! resampler tail at end of stream so gapless transitions keep the true
//! song length.

use crate::error::{Error, Result};
use rubato::{FftFixedInOut, Resampler};
use tracing::debug;

/// Input block size hint, in frames. The resampler rounds this to an
/// FFT-friendly size; `input_frames_next()` is authoritative.
const RESAMPLE_CHUNK: usize = 1024;

/// Incremental resampler for one audio stream.
///
/// Constructed once per stream; passthrough (no-op) when the source rate
/// already matches the output rate.
pub struct StreamResampler {
    inner: Option<FftFixedInOut<f32>>,
    channels: usize,
    input_rate: u32,
    output_rate: u32,
    /// Planar carry of input frames not yet forming a full block.
    pending: Vec<Vec<f32>>,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Result<Self> {
        let channels = channels as usize;
        let inner = if input_rate == output_rate {
            None
        } else {
            debug!(input_rate, output_rate, channels, "creating resampler");
            Some(
                FftFixedInOut::<f32>::new(
                    input_rate as usize,
                    output_rate as usize,
                    RESAMPLE_CHUNK,
                    channels,
                )
                .map_err(|e| {
                    Error::Resample(format!(
                        "cannot resample {} Hz to {} Hz: {}",
                        input_rate, output_rate, e
                    ))
                })?,
            )
        };
        Ok(StreamResampler {
            inner,
            channels,
            input_rate,
            output_rate,
            pending: vec![Vec::new(); channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed interleaved input samples; returns whatever full blocks produce.
    /// Leftover frames are carried into the next call.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(interleaved.to_vec());
        };
        for (i, sample) in interleaved.iter().enumerate() {
            self.pending[i % self.channels].push(*sample);
        }
        self.frames_in += (interleaved.len() / self.channels) as u64;

        let mut out = Vec::new();
        loop {
            let need = resampler.input_frames_next();
            if self.pending[0].len() < need {
                break;
            }
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..need).collect())
                .collect();
            let planar = resampler
                .process(&block, None)
                .map_err(|e| Error::Resample(e.to_string()))?;
            self.frames_out += planar[0].len() as u64;
            interleave_into(&planar, &mut out);
        }
        Ok(out)
    }

    /// Drain the carry and the resampler's internal tail. The output is
    /// trimmed so the stream's total output length matches the input length
    /// scaled by the rate ratio (plus the fixed resampler delay); the
    /// zero-padding the final partial block needs never reaches the buffer.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.frames_in == 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if !self.pending[0].is_empty() {
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..).collect())
                .collect();
            let planar = resampler
                .process_partial(Some(&block), None)
                .map_err(|e| Error::Resample(e.to_string()))?;
            self.frames_out += planar[0].len() as u64;
            interleave_into(&planar, &mut out);
        }
        let planar = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| Error::Resample(e.to_string()))?;
        self.frames_out += planar[0].len() as u64;
        interleave_into(&planar, &mut out);

        let delay = resampler.output_delay() as u64;
        let in_rate = self.input_rate as u64;
        let out_rate = self.output_rate as u64;
        let expected = delay + (self.frames_in * out_rate + in_rate - 1) / in_rate;
        let excess = self.frames_out.saturating_sub(expected) as usize;
        if excess > 0 {
            out.truncate(out.len().saturating_sub(excess * self.channels));
            self.frames_out -= excess as u64;
        }
        Ok(out)
    }

    /// Forget carried input and internal state, for seek.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
        }
        for ch in &mut self.pending {
            ch.clear();
        }
        self.frames_in = 0;
        self.frames_out = 0;
    }
}

/// Convert interleaved audio between channel counts.
///
/// Mono fans out to every output channel; many-to-one averages the frame.
/// Other combinations map output channel `c` to input channel `c`, wrapping
/// when the output is wider.
pub fn adapt_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from as usize, to as usize);
    if from == to || from == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for c in 0..to {
                out.push(frame[c % from]);
            }
        }
    }
    out
}

fn interleave_into(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    if planar.is_empty() {
        return;
    }
    let frames = planar[0].len();
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for ch in planar {
            out.push(ch[i]);
        }
    }
}
