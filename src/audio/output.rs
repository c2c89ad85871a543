//! Audio device output via cpal
//!
//! Owns device discovery, stream config negotiation, and the output stream.
//! The render callback receives a `FnMut(&mut [f32])` fill closure and calls
//! it once per device buffer; sample-format conversion for non-f32 devices
//! happens here against a preallocated scratch buffer so the callback path
//! never allocates.

use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Conversion scratch size in samples; a device buffer larger than this is
/// converted in spans of this size rather than grown into.
const SCRATCH_SAMPLES: usize = 16384;

/// Audio output stream manager.
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    /// Set from the cpal error callback; polled by the engine.
    error_flag: Arc<AtomicBool>,
}

impl AudioOutput {
    /// List available output device names.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open an output device, preferring `want_rate`/`want_channels` in f32.
    ///
    /// A named device that cannot be found falls back to the system default
    /// with a warning; the negotiated rate and channel count are reported by
    /// [`AudioOutput::sample_rate`] and [`AudioOutput::channels`] and may
    /// differ from the preference.
    pub fn open(device_name: Option<&str>, want_rate: u32, want_channels: u16) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("failed to enumerate devices: {}", e)))?;
            match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                Some(dev) => {
                    info!(device = name, "using requested audio device");
                    dev
                }
                None => {
                    warn!(device = name, "requested device not found, using default");
                    host.default_output_device().ok_or_else(|| {
                        Error::AudioOutput(format!(
                            "device '{}' not found and no default device available",
                            name
                        ))
                    })?
                }
            }
        } else {
            let dev = host
                .default_output_device()
                .ok_or_else(|| Error::AudioOutput("no default output device".into()))?;
            info!(
                device = %dev.name().unwrap_or_else(|_| "unknown".into()),
                "using default audio device"
            );
            dev
        };

        let (config, sample_format) = Self::get_best_config(&device, want_rate, want_channels)?;
        debug!(
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "negotiated stream config"
        );

        Ok(AudioOutput {
            device,
            config,
            sample_format,
            stream: None,
            error_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pick the closest supported config to the preferred rate/channels/f32,
    /// falling back to the device default.
    fn get_best_config(
        device: &Device,
        want_rate: u32,
        want_channels: u16,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("failed to get device configs: {}", e)))?;

        let preferred = supported.find(|config| {
            config.channels() == want_channels
                && config.min_sample_rate().0 <= want_rate
                && config.max_sample_rate().0 >= want_rate
                && config.sample_format() == SampleFormat::F32
        });
        if let Some(supported_config) = preferred {
            let sample_format = supported_config.sample_format();
            let config = supported_config
                .with_sample_rate(cpal::SampleRate(want_rate))
                .config();
            return Ok((config, sample_format));
        }

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(format!("failed to get default config: {}", e)))?;
        let sample_format = supported_config.sample_format();
        Ok((supported_config.config(), sample_format))
    }

    /// Build and start the output stream.
    ///
    /// `fill` runs on the audio thread once per device buffer and must write
    /// interleaved f32 frames at [`AudioOutput::channels`]; it must not
    /// block or allocate.
    pub fn start<F>(&mut self, fill: F) -> Result<()>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        if self.stream.is_some() {
            return Err(Error::InvalidState("output stream already started".into()));
        }
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream_f32(fill)?,
            SampleFormat::I16 => self.build_stream_i16(fill)?,
            SampleFormat::U16 => self.build_stream_u16(fill)?,
            other => {
                return Err(Error::AudioOutput(format!(
                    "unsupported sample format: {:?}",
                    other
                )));
            }
        };
        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("failed to start stream: {}", e)))?;
        self.stream = Some(stream);
        info!("audio stream started");
        Ok(())
    }

    fn build_stream_f32<F>(&self, mut fill: F) -> Result<Stream>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        let error_flag = Arc::clone(&self.error_flag);
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    fill(data);
                },
                move |err| {
                    error!("audio stream error: {}", err);
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("failed to build stream: {}", e)))
    }

    fn build_stream_i16<F>(&self, mut fill: F) -> Result<Stream>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        let error_flag = Arc::clone(&self.error_flag);
        // Whole frames per span so a fill never straddles a frame edge.
        let span_samples = SCRATCH_SAMPLES - SCRATCH_SAMPLES % self.config.channels as usize;
        let mut scratch = vec![0.0f32; SCRATCH_SAMPLES];
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut done = 0usize;
                    while done < data.len() {
                        let n = (data.len() - done).min(span_samples);
                        let buf = &mut scratch[..n];
                        fill(buf);
                        for (out, s) in data[done..done + n].iter_mut().zip(buf.iter()) {
                            *out = f32_to_i16(*s);
                        }
                        done += n;
                    }
                },
                move |err| {
                    error!("audio stream error: {}", err);
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("failed to build stream: {}", e)))
    }

    fn build_stream_u16<F>(&self, mut fill: F) -> Result<Stream>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        let error_flag = Arc::clone(&self.error_flag);
        let span_samples = SCRATCH_SAMPLES - SCRATCH_SAMPLES % self.config.channels as usize;
        let mut scratch = vec![0.0f32; SCRATCH_SAMPLES];
        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    let mut done = 0usize;
                    while done < data.len() {
                        let n = (data.len() - done).min(span_samples);
                        let buf = &mut scratch[..n];
                        fill(buf);
                        for (out, s) in data[done..done + n].iter_mut().zip(buf.iter()) {
                            *out = f32_to_u16(*s);
                        }
                        done += n;
                    }
                },
                move |err| {
                    error!("audio stream error: {}", err);
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("failed to build stream: {}", e)))
    }

    /// Pause and drop the stream.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            info!("stopping audio stream");
            stream
                .pause()
                .map_err(|e| Error::AudioOutput(format!("failed to pause stream: {}", e)))?;
        }
        Ok(())
    }

    pub fn device_name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "unknown".into())
    }

    /// Negotiated output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Negotiated output channel count.
    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// True once the stream has reported an error.
    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn f32_to_u16(s: f32) -> u16 {
    ((s.clamp(-1.0, 1.0) + 1.0) * 32767.5) as u16
}
