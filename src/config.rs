//! Player configuration
//!
//! All tunables live in [`PlayerConfig`], loadable from a TOML file or built
//! from defaults. The buffer/fade/peek constants default to the reference
//! sizing the pipeline was tuned around; changing them is supported but the
//! chunk size must stay at least one decode frame's worth of output to avoid
//! pathological chunk churn.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Fixed capacity of one buffer chunk, in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Wall-clock length of the gain ramp applied on play/pause/switch.
pub const FADE_MS: u64 = 50;

/// Number of upcoming streams kept pre-opened for gapless transitions.
pub const PEEK_COUNT: usize = 3;

/// How far ahead of the output the decoder keeps each buffer, in seconds.
pub const TARGET_FILL_SECS: f32 = 10.0;

/// Player configuration
///
/// Every field has a built-in default; a TOML file may override any subset.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    /// Output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Output channel count (2 = stereo)
    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Master volume in [0, 1]
    #[serde(default = "default_volume")]
    pub volume: f32,

    /// Gain ramp duration in milliseconds
    #[serde(default = "default_fade_ms")]
    pub fade_ms: u64,

    /// Number of pre-opened peek streams
    #[serde(default = "default_peek_count")]
    pub peek_count: usize,

    /// Target buffer fill per stream, in seconds of output audio
    #[serde(default = "default_target_fill_secs")]
    pub target_fill_secs: f32,

    /// Advance to the next song when the current one ends
    #[serde(default = "default_true")]
    pub next_song_on_eof: bool,

    /// Soft-clip knee start (samples below pass through unchanged)
    #[serde(default = "default_soft_clip_x1")]
    pub soft_clip_x1: f32,

    /// Soft-clip knee end (input magnitude mapped to full scale)
    #[serde(default = "default_soft_clip_x2")]
    pub soft_clip_x2: f32,

    /// Output device name; None selects the system default
    #[serde(default)]
    pub device_name: Option<String>,
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u16 {
    2
}

fn default_volume() -> f32 {
    0.9
}

fn default_fade_ms() -> u64 {
    FADE_MS
}

fn default_peek_count() -> usize {
    PEEK_COUNT
}

fn default_target_fill_secs() -> f32 {
    TARGET_FILL_SECS
}

fn default_true() -> bool {
    true
}

fn default_soft_clip_x1() -> f32 {
    0.95
}

fn default_soft_clip_x2() -> f32 {
    10.0
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            volume: default_volume(),
            fade_ms: default_fade_ms(),
            peek_count: default_peek_count(),
            target_fill_secs: default_target_fill_secs(),
            next_song_on_eof: true,
            soft_clip_x1: default_soft_clip_x1(),
            soft_clip_x2: default_soft_clip_x2(),
            device_name: None,
        }
    }
}

impl PlayerConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PlayerConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges; called by loaders and by `Player::new`.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be nonzero".into()));
        }
        if self.channels == 0 {
            return Err(Error::Config("channels must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::Config(format!(
                "volume {} out of range [0, 1]",
                self.volume
            )));
        }
        if self.target_fill_secs <= 0.0 {
            return Err(Error::Config("target_fill_secs must be positive".into()));
        }
        if self.soft_clip_x1 < 0.0 || self.soft_clip_x2 < self.soft_clip_x1 {
            return Err(Error::Config(format!(
                "soft clip knee ({}, {}) is not ordered",
                self.soft_clip_x1, self.soft_clip_x2
            )));
        }
        Ok(())
    }

    /// Bytes of buffered output audio that `target_fill_secs` corresponds to.
    ///
    /// The pipeline stores interleaved f32 samples, 4 bytes each.
    pub fn target_fill_bytes(&self) -> usize {
        let bytes_per_sec = self.sample_rate as usize * self.channels as usize * 4;
        (bytes_per_sec as f32 * self.target_fill_secs) as usize
    }

    /// Gain ramp length in samples at the given rate.
    pub fn fade_samples(&self, sample_rate: u32) -> u64 {
        sample_rate as u64 * self.fade_ms / 1000
    }
}
