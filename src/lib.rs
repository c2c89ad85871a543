//! # tonearm
//!
//! Concurrent audio streaming core: a gapless decode pipeline with a
//! lock-free real-time output path.
//!
//! A background worker decodes compressed media (via symphonia) into
//! per-song chunked PCM buffers, keeping the current song plus a short
//! queue of pre-opened upcoming streams filled ahead of playback. The
//! audio device callback pops from those buffers through lock-free
//! structures only, applies a click-free gain ramp, master volume,
//! per-song gain, and a smooth soft-clip curve, and degrades any shortfall
//! to silence. Songs come from a host-implemented [`SongSource`];
//! everything else (device negotiation, resampling, queue reconciliation,
//! seeks, events) is handled internally.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tonearm::{MediaFile, Player, PlayerConfig, SongDesc, SongSource};
//!
//! struct OneSong(SongDesc);
//!
//! impl SongSource for OneSong {
//!     fn next_song(&self) -> Option<SongDesc> {
//!         Some(self.0.clone())
//!     }
//! }
//!
//! # fn main() -> tonearm::Result<()> {
//! let desc = SongDesc::new("demo", Arc::new(MediaFile::new("demo.flac")));
//! let player = Player::new(PlayerConfig::default(), Arc::new(OneSong(desc)))?;
//! player.play();
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod playback;
pub mod source;

pub use config::PlayerConfig;
pub use error::{Error, Result};
pub use events::{EventBus, PlaybackState, PlayerEvent};
pub use playback::engine::Player;
pub use source::{MediaFile, MediaOpen, SongDesc, SongId, SongSource};
