//! Host-facing seams: song identity, song descriptors, and media access
//!
//! The player never touches the filesystem or a playlist on its own. The
//! embedding host supplies songs through [`SongSource`] and per-song media
//! through [`MediaOpen`], whose `open_media` returns a boxed
//! [`MediaSource`] (`Read + Seek`) that symphonia demuxes. Both seams are
//! called from the decode worker with no internal player lock held, so
//! implementations are free to block.

use crate::error::{Error, Result};
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use symphonia::core::io::MediaSource;
use uuid::Uuid;

/// Identity key for a song, used for queue reconciliation and overtake
/// matching. Two descriptors with the same id are treated as the same song;
/// matching is first-match-wins and duplicates are skipped with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SongId(Uuid);

impl SongId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        SongId(Uuid::new_v4())
    }
}

impl Default for SongId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Opens the raw media behind a song.
pub trait MediaOpen: Send + Sync {
    /// Open a fresh read/seek handle on the media. Called once per stream
    /// open; a peek stream and a later reopen each get their own handle.
    fn open_media(&self) -> Result<Box<dyn MediaSource>>;

    /// File-extension hint for format probing, if one is known.
    fn extension_hint(&self) -> Option<&str> {
        None
    }
}

/// File-backed media opener.
pub struct MediaFile {
    path: PathBuf,
}

impl MediaFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl MediaOpen for MediaFile {
    fn open_media(&self) -> Result<Box<dyn MediaSource>> {
        let file = File::open(&self.path).map_err(|e| {
            Error::StreamOpen(format!("failed to open {}: {}", self.path.display(), e))
        })?;
        Ok(Box::new(file))
    }

    fn extension_hint(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }
}

/// Everything the player needs to know about one song.
#[derive(Clone)]
pub struct SongDesc {
    /// Identity key (reconciliation, overtake, events)
    pub id: SongId,
    /// Human-readable label for logs and events
    pub label: String,
    /// Per-song gain scalar (replay-gain style), 1.0 = unchanged
    pub gain_factor: f32,
    media: Arc<dyn MediaOpen>,
}

impl SongDesc {
    pub fn new<L: Into<String>>(label: L, media: Arc<dyn MediaOpen>) -> Self {
        Self {
            id: SongId::new(),
            label: label.into(),
            gain_factor: 1.0,
            media,
        }
    }

    /// Same descriptor with an explicit id (host-stable identity).
    pub fn with_id(mut self, id: SongId) -> Self {
        self.id = id;
        self
    }

    /// Same descriptor with a per-song gain factor.
    pub fn with_gain(mut self, gain_factor: f32) -> Self {
        self.gain_factor = gain_factor;
        self
    }

    /// Open the underlying media.
    pub fn open_media(&self) -> Result<Box<dyn MediaSource>> {
        self.media.open_media()
    }

    /// Extension hint for the probe.
    pub fn extension_hint(&self) -> Option<&str> {
        self.media.extension_hint()
    }
}

impl fmt::Debug for SongDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SongDesc")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("gain_factor", &self.gain_factor)
            .finish()
    }
}

/// Supplies the player with songs.
///
/// `next_song` is consulted when the player has no current song, when the
/// current one finishes (auto-advance), and on an explicit skip.
/// `upcoming_songs` feeds peek-stream reconciliation; returning fewer than
/// `count` entries (or none) simply shortens the pre-opened horizon.
pub trait SongSource: Send + Sync {
    fn next_song(&self) -> Option<SongDesc>;

    fn upcoming_songs(&self, count: usize) -> Vec<SongDesc> {
        let _ = count;
        Vec::new()
    }
}
