//! Error types for the streaming core
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation on the decode and control paths. Nothing on the real-time
//! output path constructs or propagates these; failures there degrade to
//! silence and a log line instead.

use thiserror::Error;

/// Main error type for the player core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream open failures (probe, missing audio track, unsupported codec)
    #[error("Stream open error: {0}")]
    StreamOpen(String),

    /// Audio decoding errors that survive the per-frame skip policy
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Resampler construction or processing errors
    #[error("Resample error: {0}")]
    Resample(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Seek target rejected or demuxer seek failure
    #[error("Seek error: {0}")]
    Seek(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Convenience Result type for the player core
pub type Result<T> = std::result::Result<T, Error>;
