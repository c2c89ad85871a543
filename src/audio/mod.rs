//! Decoding, resampling, soft clipping, and device output

pub mod clip;
pub mod decoder;
pub mod output;
pub mod resampler;

pub use clip::SmoothClip;
pub use decoder::StreamDecoder;
pub use output::AudioOutput;
pub use resampler::StreamResampler;
