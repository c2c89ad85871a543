//! Playback pipeline: buffers, stream queue, decode worker, and the
//! real-time mixer

pub mod chunk_buffer;
pub mod engine;
pub mod fader;
pub mod mixer;
pub mod queue;
pub mod slot_list;
pub mod stream;
pub(crate) mod worker;

pub use chunk_buffer::{ChunkBuffer, ChunkReader, ChunkWriter};
pub use engine::Player;
pub use fader::{FadeDirection, Fader};
pub use mixer::{MixerControls, RtMixer};
pub use queue::StreamQueue;
pub use slot_list::{ListConsumer, ListProducer, ListReader, SlotList};
pub use stream::SongStream;
