//! MCPlayer - segmented media decode and render pipeline
//!
//! A demuxer delivers encoded access units in chunks. Each elementary stream
//! gets a decoder that buffers the units in an [`AccessUnitQueue`], feeds a
//! Codec Engine on its own worker thread and renders the output. The
//! [`MediaPlayer`] coordinates both decoders: prefetching, preroll, seeking,
//! mid-stream reconfiguration, encrypted content and the shared playback
//! clock.
//!
//! The crate ships a mock demuxer, a mock Codec Engine and a device-less audio
//! sink, so the whole pipeline runs without platform media support.
//!
//! [`AccessUnitQueue`]: decoder::AccessUnitQueue

pub mod audio;
pub mod codec;
pub mod decoder;
pub mod demuxer;
pub mod media;
pub mod player;
pub mod utils;

pub use media::{AccessUnit, Chunk, StreamConfigs, StreamType};
pub use player::{
    MediaPlayer, MediaPlayerBuilder, PlaybackStats, PlayerEvent, PlayerEventHandler, PlayerState,
};
pub use utils::config::Config;
pub use utils::error::{McPlayerError, Result};
