//! Audio output module for MCPlayer
//!
//! The audio decoder writes decoded PCM into an [`AudioSink`] and derives
//! the playback clock from the sink's playback head. The sink is the
//! platform audio track; [`NullAudioSink`] stands in for it when there is
//! no device to play on.

mod null_sink;
mod volume;

pub use null_sink::{NullAudioSink, SinkPacing};
pub use volume::VolumeControl;

use crate::utils::error::Result;

/// PCM output consumed by the audio decoder
pub trait AudioSink: Send {
    /// Prepare the sink for a new format, discarding anything written before
    ///
    /// # Arguments
    ///
    /// * `format` - Format of the PCM that follows
    fn open(&mut self, format: AudioFormat) -> Result<()>;

    /// Write interleaved PCM
    ///
    /// # Arguments
    ///
    /// * `pcm` - Samples in the format given to [`open`](Self::open)
    /// * `postpone` - Buffer the data without starting playback
    ///
    /// # Returns
    ///
    /// The playback head position in frames after the write
    fn write(&mut self, pcm: &[u8], postpone: bool) -> Result<u64>;

    /// Start or resume consuming written data
    fn play(&mut self);

    /// Stop consuming; written data is kept
    fn pause(&mut self);

    /// Drop written data and reset the playback head
    fn flush(&mut self);

    /// Set volume level
    ///
    /// # Arguments
    ///
    /// * `volume` - Volume level (0.0 to 1.0)
    fn set_volume(&mut self, volume: f32);

    /// Frames played since the sink was opened or flushed
    fn playback_head_position(&self) -> u64;
}

/// PCM layout of the audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of channels
    pub channels: u16,

    /// Bytes per sample of one channel
    pub bytes_per_sample: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bytes_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_sample,
        }
    }

    /// Bytes per interleaved frame
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Whole frames contained in `bytes`
    pub fn frames_in(&self, bytes: usize) -> u64 {
        match self.bytes_per_frame() {
            0 => 0,
            frame => (bytes / frame) as u64,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            bytes_per_sample: 2,
        }
    }
}
