//! Audio sink without a device
//!
//! Accepts PCM and advances a simulated playback head, either as fast as
//! data arrives or at the real sample rate.

use std::time::Instant;

use crate::audio::{AudioFormat, AudioSink};
use crate::utils::error::{McPlayerError, Result};

/// How fast the simulated playback head moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkPacing {
    /// Everything written while playing counts as played
    #[default]
    Instant,
    /// The head moves at the sample rate
    Realtime,
}

/// Sink that discards PCM
#[derive(Debug)]
pub struct NullAudioSink {
    pacing: SinkPacing,
    format: Option<AudioFormat>,
    written: u64,
    head: u64,
    playing_since: Option<Instant>,
    volume: f32,
}

impl NullAudioSink {
    pub fn new(pacing: SinkPacing) -> Self {
        Self {
            pacing,
            format: None,
            written: 0,
            head: 0,
            playing_since: None,
            volume: 1.0,
        }
    }

    /// Frames written since the sink was opened or flushed
    pub fn frames_written(&self) -> u64 {
        self.written
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_playing(&self) -> bool {
        self.playing_since.is_some()
    }

    fn current_head(&self) -> u64 {
        let Some(since) = self.playing_since else {
            return self.head;
        };
        match self.pacing {
            SinkPacing::Instant => self.written,
            SinkPacing::Realtime => {
                let rate = self.format.map_or(0, |f| f.sample_rate) as f64;
                let elapsed = (since.elapsed().as_secs_f64() * rate) as u64;
                (self.head + elapsed).min(self.written)
            }
        }
    }
}

impl Default for NullAudioSink {
    fn default() -> Self {
        Self::new(SinkPacing::Instant)
    }
}

impl AudioSink for NullAudioSink {
    fn open(&mut self, format: AudioFormat) -> Result<()> {
        if format.sample_rate == 0 || format.bytes_per_frame() == 0 {
            return Err(McPlayerError::InvalidInput(format!("unplayable format {:?}", format)));
        }
        self.format = Some(format);
        self.flush();
        Ok(())
    }

    fn write(&mut self, pcm: &[u8], _postpone: bool) -> Result<u64> {
        let format = self
            .format
            .ok_or_else(|| McPlayerError::InvalidState("audio sink written before open".to_string()))?;
        self.written += format.frames_in(pcm.len());
        Ok(self.current_head())
    }

    fn play(&mut self) {
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.head = self.current_head();
        self.playing_since = None;
    }

    fn flush(&mut self) {
        self.written = 0;
        self.head = 0;
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn playback_head_position(&self) -> u64 {
        self.current_head()
    }
}
