//! Media data model
//!
//! Types exchanged between the demuxer, the access unit queues and the
//! decoders: encoded access units, the chunks that carry them, and the stream
//! configurations that describe how to build a codec for them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::utils::error::{McPlayerError, Result};

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Unknown,
    Aac,
    Vorbis,
    Opus,
}

/// Video codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Unknown,
    H264,
    Hevc,
    Vp8,
    Vp9,
}

bitflags! {
    /// Per-unit markers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UnitFlags: u8 {
        /// The unit can be decoded without reference to earlier units
        const KEY_FRAME = 1 << 0;
        /// Terminal marker; carries no payload
        const END_OF_STREAM = 1 << 1;
        /// The enclosing chunk carries a new stream configuration
        const CONFIG_CHANGED = 1 << 2;
    }
}

/// Clear/encrypted byte split of one subsample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubsampleEntry {
    pub clear_bytes: u32,
    pub cypher_bytes: u32,
}

/// Decryption parameters of an encrypted access unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecryptConfig {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub subsamples: Vec<SubsampleEntry>,
}

/// One encoded frame
///
/// Units are immutable once built. End-of-stream and config-changed units
/// carry no payload and must be the last unit of their chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUnit {
    stream: StreamType,
    timestamp: Duration,
    data: Vec<u8>,
    flags: UnitFlags,
    decrypt_config: Option<DecryptConfig>,
}

impl AccessUnit {
    /// Create a data unit
    pub fn new(stream: StreamType, timestamp: Duration, data: Vec<u8>) -> Self {
        Self {
            stream,
            timestamp,
            data,
            flags: UnitFlags::empty(),
            decrypt_config: None,
        }
    }

    /// Create the terminal end-of-stream unit
    pub fn end_of_stream(stream: StreamType, timestamp: Duration) -> Self {
        Self {
            stream,
            timestamp,
            data: Vec::new(),
            flags: UnitFlags::END_OF_STREAM,
            decrypt_config: None,
        }
    }

    /// Create a config-changed marker; the enclosing chunk must carry the configs
    pub fn config_changed(stream: StreamType, timestamp: Duration) -> Self {
        Self {
            stream,
            timestamp,
            data: Vec::new(),
            flags: UnitFlags::CONFIG_CHANGED,
            decrypt_config: None,
        }
    }

    /// Mark this unit as a key frame
    pub fn key_frame(mut self) -> Self {
        self.flags.insert(UnitFlags::KEY_FRAME);
        self
    }

    /// Attach decryption parameters
    pub fn with_decrypt_config(mut self, config: DecryptConfig) -> Self {
        self.decrypt_config = Some(config);
        self
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn flags(&self) -> UnitFlags {
        self.flags
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(UnitFlags::KEY_FRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(UnitFlags::END_OF_STREAM)
    }

    pub fn is_config_changed(&self) -> bool {
        self.flags.contains(UnitFlags::CONFIG_CHANGED)
    }

    pub fn decrypt_config(&self) -> Option<&DecryptConfig> {
        self.decrypt_config.as_ref()
    }
}

/// Audio stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfigs {
    pub codec: AudioCodec,
    pub sampling_rate: u32,
    pub channels: u16,
    pub is_encrypted: bool,
    pub extra_data: Vec<u8>,
}

/// Video stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfigs {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub is_encrypted: bool,
    pub extra_data: Vec<u8>,
}

/// Stream configurations reported by the demuxer
///
/// A stream is present when its section is set. Chunks carrying a
/// config-changed unit hold the updated configuration of their own stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamConfigs {
    pub audio: Option<AudioConfigs>,
    pub video: Option<VideoConfigs>,
    pub duration: Duration,
}

impl StreamConfigs {
    pub fn has_audio(&self) -> bool {
        self.audio.as_ref().map_or(false, |a| a.codec != AudioCodec::Unknown)
    }

    pub fn has_video(&self) -> bool {
        self.video.as_ref().map_or(false, |v| v.codec != VideoCodec::Unknown)
    }
}

/// Ordered batch of access units of a single stream delivered by the demuxer
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub stream: StreamType,
    pub units: Vec<AccessUnit>,
    pub configs: Option<StreamConfigs>,
}

impl Chunk {
    pub fn new(stream: StreamType, units: Vec<AccessUnit>) -> Self {
        Self {
            stream,
            units,
            configs: None,
        }
    }

    /// Attach the configuration announced by a trailing config-changed unit
    pub fn with_configs(mut self, configs: StreamConfigs) -> Self {
        self.configs = Some(configs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check the structural rules of a chunk
    ///
    /// End-of-stream and config-changed units may only appear last, every
    /// unit belongs to the chunk's stream, and configs are present exactly
    /// when the chunk ends with a config-changed unit.
    pub fn validate(&self) -> Result<()> {
        let last = self.units.len().saturating_sub(1);
        for (i, unit) in self.units.iter().enumerate() {
            if unit.stream() != self.stream {
                return Err(McPlayerError::InvalidInput(format!(
                    "{} unit at index {} in a {} chunk",
                    unit.stream(), i, self.stream
                )));
            }
            if i != last && (unit.is_end_of_stream() || unit.is_config_changed()) {
                return Err(McPlayerError::InvalidInput(format!(
                    "{:?} unit at index {} is not the last unit of its chunk",
                    unit.flags(), i
                )));
            }
        }

        let ends_with_config = self.units.last().map_or(false, |u| u.is_config_changed());
        if ends_with_config != self.configs.is_some() {
            return Err(McPlayerError::InvalidInput(
                "chunk configs must accompany a trailing config-changed unit".to_string(),
            ));
        }

        Ok(())
    }
}
