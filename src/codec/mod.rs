//! Codec Engine seam
//!
//! The platform decoder is external to the pipeline. Decoders drive it through
//! the [`CodecEngine`] trait and obtain instances from a [`CodecFactory`].
//! Buffer indices are [`Handle`]s: dequeuing a buffer hands its handle to the
//! caller, and queuing or releasing it moves the handle back to the engine.

pub mod handle;
pub mod mock;

pub use handle::{Handle, HandleArena};

use std::time::Duration;

use crate::media::{AudioConfigs, DecryptConfig, StreamType, VideoConfigs};
use crate::utils::error::Result;

/// Opaque rendering surface for video output
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTarget {
    id: u64,
    label: String,
}

impl RenderTarget {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Opaque crypto session handed to codecs that decode encrypted streams
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CryptoContext {
    pub key_system: String,
    pub session_id: u64,
}

/// Configuration a codec is created for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfig {
    Audio(AudioConfigs),
    Video(VideoConfigs),
}

impl CodecConfig {
    pub fn stream_type(&self) -> StreamType {
        match self {
            CodecConfig::Audio(_) => StreamType::Audio,
            CodecConfig::Video(_) => StreamType::Video,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        match self {
            CodecConfig::Audio(config) => config.is_encrypted,
            CodecConfig::Video(config) => config.is_encrypted,
        }
    }
}

/// Result of asking the codec for an input buffer
#[derive(Debug)]
pub enum DequeueInput {
    Available(Handle),
    TryAgain,
}

/// Result of queuing an input buffer
///
/// When the buffer is not consumed its handle comes back to the caller, who
/// keeps it pinned for the next attempt.
#[derive(Debug)]
pub enum QueueInputStatus {
    Queued,
    TryAgain(Handle),
    NoKey(Handle),
}

/// A decoded buffer owned by the caller until released
#[derive(Debug)]
pub struct OutputBuffer {
    pub handle: Handle,
    pub offset: usize,
    pub size: usize,
    pub timestamp: Duration,
    pub end_of_stream: bool,
}

/// Result of asking the codec for decoded output
#[derive(Debug)]
pub enum DequeueOutput {
    Buffer(OutputBuffer),
    BuffersChanged,
    FormatChanged,
    TryAgain,
}

/// Platform decoder driven by one decoder worker thread
pub trait CodecEngine: Send {
    /// Obtain an input buffer
    ///
    /// # Arguments
    ///
    /// * `timeout` - Longest time to wait for a free buffer
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<DequeueInput>;

    /// Submit a clear access unit
    fn queue_input_buffer(
        &mut self,
        buffer: Handle,
        payload: &[u8],
        timestamp: Duration,
    ) -> Result<QueueInputStatus>;

    /// Submit an encrypted access unit
    ///
    /// # Returns
    ///
    /// `NoKey` with the buffer handle when the key is not available yet
    fn queue_secure_input_buffer(
        &mut self,
        buffer: Handle,
        payload: &[u8],
        decrypt: &DecryptConfig,
        timestamp: Duration,
    ) -> Result<QueueInputStatus>;

    /// Submit the end-of-stream marker
    fn queue_end_of_stream(&mut self, buffer: Handle) -> Result<()>;

    /// Obtain decoded output or a status change
    ///
    /// # Arguments
    ///
    /// * `timeout` - Longest time to wait for output
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<DequeueOutput>;

    /// Decoded bytes of an output buffer the caller still owns
    fn output_data(&self, buffer: &OutputBuffer) -> Result<&[u8]>;

    /// Give an output buffer back, optionally presenting it on the render target
    fn release_output_buffer(&mut self, buffer: Handle, render: bool) -> Result<()>;

    /// Discard all pending input and output; outstanding handles become stale
    fn flush(&mut self) -> Result<()>;

    fn output_sampling_rate(&self) -> u32 {
        0
    }

    fn output_channel_count(&self) -> u16 {
        0
    }

    /// Decoded picture size for video codecs
    fn output_size(&self) -> (u32, u32) {
        (0, 0)
    }

    /// Whether the codec can switch to the given picture size without being recreated
    fn is_adaptive_playback_supported(&self, _width: u32, _height: u32) -> bool {
        false
    }
}

/// Creates codec instances for decoders
pub trait CodecFactory: Send + Sync {
    /// Create a codec for the given configuration
    ///
    /// # Arguments
    ///
    /// * `config` - Stream configuration the codec decodes
    /// * `target` - Render target for video codecs
    /// * `crypto` - Crypto session for encrypted streams
    fn create(
        &self,
        config: &CodecConfig,
        target: Option<&RenderTarget>,
        crypto: Option<&CryptoContext>,
    ) -> Result<Box<dyn CodecEngine>>;
}
