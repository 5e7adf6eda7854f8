//! Stream-specific decoder behavior
//!
//! The decode loop is shared by audio and video; codec creation, output
//! format handling and rendering differ and are provided by a [`StreamPolicy`].

use std::fmt;
use std::time::{Duration, Instant};

use crate::codec::{CodecEngine, CodecFactory, CryptoContext, OutputBuffer, RenderTarget};
use crate::decoder::access_unit_queue::AccessUnitQueue;
use crate::decoder::worker::Notifier;
use crate::media::{StreamConfigs, StreamType};
use crate::utils::error::Result;

/// How a decoded buffer is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Before the preroll timestamp: release without presenting
    Skip,
    /// First frame of a preroll: present immediately, it is not clocked yet
    AfterPreroll,
    /// Present according to the playback clock
    Now,
}

/// Inputs for creating a codec
pub struct ConfigureRequest<'a, C> {
    pub config: &'a C,
    pub queue: &'a AccessUnitQueue,
    pub factory: &'a dyn CodecFactory,
    pub render_target: Option<&'a RenderTarget>,
    pub crypto: Option<&'a CryptoContext>,
}

/// Outcome of [`StreamPolicy::configure`]
pub enum Configured {
    Created(Box<dyn CodecEngine>),
    KeyFrameRequired,
}

impl fmt::Debug for Configured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Configured::Created(_) => f.write_str("Created"),
            Configured::KeyFrameRequired => f.write_str("KeyFrameRequired"),
        }
    }
}

/// Stream-specific half of a decoder
pub trait StreamPolicy: Send + 'static {
    /// Per-stream slice of [`StreamConfigs`]
    type Config: Clone + fmt::Debug + PartialEq + Send + 'static;

    const STREAM: StreamType;

    /// Name used in logs and thread names
    const NAME: &'static str;

    /// This stream's configuration, if the stream is present
    fn extract_config(configs: &StreamConfigs) -> Option<Self::Config>;

    fn is_encrypted(config: &Self::Config) -> bool;

    /// Whether switching from `current` to `next` requires draining and
    /// recreating the codec
    fn is_reconfigure_needed(
        &self,
        current: &Self::Config,
        next: &Self::Config,
        codec: Option<&dyn CodecEngine>,
    ) -> bool;

    /// Create a codec for the request's configuration
    fn configure(&mut self, request: ConfigureRequest<'_, Self::Config>) -> Result<Configured>;

    /// The codec announced a new output format
    fn on_output_format_changed(&mut self, codec: &dyn CodecEngine, notifier: &Notifier) -> Result<()>;

    /// Present or drop one decoded buffer and release it
    fn render(
        &mut self,
        codec: &mut dyn CodecEngine,
        buffer: OutputBuffer,
        mode: RenderMode,
        notifier: &Notifier,
    ) -> Result<()>;

    /// Playback starts at `base` on the media timeline
    fn on_start(&mut self, _base: Duration) {}

    /// The worker is exiting
    fn on_stop(&mut self) {}

    /// Queued data and codec state were discarded
    fn on_flush(&mut self) {}

    fn set_base_timestamp(&mut self, _base: Duration) {}

    /// Buffers waiting for their presentation time
    fn pending_releases(&self) -> usize {
        0
    }

    /// When the earliest waiting buffer is due
    fn next_release_due(&self) -> Option<Instant> {
        None
    }

    /// Present the waiting buffers whose time has come
    fn release_due(&mut self, _codec: &mut dyn CodecEngine, _notifier: &Notifier) -> Result<()> {
        Ok(())
    }

    /// Give every waiting buffer back to the codec without presenting it
    fn release_pending(&mut self, _codec: &mut dyn CodecEngine) -> Result<()> {
        Ok(())
    }

    /// Forget waiting buffers whose codec is gone
    fn forget_pending(&mut self) {}
}
