//! Demuxer interface for MCPlayer
//!
//! The demuxer parses the container and delivers encoded access units. It is
//! driven from the player's controlling thread and answers through a
//! [`DemuxerClient`], whose messages are handled on that same thread.

pub mod mock;

use crossbeam_channel::Sender;
use std::time::Duration;

use crate::media::{Chunk, StreamConfigs, StreamType};
use crate::utils::error::{McPlayerError, Result};

/// Source of encoded media
pub trait Demuxer: Send {
    /// Connect the demuxer to the player
    ///
    /// # Arguments
    ///
    /// * `client` - Where the demuxer reports configs, data and seek results
    fn initialize(&mut self, client: DemuxerClient) -> Result<()>;

    /// Ask for the next chunk of a stream; answered by one `on_data_available`
    fn request_data(&mut self, stream: StreamType);

    /// Reposition both streams
    ///
    /// # Arguments
    ///
    /// * `time` - Target position
    /// * `is_browser_seek` - The player seeks on its own to obtain a key frame;
    ///   the demuxer reports the position it actually reached
    fn request_seek(&mut self, time: Duration, is_browser_seek: bool);
}

/// Demuxer message as seen by the player
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DemuxerMessage {
    ConfigsAvailable(StreamConfigs),
    DataAvailable(Chunk),
    SeekDone(Option<Duration>),
    DurationChanged(Duration),
}

/// Reply channel handed to [`Demuxer::initialize`]
#[derive(Debug, Clone)]
pub struct DemuxerClient {
    sender: Sender<DemuxerMessage>,
}

impl DemuxerClient {
    pub(crate) fn new(sender: Sender<DemuxerMessage>) -> Self {
        Self { sender }
    }

    pub fn on_configs_available(&self, configs: StreamConfigs) -> Result<()> {
        self.send(DemuxerMessage::ConfigsAvailable(configs))
    }

    pub fn on_data_available(&self, chunk: Chunk) -> Result<()> {
        self.send(DemuxerMessage::DataAvailable(chunk))
    }

    /// `actual` is the reached position for browser seeks, `None` otherwise
    pub fn on_seek_done(&self, actual: Option<Duration>) -> Result<()> {
        self.send(DemuxerMessage::SeekDone(actual))
    }

    pub fn on_duration_changed(&self, duration: Duration) -> Result<()> {
        self.send(DemuxerMessage::DurationChanged(duration))
    }

    fn send(&self, message: DemuxerMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| McPlayerError::ChannelClosed("player is gone".to_string()))
    }
}
