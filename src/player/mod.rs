//! Player module for MCPlayer
//!
//! The controller thread owns both decoders and the demuxer connection and
//! drives them through the playback state machine. [`MediaPlayer`] is the
//! thread-safe front end that posts commands to it.

pub mod clock;
mod controller;
mod media_player;
pub mod state;

pub use clock::{ManualTimeSource, SystemTimeSource, TimeInterpolator, TimeSource};
pub use controller::PlayerController;
pub use media_player::{EventSubscription, MediaPlayer, MediaPlayerBuilder};
pub use state::{PlayerFlags, PlayerSnapshot, SeekRequest, StreamSet};

pub(crate) use controller::PlayerCommand;

use crossbeam_channel::Sender;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::codec::CryptoContext;
use crate::decoder::DecoderStats;
use crate::media::StreamType;
use crate::utils::error::ErrorKind;

/// Playback state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerState {
    Paused,
    WaitingForConfig,
    WaitingForPermission,
    Prefetching,
    WaitingForSurface,
    WaitingForKey,
    WaitingForDecryptor,
    Playing,
    Stopping,
    WaitingForSeek,
    Error,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Paused => "Paused",
            PlayerState::WaitingForConfig => "WaitingForConfig",
            PlayerState::WaitingForPermission => "WaitingForPermission",
            PlayerState::Prefetching => "Prefetching",
            PlayerState::WaitingForSurface => "WaitingForSurface",
            PlayerState::WaitingForKey => "WaitingForKey",
            PlayerState::WaitingForDecryptor => "WaitingForDecryptor",
            PlayerState::Playing => "Playing",
            PlayerState::Stopping => "Stopping",
            PlayerState::WaitingForSeek => "WaitingForSeek",
            PlayerState::Error => "Error",
        }
    }

    /// States in which playback will resume once an outside condition is met
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            PlayerState::WaitingForConfig
                | PlayerState::WaitingForPermission
                | PlayerState::Prefetching
                | PlayerState::WaitingForSurface
                | PlayerState::WaitingForKey
                | PlayerState::WaitingForDecryptor
        )
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications delivered to the embedder
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged { from: PlayerState, to: PlayerState },
    MetadataChanged { duration: Duration, width: u32, height: u32 },
    TimeUpdate { current: Duration },
    SeekDone { time: Duration },
    PlaybackComplete,
    /// Playback permission was refused
    PlaybackInterrupted,
    Error { kind: ErrorKind, message: String },
    WaitingForKey,
    DecoderProgress {
        stream: StreamType,
        now_playing: Duration,
        last_buffered: Duration,
    },
    CodecCreated { stream: StreamType },
}

/// Player event handler trait
pub trait PlayerEventHandler: Send {
    /// Handle a player event
    ///
    /// # Arguments
    ///
    /// * `event` - The event that occurred
    fn handle_event(&mut self, event: &PlayerEvent);
}

/// Grants or refuses the right to start playing
pub trait PlaybackPermission: Send + Sync {
    /// Ask whether playback may start
    ///
    /// # Arguments
    ///
    /// * `duration` - Media duration as reported by the demuxer
    /// * `has_audio` - Whether the media carries an audio stream
    ///
    /// # Returns
    ///
    /// Returns true if playback may start
    fn request_play(&self, duration: Duration, has_audio: bool) -> bool;
}

/// Permission that is always granted
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PlaybackPermission for AllowAll {
    fn request_play(&self, _duration: Duration, _has_audio: bool) -> bool {
        true
    }
}

/// Source of decryption contexts for encrypted streams
pub trait ContentDecryptor: Send + Sync {
    /// Context handed to codecs created for encrypted streams
    fn crypto_context(&self) -> CryptoContext;

    /// Register the listener to call whenever a new key becomes usable
    ///
    /// # Arguments
    ///
    /// * `listener` - Forwards key notifications to the player
    fn set_key_added_listener(&self, listener: KeyAddedListener);
}

/// Tells the player that a decryption key was added
#[derive(Debug, Clone)]
pub struct KeyAddedListener {
    commands: Sender<PlayerCommand>,
}

impl KeyAddedListener {
    pub(crate) fn new(commands: Sender<PlayerCommand>) -> Self {
        Self { commands }
    }

    pub fn notify_key_added(&self) {
        if self.commands.send(PlayerCommand::KeyAdded).is_err() {
            warn!("key added after the player was released");
        }
    }
}

/// Playback statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub audio: DecoderStats,
    pub video: DecoderStats,
    pub seeks_completed: u64,
}

impl PlaybackStats {
    pub fn frames_rendered(&self) -> u64 {
        self.audio.frames_rendered + self.video.frames_rendered
    }
}
