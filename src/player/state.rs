//! Player state tracking for MCPlayer
//!
//! Flags and bookkeeping owned by the controller thread, and the snapshot it
//! publishes for other threads to read.

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::media::StreamType;
use crate::player::{PlaybackStats, PlayerState};
use crate::utils::error::{McPlayerError, Result};

bitflags! {
    /// Conditions remembered across state transitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlayerFlags: u8 {
        /// Resume playing once the current stop or seek finishes
        const PENDING_START = 1 << 0;
        /// A decoder reported secure input without a usable key
        const KEY_IS_REQUIRED = 1 << 1;
        /// A key arrived since playback last started
        const KEY_IS_ADDED = 1 << 2;
    }
}

impl PlayerFlags {
    /// Playback must wait for a key before it can continue
    pub fn waits_for_key(self) -> bool {
        self.contains(PlayerFlags::KEY_IS_REQUIRED) && !self.contains(PlayerFlags::KEY_IS_ADDED)
    }
}

bitflags! {
    /// A subset of the two elementary streams
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamSet: u8 {
        const AUDIO = 1 << 0;
        const VIDEO = 1 << 1;
    }
}

impl From<StreamType> for StreamSet {
    fn from(stream: StreamType) -> Self {
        match stream {
            StreamType::Audio => StreamSet::AUDIO,
            StreamType::Video => StreamSet::VIDEO,
        }
    }
}

/// A demuxer seek in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub time: Duration,
    /// Issued by the player to reach a key frame rather than by the caller
    pub is_browser_seek: bool,
}

impl SeekRequest {
    pub fn new(time: Duration, is_browser_seek: bool) -> Self {
        Self { time, is_browser_seek }
    }

    /// Position playback continues from once the demuxer answered
    pub fn resolve(&self, actual: Option<Duration>) -> Duration {
        match (self.is_browser_seek, actual) {
            (true, Some(actual)) => actual,
            _ => self.time,
        }
    }
}

/// Point-in-time view of the player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub state: PlayerState,
    pub current_time: Duration,
    pub duration: Duration,
    pub video_size: (u32, u32),
    pub stats: PlaybackStats,
}

impl Default for PlayerSnapshot {
    fn default() -> Self {
        Self {
            state: PlayerState::Paused,
            current_time: Duration::ZERO,
            duration: Duration::ZERO,
            video_size: (0, 0),
            stats: PlaybackStats::default(),
        }
    }
}

impl PlayerSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| McPlayerError::Internal(format!("snapshot serialization: {}", e)))
    }
}

/// Snapshot cell written by the controller thread
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedSnapshot {
    inner: Arc<RwLock<PlayerSnapshot>>,
}

impl SharedSnapshot {
    pub(crate) fn publish(&self, snapshot: PlayerSnapshot) {
        *self.inner.write() = snapshot;
    }

    pub(crate) fn read(&self) -> PlayerSnapshot {
        self.inner.read().clone()
    }
}
