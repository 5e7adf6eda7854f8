//! Decoder module for MCPlayer
//!
//! A [`MediaDecoder`] moves access units from its [`AccessUnitQueue`] into a
//! Codec Engine on a dedicated worker thread and renders the decoded output.
//! The state machine and the decode loop are shared; everything that differs
//! between audio and video lives behind the [`StreamPolicy`] trait.
//!
//! Controller-side operations run on the player's controlling thread. The
//! worker reports back through [`DecoderEvent`]s on a bounded channel; every
//! event carries the epoch it was produced in, and events from an epoch that
//! was cancelled by a synchronous stop or a flush are ignored.

pub mod access_unit_queue;
pub mod audio;
mod media_decoder;
pub mod policy;
pub mod video;
mod worker;

pub use access_unit_queue::{AccessUnitQueue, QueueInfo, QueueStats};
pub use audio::{AudioPolicy, AudioTimestampHelper};
pub use media_decoder::{MediaDecoder, PrefetchProgress, StopProgress, StopReport};
pub use policy::{ConfigureRequest, Configured, RenderMode, StreamPolicy};
pub use video::VideoPolicy;
pub use worker::Notifier;

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::media::StreamType;

/// Audio specialization of the decoder
pub type AudioDecoder = MediaDecoder<AudioPolicy>;

/// Video specialization of the decoder
pub type VideoDecoder = MediaDecoder<VideoPolicy>;

/// Lifecycle of a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoderState {
    /// Idle; no worker thread
    Stopped,

    /// Waiting for the queue to fill up
    Prefetching,

    /// Enough data is queued to start
    Prefetched,

    /// Worker running, decoding until the preroll timestamp is reached
    Prerolling,

    /// Worker idle with the first frame at the preroll timestamp decoded
    Prerolled,

    /// Worker decoding and rendering against the clock
    Running,

    /// Worker finishing delayed renders before reporting stop
    Stopping,

    /// Synchronous stop in progress
    InEmergencyStop,

    /// Unrecoverable codec failure
    Error,
}

/// Outcome of configuring a decoder's codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Ok,
    KeyFrameRequired,
    Failure,
}

bitflags! {
    /// Pending conditions of a decoder
    ///
    /// The controller side owns `NEEDS_RECONFIGURE`, `NEEDS_PREROLL`,
    /// `COMPLETED` and `INCOMING_DATA_INVALID`; the worker owns the rest and
    /// hands them back when it is joined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PendingEvent: u32 {
        /// The codec must be recreated before the next start
        const NEEDS_RECONFIGURE = 1 << 0;
        /// The next start must preroll to the preroll timestamp first
        const NEEDS_PREROLL = 1 << 1;
        /// The stream rendered its last frame
        const COMPLETED = 1 << 2;
        /// Data requested before a flush must be discarded on arrival
        const INCOMING_DATA_INVALID = 1 << 3;
        /// An incompatible config change is pending; feed end of stream
        const DRAIN_REQUIRED = 1 << 4;
        /// End of stream was queued into the codec
        const EOS_ENQUEUED = 1 << 5;
        /// The codec emitted its end-of-stream buffer
        const EOS_REACHED = 1 << 6;
        /// Secure input is waiting for a key
        const MISSING_KEY = 1 << 7;
        /// The last-frame notification for this run was posted
        const LAST_FRAME_POSTED = 1 << 8;
        /// Starvation was reported for the current episode
        const STARVATION_REPORTED = 1 << 9;
    }
}

impl PendingEvent {
    /// Worker-owned conditions that end with the current run
    pub const RUN_SCOPED: Self = Self::LAST_FRAME_POSTED.union(Self::STARVATION_REPORTED);

    /// Worker-owned conditions of one drain cycle
    pub const DRAIN_CYCLE: Self = Self::DRAIN_REQUIRED
        .union(Self::EOS_ENQUEUED)
        .union(Self::EOS_REACHED);

    /// Worker-owned conditions tied to the stream position
    pub const STREAM_POSITION: Self = Self::DRAIN_CYCLE
        .union(Self::MISSING_KEY)
        .union(Self::RUN_SCOPED);

    /// Flags left after a flush: position-bound conditions and completion are gone
    pub fn flushed(self) -> Self {
        self - Self::STREAM_POSITION - Self::COMPLETED
    }
}

/// What a decoder worker reports to the controlling thread
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEventKind {
    /// The queue ran low; ask the demuxer for the next chunk
    RequestData,

    /// The queue ran dry while decoding
    Starvation,

    /// The first frame at or after the preroll timestamp was decoded
    PrerollDone,

    /// The worker finished; `eos` is set when the end-of-stream buffer was rendered
    LastFrameRendered { eos: bool },

    /// Secure input was rejected for lack of a key
    MissingKey,

    /// Output was rendered
    TimeUpdate {
        now_playing: Duration,
        last_buffered: Duration,
        postponed: bool,
    },

    /// The decoded picture size changed
    VideoSizeChanged { width: u32, height: u32 },

    /// Unrecoverable codec error
    Error(String),
}

/// Notification from a decoder worker
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderEvent {
    pub stream: StreamType,
    pub(crate) epoch: u64,
    pub kind: DecoderEventKind,
}

impl DecoderEvent {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderStats {
    /// Frames presented (video) or written to the sink (audio)
    pub frames_rendered: u64,

    /// Frames presented after their due time
    pub frames_late: u64,

    /// Frames dropped before the preroll timestamp
    pub frames_skipped: u64,

    /// Codec instances created
    pub codecs_created: u64,

    /// Starvation episodes
    pub starvations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) frames_rendered: AtomicU64,
    pub(crate) frames_late: AtomicU64,
    pub(crate) frames_skipped: AtomicU64,
    pub(crate) codecs_created: AtomicU64,
    pub(crate) starvations: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DecoderStats {
        DecoderStats {
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_late: self.frames_late.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            codecs_created: self.codecs_created.load(Ordering::Relaxed),
            starvations: self.starvations.load(Ordering::Relaxed),
        }
    }
}

/// State shared between a decoder and its worker thread
#[derive(Debug)]
pub(crate) struct DecoderShared {
    state: Mutex<DecoderState>,
    epoch: AtomicU64,
    data_requested: AtomicBool,
    pub(crate) stats: StatsCounters,
}

impl DecoderShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DecoderState::Stopped),
            epoch: AtomicU64::new(0),
            data_requested: AtomicBool::new(false),
            stats: StatsCounters::default(),
        }
    }

    pub(crate) fn state(&self) -> DecoderState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: DecoderState) -> DecoderState {
        std::mem::replace(&mut *self.state.lock(), state)
    }

    /// Move from `from` to `to`; false when the state changed underneath
    pub(crate) fn transition(&self, from: DecoderState, to: DecoderState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Cancel every event produced so far
    pub(crate) fn invalidate(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mark a data request as in flight; false if one already is
    pub(crate) fn begin_data_request(&self) -> bool {
        !self.data_requested.swap(true, Ordering::SeqCst)
    }

    /// Clear the in-flight mark; returns whether a request was outstanding
    pub(crate) fn end_data_request(&self) -> bool {
        self.data_requested.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn data_request_pending(&self) -> bool {
        self.data_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> DecoderStats {
        self.stats.snapshot()
    }
}
