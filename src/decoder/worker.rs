//! Decoder worker thread
//!
//! The worker owns the codec and everything else the decode loop touches
//! while it runs. The controller takes the context back by joining the
//! thread, so no codec call ever happens on two threads at once.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::{CodecEngine, DequeueInput, DequeueOutput, Handle, QueueInputStatus};
use crate::decoder::access_unit_queue::AccessUnitQueue;
use crate::decoder::policy::{RenderMode, StreamPolicy};
use crate::decoder::{
    DecoderEvent, DecoderEventKind, DecoderShared, DecoderState, PendingEvent, StatsCounters,
};
use crate::internal_error;
use crate::media::{AccessUnit, StreamType};
use crate::utils::config::DecoderConfig;
use crate::utils::error::{McPlayerError, Result};

/// Config-changed units applied in place per input step
const MAX_CONFIG_UNITS_PER_STEP: usize = 10;

/// Granularity of the cancellable event send
const SEND_RETRY: Duration = Duration::from_millis(10);

/// Commands from the controller to a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    /// Playback starts; anchors the render clock
    Start { base: Duration },
    /// A decryption key became available
    KeyAdded,
}

/// Event sink of one worker run
///
/// Sends give up once the decoder's epoch moves past the run's epoch, so a
/// worker blocked on a full channel cannot hold up a synchronous stop.
pub struct Notifier {
    stream: StreamType,
    epoch: u64,
    events: Sender<DecoderEvent>,
    shared: Arc<DecoderShared>,
}

impl Notifier {
    pub(crate) fn new(stream: StreamType, events: Sender<DecoderEvent>, shared: Arc<DecoderShared>) -> Self {
        Self {
            stream,
            epoch: shared.epoch(),
            events,
            shared,
        }
    }

    /// Post an event; false when it was cancelled or nobody listens anymore
    pub fn notify(&self, kind: DecoderEventKind) -> bool {
        let mut event = DecoderEvent {
            stream: self.stream,
            epoch: self.epoch,
            kind,
        };
        loop {
            if self.shared.epoch() != self.epoch {
                trace!("{} event dropped: {:?}", self.stream, event.kind);
                return false;
            }
            match self.events.send_timeout(event, SEND_RETRY) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => event = returned,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Report rendered output
    pub fn time_update(&self, now_playing: Duration, last_buffered: Duration, postponed: bool) {
        self.notify(DecoderEventKind::TimeUpdate {
            now_playing,
            last_buffered,
            postponed,
        });
    }

    pub fn frame_rendered(&self) {
        StatsCounters::bump(&self.shared.stats.frames_rendered);
    }

    pub fn frame_late(&self) {
        StatsCounters::bump(&self.shared.stats.frames_late);
    }

    pub fn frame_skipped(&self) {
        StatsCounters::bump(&self.shared.stats.frames_skipped);
    }
}

/// Per-run connection between the controller and the worker
pub(crate) struct WorkerLink {
    pub(crate) notifier: Notifier,
    pub(crate) commands: Receiver<WorkerCommand>,
    pub(crate) start_base: Option<Duration>,
}

enum NextUnit {
    Unit(Arc<AccessUnit>),
    Drain,
    Starved,
}

/// Everything the decode loop owns
pub(crate) struct WorkerContext<P: StreamPolicy> {
    pub(crate) policy: P,
    pub(crate) codec: Option<Box<dyn CodecEngine>>,
    /// Latest configuration seen for the stream
    pub(crate) config: Option<P::Config>,
    /// Configuration the current codec was created for
    pub(crate) codec_config: Option<P::Config>,
    /// Input buffer held across iterations, waiting for a key or a retry
    pub(crate) pending_input: Option<Handle>,
    pub(crate) flags: PendingEvent,
    pub(crate) preroll_timestamp: Duration,
    pub(crate) always_reconfigure: bool,
    queue: Arc<AccessUnitQueue>,
    shared: Arc<DecoderShared>,
    settings: DecoderConfig,
}

impl<P: StreamPolicy> WorkerContext<P> {
    pub(crate) fn new(
        policy: P,
        queue: Arc<AccessUnitQueue>,
        shared: Arc<DecoderShared>,
        settings: DecoderConfig,
    ) -> Self {
        Self {
            policy,
            codec: None,
            config: None,
            codec_config: None,
            pending_input: None,
            flags: PendingEvent::empty(),
            preroll_timestamp: Duration::ZERO,
            always_reconfigure: false,
            queue,
            shared,
            settings,
        }
    }

    /// Drop the codec together with every buffer that belonged to it
    pub(crate) fn release_codec(&mut self) {
        if self.codec.take().is_some() {
            debug!("{} codec released", P::NAME);
        }
        self.policy.forget_pending();
        self.pending_input = None;
        self.codec_config = None;
    }

    /// Give delayed output buffers back without presenting them
    pub(crate) fn release_delayed_buffers(&mut self) -> Result<()> {
        match self.codec.as_deref_mut() {
            Some(codec) => self.policy.release_pending(codec),
            None => {
                self.policy.forget_pending();
                Ok(())
            }
        }
    }

    /// Output held back for a later release has reached its cap; no more
    /// input is queued and no more output is dequeued until one goes out
    pub(crate) fn delayed_frames_full(&self) -> bool {
        self.policy.pending_releases() >= self.settings.max_delayed_frames
    }

    /// Decode loop; returns the context for the controller to take back
    pub(crate) fn run(mut self, link: WorkerLink) -> Self {
        debug!("{} worker started in {:?}", P::NAME, self.shared.state());
        if let Some(base) = link.start_base {
            self.policy.on_start(base);
        }

        loop {
            match link.commands.recv_timeout(self.next_wait()) {
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(command) = link.commands.try_recv() {
                self.handle_command(command);
            }

            match self.shared.state() {
                DecoderState::Prerolling | DecoderState::Running => {
                    if let Err(err) = self.process_next_frame(&link.notifier) {
                        self.fail(err, &link.notifier);
                        break;
                    }
                    if self.flags.contains(PendingEvent::LAST_FRAME_POSTED) {
                        break;
                    }
                }
                DecoderState::Prerolled => {}
                DecoderState::Stopping => {
                    if let Err(err) = self.release_due(&link.notifier) {
                        self.fail(err, &link.notifier);
                        break;
                    }
                    if self.policy.pending_releases() == 0 {
                        self.post_last_frame(false, &link.notifier);
                        break;
                    }
                }
                DecoderState::Stopped
                | DecoderState::Prefetching
                | DecoderState::Prefetched
                | DecoderState::InEmergencyStop
                | DecoderState::Error => break,
            }
        }

        self.policy.on_stop();
        debug!("{} worker exiting in {:?}", P::NAME, self.shared.state());
        self
    }

    fn next_wait(&self) -> Duration {
        let delay = self.settings.frame_delay();
        match self.policy.next_release_due() {
            Some(due) => due.saturating_duration_since(Instant::now()).min(delay),
            None => delay,
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Start { base } => {
                debug!("{} starting at {:?}", P::NAME, base);
                self.policy.on_start(base);
            }
            WorkerCommand::KeyAdded => {
                if self.flags.contains(PendingEvent::MISSING_KEY) {
                    info!("{} key added, resuming secure input", P::NAME);
                }
                self.flags.remove(PendingEvent::MISSING_KEY);
            }
        }
    }

    fn codec_mut(&mut self) -> Result<&mut dyn CodecEngine> {
        match self.codec.as_deref_mut() {
            Some(codec) => Ok(codec),
            None => Err(internal_error!("{} decoding without a codec", P::NAME)),
        }
    }

    fn process_next_frame(&mut self, notifier: &Notifier) -> Result<()> {
        self.release_due(notifier)?;

        if !self.flags.contains(PendingEvent::EOS_ENQUEUED) {
            self.enqueue_input(notifier)?;
        }

        if !self.flags.contains(PendingEvent::EOS_REACHED) {
            self.drain_output(notifier)?;
        }

        if self.flags.contains(PendingEvent::EOS_REACHED) && self.policy.pending_releases() == 0 {
            self.post_last_frame(true, notifier);
        }

        Ok(())
    }

    fn release_due(&mut self, notifier: &Notifier) -> Result<()> {
        if self.policy.pending_releases() == 0 {
            return Ok(());
        }
        let codec = match self.codec.as_deref_mut() {
            Some(codec) => codec,
            None => return Err(internal_error!("{} has delayed buffers without a codec", P::NAME)),
        };
        self.policy.release_due(codec, notifier)
    }

    fn post_last_frame(&mut self, eos: bool, notifier: &Notifier) {
        if self.flags.contains(PendingEvent::LAST_FRAME_POSTED) {
            return;
        }
        self.flags.insert(PendingEvent::LAST_FRAME_POSTED);
        debug!("{} last frame rendered, eos={}", P::NAME, eos);
        notifier.notify(DecoderEventKind::LastFrameRendered { eos });
    }

    fn fail(&mut self, err: McPlayerError, notifier: &Notifier) {
        error!("{} failed: {}", P::NAME, err);
        let previous = self.shared.set_state(DecoderState::Error);
        if previous == DecoderState::InEmergencyStop {
            self.shared.set_state(previous);
            return;
        }
        notifier.notify(DecoderEventKind::Error(err.to_string()));
    }

    fn request_data(&self, notifier: &Notifier) {
        if self.shared.begin_data_request() {
            trace!("{} requesting data", P::NAME);
            notifier.notify(DecoderEventKind::RequestData);
        }
    }

    /// Find the next unit to feed, applying compatible config changes on the way
    fn next_access_unit(&mut self, notifier: &Notifier) -> NextUnit {
        for _ in 0..MAX_CONFIG_UNITS_PER_STEP {
            let info = self.queue.info();
            if info.data_length < self.settings.playback_low_limit && !info.eos_queued {
                self.request_data(notifier);
            }

            let Some(front) = info.front_unit else {
                return NextUnit::Starved;
            };
            let Some(configs) = info.configs else {
                return NextUnit::Unit(front);
            };

            let next = P::extract_config(&configs);
            let reconfigure = match (&self.codec_config, &next) {
                (Some(current), Some(next)) => {
                    self.always_reconfigure
                        || self.policy.is_reconfigure_needed(current, next, self.codec.as_deref())
                }
                _ => true,
            };

            if reconfigure {
                info!("{} config change needs a new codec, draining", P::NAME);
                self.flags.insert(PendingEvent::DRAIN_REQUIRED);
                return NextUnit::Drain;
            }

            debug!("{} config change applied in place", P::NAME);
            self.config = next.clone();
            self.codec_config = next;
            self.queue.advance();
        }

        warn!("{} too many consecutive config changes", P::NAME);
        NextUnit::Starved
    }

    fn enqueue_input(&mut self, notifier: &Notifier) -> Result<()> {
        if self.flags.contains(PendingEvent::MISSING_KEY) {
            return Ok(());
        }
        if self.delayed_frames_full() {
            return Ok(());
        }

        let next = if self.flags.contains(PendingEvent::DRAIN_REQUIRED) {
            NextUnit::Drain
        } else {
            self.next_access_unit(notifier)
        };

        let unit = match next {
            NextUnit::Starved => {
                if !self.flags.contains(PendingEvent::STARVATION_REPORTED) {
                    self.flags.insert(PendingEvent::STARVATION_REPORTED);
                    StatsCounters::bump(&self.shared.stats.starvations);
                    info!("{} starving", P::NAME);
                    notifier.notify(DecoderEventKind::Starvation);
                }
                return Ok(());
            }
            NextUnit::Drain => None,
            NextUnit::Unit(unit) => {
                self.flags.remove(PendingEvent::STARVATION_REPORTED);
                Some(unit)
            }
        };

        let timeout = self.settings.input_timeout();
        let pinned = self.pending_input.take();
        let codec = self.codec_mut()?;
        let buffer = match pinned {
            Some(buffer) => buffer,
            None => match codec.dequeue_input_buffer(timeout)? {
                DequeueInput::Available(buffer) => buffer,
                DequeueInput::TryAgain => return Ok(()),
            },
        };

        let unit = match unit {
            Some(unit) if !unit.is_end_of_stream() => unit,
            _ => {
                codec.queue_end_of_stream(buffer)?;
                self.flags.insert(PendingEvent::EOS_ENQUEUED);
                debug!("{} end of stream queued", P::NAME);
                return Ok(());
            }
        };

        let status = match unit.decrypt_config() {
            Some(decrypt) => {
                codec.queue_secure_input_buffer(buffer, unit.data(), decrypt, unit.timestamp())?
            }
            None => codec.queue_input_buffer(buffer, unit.data(), unit.timestamp())?,
        };

        match status {
            QueueInputStatus::Queued => {
                trace!("{} queued unit {:?}", P::NAME, unit.timestamp());
                self.queue.advance();
            }
            QueueInputStatus::TryAgain(buffer) => {
                self.pending_input = Some(buffer);
            }
            QueueInputStatus::NoKey(buffer) => {
                self.pending_input = Some(buffer);
                self.flags.insert(PendingEvent::MISSING_KEY);
                info!("{} no key for unit {:?}", P::NAME, unit.timestamp());
                notifier.notify(DecoderEventKind::MissingKey);
            }
        }

        Ok(())
    }

    fn drain_output(&mut self, notifier: &Notifier) -> Result<()> {
        let timeout = self.settings.output_timeout();
        loop {
            if self.delayed_frames_full() {
                return Ok(());
            }

            let codec = match self.codec.as_deref_mut() {
                Some(codec) => codec,
                None => return Err(internal_error!("{} decoding without a codec", P::NAME)),
            };

            match codec.dequeue_output_buffer(timeout)? {
                DequeueOutput::TryAgain => return Ok(()),
                DequeueOutput::BuffersChanged => {
                    debug!("{} output buffers changed", P::NAME);
                }
                DequeueOutput::FormatChanged => {
                    self.policy.on_output_format_changed(codec, notifier)?;
                }
                DequeueOutput::Buffer(buffer) => {
                    let eos = buffer.end_of_stream;
                    let has_data = buffer.size > 0 && !eos;
                    let prerolling = self.shared.state() == DecoderState::Prerolling;
                    let mode = if eos || buffer.timestamp < self.preroll_timestamp {
                        RenderMode::Skip
                    } else if prerolling {
                        RenderMode::AfterPreroll
                    } else {
                        RenderMode::Now
                    };

                    self.policy.render(codec, buffer, mode, notifier)?;

                    if eos {
                        debug!("{} end of stream reached", P::NAME);
                        self.flags.insert(PendingEvent::EOS_REACHED);
                        return Ok(());
                    }

                    if mode == RenderMode::AfterPreroll && has_data {
                        if self
                            .shared
                            .transition(DecoderState::Prerolling, DecoderState::Prerolled)
                        {
                            info!("{} preroll done", P::NAME);
                            notifier.notify(DecoderEventKind::PrerollDone);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}
