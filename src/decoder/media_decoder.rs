//! Controller side of a decoder
//!
//! Every method here runs on the player's controlling thread. While the
//! worker runs it owns the [`WorkerContext`]; the controller only touches
//! the shared state and the queue until it joins the worker again.

use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::{CodecFactory, CryptoContext, RenderTarget};
use crate::decoder::access_unit_queue::AccessUnitQueue;
use crate::decoder::policy::{ConfigureRequest, Configured, StreamPolicy};
use crate::decoder::video::VideoPolicy;
use crate::decoder::worker::{Notifier, WorkerCommand, WorkerContext, WorkerLink};
use crate::decoder::{
    ConfigStatus, DecoderEvent, DecoderShared, DecoderState, DecoderStats, PendingEvent,
    StatsCounters,
};
use crate::internal_error;
use crate::media::{Chunk, StreamConfigs, StreamType};
use crate::utils::config::DecoderConfig;
use crate::utils::error::{McPlayerError, Result};

/// Where a prefetch stands after new data arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchProgress {
    /// Enough data is queued
    Done,
    /// The queue needs another chunk
    NeedsData,
    /// The decoder is not prefetching
    Idle,
}

/// Outcome of [`MediaDecoder::request_to_stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopProgress {
    /// The decoder stopped synchronously; no last-frame event follows
    Stopped,
    /// The worker finishes delayed frames and then reports the last frame
    Pending,
    /// Nothing to stop
    Ignored,
}

/// What the controller learns when a worker run ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// The stream rendered its end of stream
    pub completed: bool,
    /// The run ended to recreate the codec for a config change
    pub drained: bool,
    /// The run ended while still prerolling
    pub preroll_interrupted: bool,
}

/// A decoder for one elementary stream
pub struct MediaDecoder<P: StreamPolicy> {
    queue: Arc<AccessUnitQueue>,
    shared: Arc<DecoderShared>,
    events: Sender<DecoderEvent>,
    factory: Arc<dyn CodecFactory>,
    settings: DecoderConfig,
    context: Option<WorkerContext<P>>,
    worker: Option<JoinHandle<WorkerContext<P>>>,
    commands: Option<Sender<WorkerCommand>>,
    /// Demuxer configs that arrived while the worker owned the context
    pending_config: Option<Option<P::Config>>,
    flags: PendingEvent,
    has_stream: bool,
    encrypted: bool,
    render_target: Option<RenderTarget>,
    preroll_timestamp: Duration,
}

impl<P: StreamPolicy> MediaDecoder<P> {
    pub fn new(
        policy: P,
        factory: Arc<dyn CodecFactory>,
        events: Sender<DecoderEvent>,
        settings: &DecoderConfig,
    ) -> Self {
        let queue = Arc::new(AccessUnitQueue::new(settings.history_chunks));
        let shared = Arc::new(DecoderShared::new());
        let context = WorkerContext::new(policy, Arc::clone(&queue), Arc::clone(&shared), settings.clone());

        Self {
            queue,
            shared,
            events,
            factory,
            settings: settings.clone(),
            context: Some(context),
            worker: None,
            commands: None,
            pending_config: None,
            flags: PendingEvent::NEEDS_PREROLL,
            has_stream: false,
            encrypted: false,
            render_target: None,
            preroll_timestamp: Duration::ZERO,
        }
    }

    /// Recreate the codec on every config change, compatible or not
    pub fn with_always_reconfigure(mut self, always: bool) -> Self {
        if let Some(ctx) = self.context.as_mut() {
            ctx.always_reconfigure = always;
        }
        self
    }

    pub fn stream_type(&self) -> StreamType {
        P::STREAM
    }

    pub fn state(&self) -> DecoderState {
        self.shared.state()
    }

    pub fn queue(&self) -> &Arc<AccessUnitQueue> {
        &self.queue
    }

    pub fn stats(&self) -> DecoderStats {
        self.shared.stats()
    }

    pub fn has_stream(&self) -> bool {
        self.has_stream
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == DecoderState::Stopped
    }

    pub fn is_completed(&self) -> bool {
        self.flags.contains(PendingEvent::COMPLETED)
    }

    /// True when the next start has to preroll first
    pub fn not_completed_and_needs_preroll(&self) -> bool {
        self.has_stream
            && !self.flags.contains(PendingEvent::COMPLETED)
            && self.flags.contains(PendingEvent::NEEDS_PREROLL)
    }

    /// Whether an event belongs to the current epoch
    pub fn accepts(&self, event: &DecoderEvent) -> bool {
        event.stream == P::STREAM && event.epoch() == self.shared.epoch()
    }

    /// Take the stream's slice of new demuxer configs
    pub fn set_demuxer_configs(&mut self, configs: &StreamConfigs) {
        let config = P::extract_config(configs);
        self.has_stream = config.is_some();
        self.encrypted = config.as_ref().is_some_and(P::is_encrypted);
        debug!("{} demuxer config {:?}", P::NAME, config);

        match self.context.as_mut() {
            Some(ctx) => ctx.config = config,
            None => self.pending_config = Some(config),
        }
    }

    /// Frames before `timestamp` are decoded but not presented
    pub fn set_preroll_timestamp(&mut self, timestamp: Duration) {
        debug!("{} preroll timestamp {:?}", P::NAME, timestamp);
        self.preroll_timestamp = timestamp;
        self.flags.insert(PendingEvent::NEEDS_PREROLL);
        if let Some(ctx) = self.context.as_mut() {
            ctx.preroll_timestamp = timestamp;
        }
    }

    pub fn set_base_timestamp(&mut self, base: Duration) {
        match self.context.as_mut() {
            Some(ctx) => ctx.policy.set_base_timestamp(base),
            None => warn!("{} base timestamp ignored while running", P::NAME),
        }
    }

    /// Mark a data request as sent; false if one is already in flight
    pub fn begin_data_request(&self) -> bool {
        self.shared.begin_data_request()
    }

    /// A chunk arrived from the demuxer
    pub fn on_data(&mut self, chunk: Chunk) -> PrefetchProgress {
        self.shared.end_data_request();

        if self.flags.contains(PendingEvent::INCOMING_DATA_INVALID) {
            self.flags.remove(PendingEvent::INCOMING_DATA_INVALID);
            debug!("{} discarding {} units requested before flush", P::NAME, chunk.len());
        } else if let Err(err) = self.queue.push_back(chunk) {
            warn!("{} rejected chunk: {}", P::NAME, err);
        }

        if self.state() == DecoderState::Prefetching {
            self.prefetch_progress()
        } else {
            PrefetchProgress::Idle
        }
    }

    /// Fill the queue before starting
    pub fn prefetch(&mut self) -> Result<PrefetchProgress> {
        if self.state() == DecoderState::Prefetched {
            return Ok(PrefetchProgress::Done);
        }
        if !self.shared.transition(DecoderState::Stopped, DecoderState::Prefetching) {
            return Err(self.invalid_state("prefetch"));
        }
        info!("{} prefetching", P::NAME);
        Ok(self.prefetch_progress())
    }

    fn prefetch_progress(&mut self) -> PrefetchProgress {
        let info = self.queue.info();
        let eos_enqueued = self
            .context
            .as_ref()
            .is_some_and(|ctx| ctx.flags.contains(PendingEvent::EOS_ENQUEUED));

        if eos_enqueued || info.eos_queued || info.data_length >= self.settings.prefetch_limit {
            if self.shared.transition(DecoderState::Prefetching, DecoderState::Prefetched) {
                debug!("{} prefetched {} units", P::NAME, info.data_length);
            }
            PrefetchProgress::Done
        } else {
            PrefetchProgress::NeedsData
        }
    }

    /// Create the codec if it is missing or has to be recreated
    pub fn configure(&mut self, crypto: Option<&CryptoContext>) -> ConfigStatus {
        match self.state() {
            DecoderState::Prefetched => {}
            DecoderState::Error => return ConfigStatus::Failure,
            DecoderState::Prerolling | DecoderState::Prerolled | DecoderState::Running => {
                return ConfigStatus::Ok;
            }
            other => {
                warn!("{} configure in {:?}", P::NAME, other);
                return ConfigStatus::Failure;
            }
        }

        let Some(ctx) = self.context.as_mut() else {
            error!("{} worker context missing", P::NAME);
            return ConfigStatus::Failure;
        };

        if self.flags.contains(PendingEvent::NEEDS_RECONFIGURE) {
            ctx.release_codec();
        }
        if ctx.codec.is_some() {
            return ConfigStatus::Ok;
        }

        // Config-changed units at the front describe the stream from here on
        loop {
            let Some(configs) = self.queue.info().configs else {
                break;
            };
            ctx.config = P::extract_config(&configs);
            self.queue.advance();
        }

        let Some(config) = ctx.config.clone() else {
            error!("{} configure without a stream config", P::NAME);
            return ConfigStatus::Failure;
        };
        self.encrypted = P::is_encrypted(&config);

        let request = ConfigureRequest {
            config: &config,
            queue: &self.queue,
            factory: self.factory.as_ref(),
            render_target: self.render_target.as_ref(),
            crypto,
        };

        match ctx.policy.configure(request) {
            Ok(Configured::Created(codec)) => {
                ctx.codec = Some(codec);
                ctx.codec_config = Some(config);
                ctx.flags.remove(PendingEvent::DRAIN_CYCLE);
                self.flags.remove(PendingEvent::NEEDS_RECONFIGURE);
                StatsCounters::bump(&self.shared.stats.codecs_created);
                info!("{} codec configured", P::NAME);
                ConfigStatus::Ok
            }
            Ok(Configured::KeyFrameRequired) => {
                info!("{} needs a key frame before configuring", P::NAME);
                ConfigStatus::KeyFrameRequired
            }
            Err(err) => {
                error!("{} configure failed: {}", P::NAME, err);
                ConfigStatus::Failure
            }
        }
    }

    /// Decode up to the preroll timestamp without a running clock
    pub fn preroll(&mut self) -> Result<()> {
        if self.state() != DecoderState::Prefetched {
            return Err(self.invalid_state("preroll"));
        }
        self.ensure_configured()?;
        info!("{} prerolling to {:?}", P::NAME, self.preroll_timestamp);
        self.spawn_worker(DecoderState::Prerolling, None)
    }

    /// Start decoding against a clock that starts at `base`
    pub fn start(&mut self, base: Duration) -> Result<()> {
        match self.state() {
            DecoderState::Running => Ok(()),
            DecoderState::Prefetched => {
                self.ensure_configured()?;
                self.flags.remove(PendingEvent::NEEDS_PREROLL);
                info!("{} starting at {:?}", P::NAME, base);
                self.spawn_worker(DecoderState::Running, Some(base))
            }
            DecoderState::Prerolled => {
                if self.flags.contains(PendingEvent::NEEDS_RECONFIGURE) {
                    return Err(self.invalid_state("start before reconfiguring"));
                }
                let commands = self
                    .commands
                    .as_ref()
                    .ok_or_else(|| McPlayerError::ChannelClosed(format!("{} worker", P::NAME)))?;
                commands
                    .send(WorkerCommand::Start { base })
                    .map_err(|_| McPlayerError::ChannelClosed(format!("{} worker", P::NAME)))?;
                if !self.shared.transition(DecoderState::Prerolled, DecoderState::Running) {
                    return Err(self.invalid_state("start"));
                }
                self.flags.remove(PendingEvent::NEEDS_PREROLL);
                info!("{} running from preroll at {:?}", P::NAME, base);
                Ok(())
            }
            other => {
                warn!("{} start in {:?}", P::NAME, other);
                Err(self.invalid_state("start"))
            }
        }
    }

    /// The worker rendered its first frame at the preroll timestamp
    pub fn on_preroll_done(&mut self) {
        self.flags.remove(PendingEvent::NEEDS_PREROLL);
    }

    /// Ask the worker to finish; a pending stop ends with a last-frame event
    pub fn request_to_stop(&mut self) -> StopProgress {
        loop {
            let state = self.state();
            match state {
                DecoderState::Running | DecoderState::Prerolling | DecoderState::Prerolled => {
                    if self.shared.transition(state, DecoderState::Stopping) {
                        info!("{} stopping", P::NAME);
                        return StopProgress::Pending;
                    }
                }
                DecoderState::Prefetching | DecoderState::Prefetched => {
                    if self.shared.transition(state, DecoderState::Stopped) {
                        debug!("{} stopped before start", P::NAME);
                        return StopProgress::Stopped;
                    }
                }
                DecoderState::Stopping
                | DecoderState::Stopped
                | DecoderState::InEmergencyStop
                | DecoderState::Error => return StopProgress::Ignored,
            }
        }
    }

    /// The worker posted its last frame and exited
    pub fn on_last_frame_rendered(&mut self, eos: bool) -> Result<StopReport> {
        let preroll_interrupted = matches!(
            self.state(),
            DecoderState::Prerolling | DecoderState::Prerolled
        );

        self.join_worker()?;
        if self.state() != DecoderState::Error {
            self.shared.set_state(DecoderState::Stopped);
        }

        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| internal_error!("{} worker context missing", P::NAME))?;

        let drained = ctx.flags.contains(PendingEvent::DRAIN_REQUIRED);
        if drained {
            ctx.flags.remove(PendingEvent::DRAIN_CYCLE);
            ctx.release_codec();
            self.flags.insert(PendingEvent::NEEDS_RECONFIGURE);
        }

        let completed = eos && !drained;
        if completed {
            self.flags.insert(PendingEvent::COMPLETED);
        }

        info!(
            "{} stopped (completed={}, drained={})",
            P::NAME,
            completed,
            drained
        );

        Ok(StopReport {
            completed,
            drained,
            preroll_interrupted,
        })
    }

    /// Stop immediately; pending events of this run are cancelled
    pub fn sync_stop(&mut self) {
        let state = self.state();
        self.shared.invalidate();

        if self.worker.is_none() {
            if matches!(state, DecoderState::Prefetching | DecoderState::Prefetched) {
                self.shared.set_state(DecoderState::Stopped);
            }
            return;
        }

        if state != DecoderState::Error {
            self.shared.set_state(DecoderState::InEmergencyStop);
        }
        if let Err(err) = self.join_worker() {
            error!("{} sync stop: {}", P::NAME, err);
        }
        if self.state() == DecoderState::InEmergencyStop {
            self.shared.set_state(DecoderState::Stopped);
        }

        if let Some(ctx) = self.context.as_mut() {
            if let Err(err) = ctx.release_delayed_buffers() {
                warn!("{} releasing delayed buffers: {}", P::NAME, err);
            }
            ctx.flags.remove(PendingEvent::RUN_SCOPED);
        }
        info!("{} stopped synchronously from {:?}", P::NAME, state);
    }

    /// Drop queued data and codec state; only while stopped
    pub fn flush(&mut self) -> Result<()> {
        match self.state() {
            DecoderState::Stopped | DecoderState::Error => {}
            _ => return Err(self.invalid_state("flush")),
        }

        self.shared.invalidate();
        self.queue.flush();
        if self.shared.data_request_pending() {
            self.flags.insert(PendingEvent::INCOMING_DATA_INVALID);
        }
        self.flags = self.flags.flushed() | PendingEvent::NEEDS_PREROLL;

        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| internal_error!("{} worker context missing", P::NAME))?;
        ctx.flags = ctx.flags.flushed();
        ctx.release_delayed_buffers()?;
        ctx.pending_input = None;
        ctx.policy.on_flush();

        if let Some(codec) = ctx.codec.as_mut() {
            if let Err(err) = codec.flush() {
                error!("{} codec flush failed: {}", P::NAME, err);
                self.shared.set_state(DecoderState::Error);
                return Err(err);
            }
        }
        debug!("{} flushed", P::NAME);
        Ok(())
    }

    /// Stop and destroy the codec
    pub fn release_codec(&mut self) {
        self.sync_stop();
        if let Some(ctx) = self.context.as_mut() {
            ctx.release_codec();
        }
    }

    pub fn notify_key_added(&mut self) {
        if let Some(commands) = self.commands.as_ref() {
            if commands.try_send(WorkerCommand::KeyAdded).is_err() {
                warn!("{} could not forward key added", P::NAME);
            }
        }
        if let Some(ctx) = self.context.as_mut() {
            ctx.flags.remove(PendingEvent::MISSING_KEY);
        }
    }

    /// Codec instances created so far
    pub fn codecs_created(&self) -> u64 {
        self.stats().codecs_created
    }

    fn invalid_state(&self, operation: &str) -> McPlayerError {
        McPlayerError::InvalidState(format!("{} cannot {} in {:?}", P::NAME, operation, self.state()))
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.flags.contains(PendingEvent::NEEDS_RECONFIGURE) {
            return Err(McPlayerError::Config(format!("{} needs reconfiguring", P::NAME)));
        }
        match self.context.as_ref() {
            Some(ctx) if ctx.codec.is_some() => Ok(()),
            _ => Err(McPlayerError::Config(format!("{} is not configured", P::NAME))),
        }
    }

    fn spawn_worker(&mut self, initial: DecoderState, start_base: Option<Duration>) -> Result<()> {
        let mut ctx = self
            .context
            .take()
            .ok_or_else(|| internal_error!("{} worker context missing", P::NAME))?;
        ctx.preroll_timestamp = self.preroll_timestamp;
        ctx.flags.remove(PendingEvent::RUN_SCOPED);

        let (commands, receiver) = bounded(self.settings.command_capacity);
        self.shared.set_state(initial);
        let link = WorkerLink {
            notifier: Notifier::new(P::STREAM, self.events.clone(), Arc::clone(&self.shared)),
            commands: receiver,
            start_base,
        };

        let spawned = thread::Builder::new()
            .name(format!("{}Thread", P::NAME))
            .spawn(move || ctx.run(link));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.commands = Some(commands);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(DecoderState::Error);
                Err(internal_error!("{} worker thread: {}", P::NAME, err))
            }
        }
    }

    fn join_worker(&mut self) -> Result<()> {
        self.commands = None;
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        match handle.join() {
            Ok(mut ctx) => {
                if let Some(config) = self.pending_config.take() {
                    ctx.config = config;
                }
                self.context = Some(ctx);
                Ok(())
            }
            Err(_) => {
                self.shared.set_state(DecoderState::Error);
                Err(internal_error!("{} worker panicked", P::NAME))
            }
        }
    }
}

impl MediaDecoder<VideoPolicy> {
    /// Setting, replacing or removing the target forces a new codec
    pub fn set_render_target(&mut self, target: Option<RenderTarget>) {
        if self.render_target != target {
            self.flags.insert(PendingEvent::NEEDS_RECONFIGURE);
        }
        self.render_target = target;
    }

    pub fn has_render_target(&self) -> bool {
        self.render_target.is_some()
    }
}

impl<P: StreamPolicy> Drop for MediaDecoder<P> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.sync_stop();
        }
    }
}
