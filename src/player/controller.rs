//! Player controller implementation for MCPlayer
//!
//! The controller runs on its own thread. It owns the demuxer and both
//! decoders, and every state change of the player happens here in response
//! to a caller command, a demuxer message or a decoder event.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioSink, VolumeControl};
use crate::codec::{CodecFactory, RenderTarget};
use crate::decoder::{
    AudioDecoder, AudioPolicy, ConfigStatus, DecoderEvent, DecoderEventKind, DecoderState,
    MediaDecoder, PrefetchProgress, StopProgress, VideoDecoder, VideoPolicy,
};
use crate::demuxer::{Demuxer, DemuxerClient, DemuxerMessage};
use crate::media::{Chunk, StreamConfigs, StreamType};
use crate::player::clock::{TimeInterpolator, TimeSource};
use crate::player::media_player::EventDispatcher;
use crate::player::state::{PlayerFlags, PlayerSnapshot, SeekRequest, SharedSnapshot, StreamSet};
use crate::player::{
    ContentDecryptor, KeyAddedListener, PlaybackPermission, PlaybackStats, PlayerEvent, PlayerState,
};
use crate::utils::config::Config;
use crate::utils::error::{McPlayerError, Result};

/// Commands posted to the controller thread
pub(crate) enum PlayerCommand {
    Start,
    Pause,
    SeekTo(Duration),
    Release,
    SetRenderTarget(Option<RenderTarget>),
    SetVolume(f32),
    SetContentDecryptor(Arc<dyn ContentDecryptor>),
    KeyAdded,
    Shutdown,
}

impl fmt::Debug for PlayerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerCommand::Start => f.write_str("Start"),
            PlayerCommand::Pause => f.write_str("Pause"),
            PlayerCommand::SeekTo(time) => write!(f, "SeekTo({:?})", time),
            PlayerCommand::Release => f.write_str("Release"),
            PlayerCommand::SetRenderTarget(target) => write!(f, "SetRenderTarget({:?})", target),
            PlayerCommand::SetVolume(volume) => write!(f, "SetVolume({})", volume),
            PlayerCommand::SetContentDecryptor(_) => f.write_str("SetContentDecryptor"),
            PlayerCommand::KeyAdded => f.write_str("KeyAdded"),
            PlayerCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Work the controller schedules for itself after the current message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    PermissionDecided(bool),
    PrefetchDone,
    StopDone,
}

/// Everything the controller needs, assembled by the builder
pub(crate) struct ControllerParts {
    pub config: Config,
    pub demuxer: Box<dyn Demuxer>,
    pub factory: Arc<dyn CodecFactory>,
    pub audio_sink: Box<dyn AudioSink>,
    pub volume: VolumeControl,
    pub permission: Arc<dyn PlaybackPermission>,
    pub time_source: Box<dyn TimeSource>,
    pub dispatcher: Arc<EventDispatcher>,
    pub snapshot: SharedSnapshot,
    pub commands: Receiver<PlayerCommand>,
    pub command_tx: Sender<PlayerCommand>,
}

/// Run `$body` with `$decoder` bound to the decoder of `$stream`
macro_rules! with_decoder {
    ($self:ident, $stream:expr, $decoder:ident => $body:expr) => {
        match $stream {
            StreamType::Audio => {
                let $decoder = &mut $self.audio;
                $body
            }
            StreamType::Video => {
                let $decoder = &mut $self.video;
                $body
            }
        }
    };
}

/// The player state machine
pub struct PlayerController {
    state: PlayerState,
    flags: PlayerFlags,

    audio: AudioDecoder,
    video: VideoDecoder,
    demuxer: Box<dyn Demuxer>,
    permission: Arc<dyn PlaybackPermission>,
    decryptor: Option<Arc<dyn ContentDecryptor>>,
    volume: VolumeControl,
    interpolator: TimeInterpolator,

    duration: Duration,
    video_size: (u32, u32),
    pending_seek: Option<Duration>,
    seek_in_flight: Option<SeekRequest>,
    seeks_completed: u64,

    /// Streams whose prefetch has not finished yet
    prefetching: StreamSet,
    /// Streams whose preroll has not finished yet
    prerolling: StreamSet,
    deferred: VecDeque<Deferred>,

    commands: Receiver<PlayerCommand>,
    command_tx: Sender<PlayerCommand>,
    demuxer_rx: Receiver<DemuxerMessage>,
    decoder_rx: Receiver<DecoderEvent>,
    /// Keeps the demuxer channel connected after the demuxer goes away
    _demuxer_tx: Sender<DemuxerMessage>,

    dispatcher: Arc<EventDispatcher>,
    snapshot: SharedSnapshot,
}

impl PlayerController {
    pub(crate) fn new(parts: ControllerParts) -> Result<Self> {
        let ControllerParts {
            config,
            mut demuxer,
            factory,
            audio_sink,
            volume,
            permission,
            time_source,
            dispatcher,
            snapshot,
            commands,
            command_tx,
        } = parts;

        let (event_tx, decoder_rx) = bounded(config.decoder.event_capacity);
        let (demuxer_tx, demuxer_rx) = bounded(config.playback.demuxer_capacity);

        let audio_policy = AudioPolicy::new(audio_sink, volume.clone(), config.audio.bytes_per_sample);
        let audio = MediaDecoder::new(audio_policy, Arc::clone(&factory), event_tx.clone(), &config.decoder)
            .with_always_reconfigure(config.playback.always_reconfigure_audio);

        let video_policy = VideoPolicy::new(Duration::from_millis(config.playback.late_frame_threshold_ms));
        let video = MediaDecoder::new(video_policy, factory, event_tx, &config.decoder)
            .with_always_reconfigure(config.playback.always_reconfigure_video);

        demuxer.initialize(DemuxerClient::new(demuxer_tx.clone()))?;

        Ok(Self {
            state: PlayerState::Paused,
            flags: PlayerFlags::empty(),
            audio,
            video,
            demuxer,
            permission,
            decryptor: None,
            volume,
            interpolator: TimeInterpolator::new(time_source),
            duration: Duration::ZERO,
            video_size: (0, 0),
            pending_seek: None,
            seek_in_flight: None,
            seeks_completed: 0,
            prefetching: StreamSet::empty(),
            prerolling: StreamSet::empty(),
            deferred: VecDeque::new(),
            commands,
            command_tx,
            demuxer_rx,
            decoder_rx,
            _demuxer_tx: demuxer_tx,
            dispatcher,
            snapshot,
        })
    }

    /// Process messages until shutdown
    pub fn run(mut self) {
        info!("Player controller started");
        self.publish_snapshot();

        let commands = self.commands.clone();
        let demuxer_rx = self.demuxer_rx.clone();
        let decoder_rx = self.decoder_rx.clone();

        loop {
            let running = select! {
                recv(commands) -> message => match message {
                    Ok(PlayerCommand::Shutdown) | Err(_) => false,
                    Ok(command) => {
                        self.handle_command(command);
                        true
                    }
                },
                recv(demuxer_rx) -> message => {
                    if let Ok(message) = message {
                        self.handle_demuxer_message(message);
                    }
                    true
                }
                recv(decoder_rx) -> event => {
                    if let Ok(event) = event {
                        self.handle_decoder_event(event);
                    }
                    true
                }
            };
            if !running {
                break;
            }
            self.run_deferred();
            self.publish_snapshot();
        }

        self.release_decoder_resources();
        self.publish_snapshot();
        info!("Player controller stopped");
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    fn handle_command(&mut self, command: PlayerCommand) {
        debug!("Command {:?} in {}", command, self.state);
        match command {
            PlayerCommand::Start => self.start(),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::SeekTo(time) => self.seek_to(time),
            PlayerCommand::Release => self.release(),
            PlayerCommand::SetRenderTarget(target) => self.set_render_target(target),
            PlayerCommand::SetVolume(volume) => self.volume.set_volume(volume),
            PlayerCommand::SetContentDecryptor(decryptor) => self.set_content_decryptor(decryptor),
            PlayerCommand::KeyAdded => self.on_key_added(),
            PlayerCommand::Shutdown => {}
        }
    }

    fn handle_demuxer_message(&mut self, message: DemuxerMessage) {
        match message {
            DemuxerMessage::ConfigsAvailable(configs) => self.on_configs_available(configs),
            DemuxerMessage::DataAvailable(chunk) => self.on_data_available(chunk),
            DemuxerMessage::SeekDone(actual) => self.on_seek_done(actual),
            DemuxerMessage::DurationChanged(duration) => {
                info!("Duration changed to {:?}", duration);
                self.duration = duration;
                self.emit_metadata();
            }
        }
    }

    fn handle_decoder_event(&mut self, event: DecoderEvent) {
        let stream = event.stream;
        let accepted = with_decoder!(self, stream, decoder => decoder.accepts(&event));
        if !accepted {
            trace!("Dropping stale {} event {:?}", stream, event.kind);
            return;
        }

        match event.kind {
            DecoderEventKind::RequestData => self.demuxer.request_data(stream),
            DecoderEventKind::Starvation => self.on_starvation(stream),
            DecoderEventKind::PrerollDone => self.on_preroll_done(stream),
            DecoderEventKind::LastFrameRendered { eos } => self.on_last_frame_rendered(stream, eos),
            DecoderEventKind::MissingKey => self.on_missing_key(stream),
            DecoderEventKind::TimeUpdate {
                now_playing,
                last_buffered,
                postponed,
            } => self.on_time_update(stream, now_playing, last_buffered, postponed),
            DecoderEventKind::VideoSizeChanged { width, height } => {
                if self.video_size != (width, height) {
                    self.video_size = (width, height);
                    self.emit_metadata();
                }
            }
            DecoderEventKind::Error(message) => self.fail(McPlayerError::Codec(message)),
        }
    }

    fn run_deferred(&mut self) {
        while let Some(task) = self.deferred.pop_front() {
            match task {
                Deferred::PermissionDecided(granted) => self.on_permission_decided(granted),
                Deferred::PrefetchDone => self.on_prefetch_done(),
                Deferred::StopDone => self.on_stop_done(),
            }
        }
    }

    // Commands

    fn start(&mut self) {
        match self.state {
            PlayerState::Paused => {
                if self.has_media() && self.audio_finished() && self.video_finished() {
                    info!("Start at end of media");
                    self.emit(PlayerEvent::PlaybackComplete);
                    return;
                }
                self.resume_start();
            }
            PlayerState::Stopping | PlayerState::WaitingForSeek => {
                self.flags.insert(PlayerFlags::PENDING_START);
            }
            other => debug!("Start ignored in {}", other),
        }
    }

    fn pause(&mut self) {
        match self.state {
            PlayerState::Playing => {
                self.set_state(PlayerState::Stopping);
                self.request_to_stop_decoders();
            }
            state if state.is_waiting() => {
                self.set_state(PlayerState::Paused);
                self.sync_stop_decoders();
            }
            PlayerState::Stopping | PlayerState::WaitingForSeek => {
                self.flags.remove(PlayerFlags::PENDING_START);
            }
            _ => {}
        }
    }

    fn seek_to(&mut self, time: Duration) {
        info!("Seek to {:?} in {}", time, self.state);
        match self.state {
            PlayerState::Paused => {
                self.set_state(PlayerState::WaitingForSeek);
                self.request_demuxer_seek(time, false);
            }
            state if state.is_waiting() => {
                self.set_state(PlayerState::WaitingForSeek);
                self.sync_stop_decoders();
                self.flags.insert(PlayerFlags::PENDING_START);
                self.request_demuxer_seek(time, false);
            }
            PlayerState::Playing => {
                self.set_state(PlayerState::Stopping);
                self.flags.insert(PlayerFlags::PENDING_START);
                self.pending_seek = Some(time);
                self.request_to_stop_decoders();
            }
            PlayerState::Stopping | PlayerState::WaitingForSeek => {
                self.pending_seek = Some(time);
            }
            PlayerState::Error => warn!("Seek ignored in error state"),
            _ => {}
        }
    }

    fn release(&mut self) {
        info!("Release in {}", self.state);
        self.release_decoder_resources();
        self.flags = PlayerFlags::empty();
        self.prefetching = StreamSet::empty();
        self.prerolling = StreamSet::empty();

        if self.state == PlayerState::Error {
            return;
        }
        if self.state != PlayerState::WaitingForSeek {
            self.set_state(PlayerState::Paused);
        }
        if let Some(time) = self.pending_seek.take() {
            self.set_state(PlayerState::WaitingForSeek);
            self.request_demuxer_seek(time, false);
        }
    }

    fn set_render_target(&mut self, target: Option<RenderTarget>) {
        let removing = target.is_none();
        if removing && !self.video.has_render_target() {
            return;
        }
        info!("Render target {:?}", target);
        self.video.set_render_target(target);

        match self.state {
            PlayerState::WaitingForSurface if !removing => {
                self.set_state(PlayerState::Playing);
                self.start_playback_or_browser_seek();
            }
            PlayerState::Playing if !self.video_finished() => {
                // The video codec has to be recreated; resume from where we are
                self.sync_stop_decoders();
                let now = self.interpolator.current_time();
                self.video.set_preroll_timestamp(now);
                self.set_state(PlayerState::Prefetching);
                self.start_prefetch_decoders();
            }
            _ => {}
        }
    }

    fn set_content_decryptor(&mut self, decryptor: Arc<dyn ContentDecryptor>) {
        info!("Content decryptor set");
        decryptor.set_key_added_listener(KeyAddedListener::new(self.command_tx.clone()));
        self.decryptor = Some(decryptor);

        if self.state == PlayerState::WaitingForDecryptor {
            self.set_state(PlayerState::Playing);
            self.start_playback_or_browser_seek();
        }
    }

    fn on_key_added(&mut self) {
        info!("Key added in {}", self.state);
        self.flags.insert(PlayerFlags::KEY_IS_ADDED);
        self.audio.notify_key_added();
        self.video.notify_key_added();

        if self.state == PlayerState::WaitingForKey {
            self.set_state(PlayerState::Playing);
            self.start_playback_or_browser_seek();
        }
    }

    // Demuxer messages

    fn on_configs_available(&mut self, configs: StreamConfigs) {
        info!(
            "Configs available: audio={} video={} duration={:?}",
            configs.has_audio(),
            configs.has_video(),
            configs.duration
        );
        if !configs.has_audio() && !configs.has_video() {
            self.fail(McPlayerError::config_failure("demuxer reported no streams"));
            return;
        }

        self.duration = configs.duration;
        self.audio.set_demuxer_configs(&configs);
        self.video.set_demuxer_configs(&configs);
        if let Some(video) = configs.video.as_ref() {
            self.video_size = (video.width, video.height);
        }
        self.emit_metadata();

        if self.state == PlayerState::WaitingForConfig {
            self.request_play_permission();
        }
    }

    fn on_data_available(&mut self, chunk: Chunk) {
        let stream = chunk.stream;
        debug!("{} chunk of {} units", stream, chunk.len());
        let progress = with_decoder!(self, stream, decoder => decoder.on_data(chunk));
        self.on_prefetch_progress(stream, progress);
    }

    fn on_seek_done(&mut self, actual: Option<Duration>) {
        let Some(request) = self.seek_in_flight.take() else {
            warn!("Seek done without a seek in flight");
            return;
        };
        if self.state != PlayerState::WaitingForSeek {
            warn!("Seek done in {}", self.state);
            return;
        }

        let time = request.resolve(actual);
        info!("Seek done at {:?} (browser seek: {})", time, request.is_browser_seek);

        self.interpolator.set_bounds(time, time);
        self.audio.set_base_timestamp(time);
        self.audio.set_preroll_timestamp(time);
        self.video.set_preroll_timestamp(time);

        if !request.is_browser_seek {
            self.seeks_completed += 1;
            self.emit(PlayerEvent::SeekDone { time });
        }

        if let Some(next) = self.pending_seek.take() {
            self.request_demuxer_seek(next, false);
        } else if self.flags.contains(PlayerFlags::PENDING_START) {
            self.flags.remove(PlayerFlags::PENDING_START);
            self.resume_start();
        } else {
            self.set_state(PlayerState::Paused);
        }
    }

    // Decoder events

    fn on_starvation(&mut self, stream: StreamType) {
        if self.state != PlayerState::Playing {
            return;
        }
        info!("{} starved, re-prefetching", stream);
        self.set_state(PlayerState::Stopping);
        self.flags.insert(PlayerFlags::PENDING_START);
        self.request_to_stop_decoders();
    }

    fn on_missing_key(&mut self, stream: StreamType) {
        info!("{} is missing a decryption key", stream);
        self.flags.insert(PlayerFlags::KEY_IS_REQUIRED);
        self.emit(PlayerEvent::WaitingForKey);

        if self.state == PlayerState::Playing {
            self.set_state(PlayerState::Stopping);
            self.flags.insert(PlayerFlags::PENDING_START);
            self.request_to_stop_decoders();
        }
    }

    fn on_preroll_done(&mut self, stream: StreamType) {
        if self.state != PlayerState::Playing || !self.prerolling.contains(stream.into()) {
            debug!("{} preroll done ignored in {}", stream, self.state);
            return;
        }
        with_decoder!(self, stream, decoder => decoder.on_preroll_done());
        self.preroll_finished(stream);
    }

    fn on_last_frame_rendered(&mut self, stream: StreamType, eos: bool) {
        let report = match with_decoder!(self, stream, decoder => decoder.on_last_frame_rendered(eos)) {
            Ok(report) => report,
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        if report.drained {
            info!("{} drained for reconfiguration", stream);
            if self.state == PlayerState::Playing {
                self.set_state(PlayerState::Stopping);
                self.flags.insert(PlayerFlags::PENDING_START);
                self.prerolling = StreamSet::empty();
                self.request_to_stop_decoders();
            }
        } else if report.preroll_interrupted && self.state == PlayerState::Playing {
            // Ran into the end of stream while prerolling
            self.preroll_finished(stream);
        }

        self.on_stop_done();
    }

    fn on_time_update(
        &mut self,
        stream: StreamType,
        now_playing: Duration,
        last_buffered: Duration,
        postponed: bool,
    ) {
        self.emit(PlayerEvent::DecoderProgress {
            stream,
            now_playing,
            last_buffered,
        });
        if postponed {
            return;
        }
        // Audio drives the clock while it plays
        if stream == StreamType::Video && self.audio.has_stream() && !self.audio_finished() {
            return;
        }
        if !matches!(self.state, PlayerState::Playing | PlayerState::Stopping) {
            return;
        }

        self.interpolator.set_bounds(now_playing, last_buffered);
        let current = self.interpolator.current_time();
        trace!("Time update {:?} from {}", current, stream);
        self.emit(PlayerEvent::TimeUpdate { current });
    }

    // Playback flow

    fn resume_start(&mut self) {
        if self.has_media() {
            self.request_play_permission();
        } else {
            self.set_state(PlayerState::WaitingForConfig);
        }
    }

    fn request_play_permission(&mut self) {
        self.set_state(PlayerState::WaitingForPermission);
        let granted = self
            .permission
            .request_play(self.duration, self.audio.has_stream());
        self.deferred.push_back(Deferred::PermissionDecided(granted));
    }

    fn on_permission_decided(&mut self, granted: bool) {
        if self.state != PlayerState::WaitingForPermission {
            debug!("Permission decision ignored in {}", self.state);
            return;
        }
        if !granted {
            info!("Playback permission denied");
            self.set_state(PlayerState::Paused);
            self.emit(PlayerEvent::PlaybackInterrupted);
            return;
        }
        self.set_state(PlayerState::Prefetching);
        self.start_prefetch_decoders();
    }

    fn start_prefetch_decoders(&mut self) {
        self.prefetching = StreamSet::empty();
        for stream in [StreamType::Audio, StreamType::Video] {
            let active = with_decoder!(self, stream, decoder => decoder.has_stream() && !decoder.is_completed());
            if active {
                self.prefetching.insert(stream.into());
            }
        }

        if self.prefetching.is_empty() {
            self.deferred.push_back(Deferred::PrefetchDone);
            return;
        }

        for stream in [StreamType::Audio, StreamType::Video] {
            if !self.prefetching.contains(stream.into()) {
                continue;
            }
            match with_decoder!(self, stream, decoder => decoder.prefetch()) {
                Ok(progress) => self.on_prefetch_progress(stream, progress),
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }
    }

    fn on_prefetch_progress(&mut self, stream: StreamType, progress: PrefetchProgress) {
        match progress {
            PrefetchProgress::Done => {
                let set = StreamSet::from(stream);
                if self.prefetching.contains(set) {
                    self.prefetching.remove(set);
                    debug!("{} prefetched", stream);
                    if self.prefetching.is_empty() {
                        self.deferred.push_back(Deferred::PrefetchDone);
                    }
                }
            }
            PrefetchProgress::NeedsData => self.request_data(stream),
            PrefetchProgress::Idle => {}
        }
    }

    fn request_data(&mut self, stream: StreamType) {
        let begun = with_decoder!(self, stream, decoder => decoder.begin_data_request());
        if begun {
            self.demuxer.request_data(stream);
        } else {
            trace!("{} data request already in flight", stream);
        }
    }

    fn on_prefetch_done(&mut self) {
        if self.state != PlayerState::Prefetching {
            debug!("Prefetch done ignored in {}", self.state);
            return;
        }
        if !self.has_media() {
            self.fail(McPlayerError::config_failure("no stream to play"));
            return;
        }

        if self.video.has_stream() && !self.video_finished() && !self.video.has_render_target() {
            self.set_state(PlayerState::WaitingForSurface);
            return;
        }
        if self.flags.waits_for_key() {
            self.set_state(PlayerState::WaitingForKey);
            return;
        }
        if (self.audio.is_encrypted() || self.video.is_encrypted()) && self.decryptor.is_none() {
            self.set_state(PlayerState::WaitingForDecryptor);
            return;
        }

        self.set_state(PlayerState::Playing);
        self.start_playback_or_browser_seek();
    }

    fn start_playback_or_browser_seek(&mut self) {
        self.flags.remove(PlayerFlags::KEY_IS_REQUIRED | PlayerFlags::KEY_IS_ADDED);

        match self.configure_decoders() {
            ConfigStatus::Ok => self.start_playback_decoders(),
            ConfigStatus::KeyFrameRequired => {
                let time = self.interpolator.current_time();
                info!("No key frame available, seeking to {:?}", time);
                self.set_state(PlayerState::WaitingForSeek);
                self.flags.insert(PlayerFlags::PENDING_START);
                self.sync_stop_decoders();
                self.request_demuxer_seek(time, true);
            }
            ConfigStatus::Failure => {
                self.fail(McPlayerError::config_failure("codec configuration failed"));
            }
        }
    }

    fn configure_decoders(&mut self) -> ConfigStatus {
        let crypto = self.decryptor.as_ref().map(|decryptor| decryptor.crypto_context());

        for stream in [StreamType::Video, StreamType::Audio] {
            let (status, created) = with_decoder!(self, stream, decoder => {
                if !decoder.has_stream() || decoder.is_completed() {
                    continue;
                }
                let before = decoder.codecs_created();
                let status = decoder.configure(crypto.as_ref());
                (status, decoder.codecs_created() > before)
            });
            if created {
                self.emit(PlayerEvent::CodecCreated { stream });
            }
            if status != ConfigStatus::Ok {
                return status;
            }
        }
        ConfigStatus::Ok
    }

    fn start_playback_decoders(&mut self) {
        let mut prerolling = StreamSet::empty();
        for stream in [StreamType::Audio, StreamType::Video] {
            let needs = with_decoder!(self, stream, decoder => decoder.not_completed_and_needs_preroll());
            if !needs {
                continue;
            }
            if let Err(err) = with_decoder!(self, stream, decoder => decoder.preroll()) {
                self.fail(err);
                return;
            }
            prerolling.insert(stream.into());
        }

        if prerolling.is_empty() {
            self.start_decoders();
        } else {
            debug!("Prerolling {:?}", prerolling);
            self.prerolling = prerolling;
        }
    }

    fn preroll_finished(&mut self, stream: StreamType) {
        self.prerolling.remove(stream.into());
        if self.prerolling.is_empty() {
            self.start_decoders();
        }
    }

    fn start_decoders(&mut self) {
        let base = self.interpolator.current_time();
        info!("Starting decoders at {:?}", base);
        self.interpolator.set_bounds(base, base);
        self.interpolator.start_interpolating();

        for stream in [StreamType::Audio, StreamType::Video] {
            let result = with_decoder!(self, stream, decoder => {
                if !decoder.has_stream() || decoder.is_completed() {
                    continue;
                }
                decoder.start(base)
            });
            if let Err(err) = result {
                self.fail(err);
                return;
            }
        }
    }

    fn request_to_stop_decoders(&mut self) {
        self.prerolling = StreamSet::empty();
        let audio = self.audio.request_to_stop();
        let video = self.video.request_to_stop();
        if audio != StopProgress::Pending && video != StopProgress::Pending {
            self.deferred.push_back(Deferred::StopDone);
        }
    }

    fn on_stop_done(&mut self) {
        if !(self.audio.is_stopped() && self.video.is_stopped()) {
            return;
        }
        if self.interpolator.interpolating() {
            self.interpolator.stop_interpolating();
        }

        let completed = self.has_media() && self.audio_finished() && self.video_finished();
        match self.state {
            PlayerState::Stopping => {
                if let Some(time) = self.pending_seek.take() {
                    self.set_state(PlayerState::WaitingForSeek);
                    self.request_demuxer_seek(time, false);
                } else if completed {
                    self.flags.remove(PlayerFlags::PENDING_START);
                    self.set_state(PlayerState::Paused);
                    self.emit(PlayerEvent::PlaybackComplete);
                } else if self.flags.contains(PlayerFlags::PENDING_START) {
                    self.flags.remove(PlayerFlags::PENDING_START);
                    self.request_play_permission();
                } else {
                    self.set_state(PlayerState::Paused);
                }
            }
            PlayerState::Playing => {
                // Nothing asked the decoders to stop: they ran out of media
                self.set_state(PlayerState::Paused);
                if completed {
                    info!("Playback complete");
                    self.emit(PlayerEvent::PlaybackComplete);
                }
            }
            other => debug!("Stop done in {}", other),
        }
    }

    fn request_demuxer_seek(&mut self, time: Duration, is_browser_seek: bool) {
        if let Err(err) = self.audio.flush().and_then(|_| self.video.flush()) {
            self.fail(err);
            return;
        }
        self.interpolator.reset(time);
        self.seek_in_flight = Some(SeekRequest::new(time, is_browser_seek));
        self.demuxer.request_seek(time, is_browser_seek);
    }

    fn sync_stop_decoders(&mut self) {
        self.prefetching = StreamSet::empty();
        self.prerolling = StreamSet::empty();
        self.audio.sync_stop();
        self.video.sync_stop();
        if self.interpolator.interpolating() {
            self.interpolator.stop_interpolating();
        }
    }

    fn release_decoder_resources(&mut self) {
        self.audio.release_codec();
        self.video.release_codec();
        if self.interpolator.interpolating() {
            self.interpolator.stop_interpolating();
        }
    }

    /// Release every codec, then report the error
    fn fail(&mut self, err: McPlayerError) {
        if self.state == PlayerState::Error {
            warn!("Further error after failure: {}", err);
            return;
        }
        error!("Player error in {}: {}", self.state, err);
        self.release_decoder_resources();
        self.flags = PlayerFlags::empty();
        self.pending_seek = None;
        self.prefetching = StreamSet::empty();
        self.prerolling = StreamSet::empty();
        self.deferred.clear();
        self.set_state(PlayerState::Error);
        self.emit(PlayerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    // Helpers

    fn has_media(&self) -> bool {
        self.audio.has_stream() || self.video.has_stream()
    }

    fn audio_finished(&self) -> bool {
        !self.audio.has_stream() || self.audio.is_completed()
    }

    fn video_finished(&self) -> bool {
        !self.video.has_stream() || self.video.is_completed()
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state == state {
            return;
        }
        let from = self.state;
        info!("Player state {} -> {}", from, state);
        self.state = state;
        self.emit(PlayerEvent::StateChanged { from, to: state });
    }

    fn emit(&self, event: PlayerEvent) {
        self.dispatcher.dispatch(&event);
    }

    fn emit_metadata(&self) {
        let (width, height) = self.video_size;
        self.emit(PlayerEvent::MetadataChanged {
            duration: self.duration,
            width,
            height,
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot.publish(PlayerSnapshot {
            state: self.state,
            current_time: self.interpolator.current_time(),
            duration: self.duration,
            video_size: self.video_size,
            stats: PlaybackStats {
                audio: self.audio.stats(),
                video: self.video.stats(),
                seeks_completed: self.seeks_completed,
            },
        });
    }

    fn decoder_states(&self) -> (DecoderState, DecoderState) {
        (self.audio.state(), self.video.state())
    }
}

impl fmt::Debug for PlayerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerController")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("pending_seek", &self.pending_seek)
            .field("decoders", &self.decoder_states())
            .finish()
    }
}
