//! High-level media player API for MCPlayer
//!
//! [`MediaPlayer`] owns the controller thread and forwards every call to it
//! as a command, so all methods return immediately. State is read back from
//! the snapshot the controller publishes after each message.

use crossbeam_channel::{bounded, Sender};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::{AudioSink, NullAudioSink, VolumeControl};
use crate::codec::mock::MockCodecFactory;
use crate::codec::{CodecFactory, RenderTarget};
use crate::demuxer::Demuxer;
use crate::internal_error;
use crate::player::clock::{SystemTimeSource, TimeSource};
use crate::player::controller::{ControllerParts, PlayerCommand, PlayerController};
use crate::player::state::{PlayerSnapshot, SharedSnapshot};
use crate::player::{
    AllowAll, ContentDecryptor, PlaybackPermission, PlaybackStats, PlayerEvent, PlayerEventHandler,
    PlayerState,
};
use crate::utils::config::Config;
use crate::utils::error::{McPlayerError, Result};

/// Media player builder for customized configuration
pub struct MediaPlayerBuilder {
    config: Config,
    demuxer: Option<Box<dyn Demuxer>>,
    codec_factory: Option<Arc<dyn CodecFactory>>,
    audio_sink: Option<Box<dyn AudioSink>>,
    permission: Arc<dyn PlaybackPermission>,
    time_source: Option<Box<dyn TimeSource>>,
    event_handlers: Vec<Box<dyn PlayerEventHandler>>,
}

impl MediaPlayerBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            demuxer: None,
            codec_factory: None,
            audio_sink: None,
            permission: Arc::new(AllowAll),
            time_source: None,
            event_handlers: Vec::new(),
        }
    }

    /// Set player configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the media source; required
    pub fn with_demuxer(mut self, demuxer: Box<dyn Demuxer>) -> Self {
        self.demuxer = Some(demuxer);
        self
    }

    /// Set the codec factory; defaults to the mock codec
    pub fn with_codec_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.codec_factory = Some(factory);
        self
    }

    /// Set the audio output; defaults to [`NullAudioSink`]
    pub fn with_audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    pub fn with_permission(mut self, permission: Arc<dyn PlaybackPermission>) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_time_source(mut self, source: Box<dyn TimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    /// Add an event handler
    pub fn with_event_handler(mut self, handler: Box<dyn PlayerEventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Build the media player
    pub fn build(self) -> Result<MediaPlayer> {
        MediaPlayer::new_with_builder(self)
    }
}

impl Default for MediaPlayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level media player
pub struct MediaPlayer {
    commands: Sender<PlayerCommand>,
    event_dispatcher: Arc<EventDispatcher>,
    snapshot: SharedSnapshot,
    volume: VolumeControl,
    controller_thread: Option<thread::JoinHandle<()>>,
}

impl MediaPlayer {
    fn new_with_builder(builder: MediaPlayerBuilder) -> Result<Self> {
        info!("Initializing MCPlayer media player");
        builder.config.validate()?;

        let demuxer = builder
            .demuxer
            .ok_or_else(|| McPlayerError::InvalidInput("a demuxer is required".to_string()))?;
        let factory = builder
            .codec_factory
            .unwrap_or_else(|| Arc::new(MockCodecFactory::default()));
        let audio_sink = builder
            .audio_sink
            .unwrap_or_else(|| Box::new(NullAudioSink::default()));
        let time_source = builder
            .time_source
            .unwrap_or_else(|| Box::new(SystemTimeSource));

        let event_dispatcher = Arc::new(EventDispatcher::new());
        for handler in builder.event_handlers {
            event_dispatcher.add_handler(handler);
        }

        let (command_tx, commands) = bounded(builder.config.playback.command_capacity);
        let snapshot = SharedSnapshot::default();
        let volume = VolumeControl::new(builder.config.audio.volume);

        let controller = PlayerController::new(ControllerParts {
            config: builder.config,
            demuxer,
            factory,
            audio_sink,
            volume: volume.clone(),
            permission: builder.permission,
            time_source,
            dispatcher: Arc::clone(&event_dispatcher),
            snapshot: snapshot.clone(),
            commands,
            command_tx: command_tx.clone(),
        })?;

        let controller_thread = thread::Builder::new()
            .name("PlayerController".to_string())
            .spawn(move || controller.run())
            .map_err(|e| internal_error!("failed to spawn controller thread: {}", e))?;

        Ok(Self {
            commands: command_tx,
            event_dispatcher,
            snapshot,
            volume,
            controller_thread: Some(controller_thread),
        })
    }

    /// Start or resume playback
    pub fn start(&self) -> Result<()> {
        self.send(PlayerCommand::Start)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(PlayerCommand::Pause)
    }

    /// Seek to a position; completion is reported by [`PlayerEvent::SeekDone`]
    pub fn seek_to(&self, time: Duration) -> Result<()> {
        self.send(PlayerCommand::SeekTo(time))
    }

    /// Stop decoding and free all codecs; the player can be started again
    pub fn release(&self) -> Result<()> {
        self.send(PlayerCommand::Release)
    }

    /// Set or remove the video render target
    pub fn set_render_target(&self, target: Option<RenderTarget>) -> Result<()> {
        self.send(PlayerCommand::SetRenderTarget(target))
    }

    /// Set volume level (0.0 to 1.0)
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(McPlayerError::InvalidInput(format!("volume {} out of range", volume)));
        }
        self.send(PlayerCommand::SetVolume(volume))
    }

    pub fn volume(&self) -> f32 {
        self.volume.volume()
    }

    pub fn set_content_decryptor(&self, decryptor: Arc<dyn ContentDecryptor>) -> Result<()> {
        self.send(PlayerCommand::SetContentDecryptor(decryptor))
    }

    pub fn state(&self) -> PlayerState {
        self.snapshot.read().state
    }

    /// Playback position as of the last processed message
    pub fn current_time(&self) -> Duration {
        self.snapshot.read().current_time
    }

    pub fn duration(&self) -> Duration {
        self.snapshot.read().duration
    }

    pub fn video_size(&self) -> (u32, u32) {
        self.snapshot.read().video_size
    }

    pub fn stats(&self) -> PlaybackStats {
        self.snapshot.read().stats
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.snapshot.read()
    }

    /// Subscribe to events
    pub fn subscribe_events<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(PlayerEvent) + Send + Sync + 'static,
    {
        self.event_dispatcher.subscribe(callback)
    }

    fn send(&self, command: PlayerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| McPlayerError::ChannelClosed("player controller is gone".to_string()))
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        // A full queue still lets the shutdown through once the controller drains it
        let _ = self.commands.send(PlayerCommand::Shutdown);
        if let Some(handle) = self.controller_thread.take() {
            if handle.join().is_err() {
                warn!("Player controller thread panicked");
            }
        }
    }
}

type Subscriber = Box<dyn Fn(PlayerEvent) + Send + Sync>;

/// Fans player events out to handlers and subscriptions
pub(crate) struct EventDispatcher {
    handlers: Mutex<Vec<Box<dyn PlayerEventHandler>>>,
    subscribers: Arc<RwLock<Vec<(u64, Subscriber)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_handler(&self, handler: Box<dyn PlayerEventHandler>) {
        self.handlers.lock().push(handler);
    }

    fn subscribe<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(PlayerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Box::new(callback)));
        EventSubscription {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    pub(crate) fn dispatch(&self, event: &PlayerEvent) {
        for handler in self.handlers.lock().iter_mut() {
            handler.handle_event(event);
        }
        for (_, callback) in self.subscribers.read().iter() {
            callback(event.clone());
        }
    }
}

/// Keeps a [`MediaPlayer::subscribe_events`] callback registered until dropped
pub struct EventSubscription {
    id: u64,
    subscribers: Arc<RwLock<Vec<(u64, Subscriber)>>>,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.subscribers.write().retain(|(id, _)| *id != self.id);
    }
}
