//! Integration test utilities for MCPlayer
//!
//! This module provides common utilities for integration testing including:
//! - A player fixture wired to the mock demuxer and mock codec
//! - Event recording and polling helpers
//! - Statistics and performance helpers

use anyhow::Result;
use mockall::mock;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use mcplayer::codec::mock::{KeyGate, MockCodecFactory, MockCodecOptions, MockCodecProbe, MockDecryptor};
use mcplayer::codec::RenderTarget;
use mcplayer::demuxer::mock::{MockDemuxer, MockDemuxerHandle, MockDemuxerOptions, StreamFactory};
use mcplayer::player::{PlaybackPermission, PlayerEvent, PlayerEventHandler, PlayerState};
use mcplayer::{Config, MediaPlayer, MediaPlayerBuilder, StreamType};

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

/// Route library logs through the test harness
pub fn init_logging() {
    Lazy::force(&LOGGER);
}

mock! {
    pub Permission {}

    impl PlaybackPermission for Permission {
        fn request_play(&self, duration: Duration, has_audio: bool) -> bool;
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Default patience for playback milestones
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Collects every event the player emits
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<PlayerEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().clone()
    }

    pub fn count<F: Fn(&PlayerEvent) -> bool>(&self, predicate: F) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    pub fn contains(&self, wanted: &PlayerEvent) -> bool {
        self.events.lock().iter().any(|event| event == wanted)
    }

    /// States entered, in order
    pub fn states(&self) -> Vec<PlayerState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// `now_playing` values a stream reported after the last caller seek
    pub fn progress_after_seek(&self, stream: StreamType) -> Vec<Duration> {
        let events = self.events.lock();
        let start = events
            .iter()
            .rposition(|event| matches!(event, PlayerEvent::SeekDone { .. }))
            .map_or(0, |index| index + 1);
        events[start..]
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::DecoderProgress {
                    stream: s,
                    now_playing,
                    ..
                } if *s == stream => Some(*now_playing),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl PlayerEventHandler for EventRecorder {
    fn handle_event(&mut self, event: &PlayerEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Tracks the smallest and largest value seen
#[derive(Debug, Clone, Copy, Default)]
pub struct Minimax<T> {
    min: Option<T>,
    max: Option<T>,
    count: usize,
}

impl<T: PartialOrd + Copy> Minimax<T> {
    pub fn new() -> Self {
        Self {
            min: None,
            max: None,
            count: 0,
        }
    }

    pub fn add(&mut self, value: T) {
        if self.min.map_or(true, |min| value < min) {
            self.min = Some(value);
        }
        if self.max.map_or(true, |max| value > max) {
            self.max = Some(value);
        }
        self.count += 1;
    }

    pub fn min(&self) -> Option<T> {
        self.min
    }

    pub fn max(&self) -> Option<T> {
        self.max
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl<T: PartialOrd + Copy> FromIterator<T> for Minimax<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut minimax = Minimax::new();
        for value in iter {
            minimax.add(value);
        }
        minimax
    }
}

/// Player wired to mock collaborators
pub struct PlayerFixture {
    pub player: MediaPlayer,
    pub recorder: EventRecorder,
    pub demuxer: MockDemuxerHandle,
    pub probe: MockCodecProbe,
    pub decryptor: Arc<MockDecryptor>,
}

impl PlayerFixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::default()
    }

    pub async fn wait_for_state(&self, state: PlayerState) -> bool {
        wait_until(TIMEOUT, || self.player.state() == state).await
    }

    pub async fn wait_for_event(&self, wanted: &PlayerEvent) -> bool {
        wait_until(TIMEOUT, || self.recorder.contains(wanted)).await
    }

    pub async fn wait_for_completion(&self) -> bool {
        self.wait_for_event(&PlayerEvent::PlaybackComplete).await
    }
}

/// Assembles a [`PlayerFixture`]
pub struct FixtureBuilder {
    streams: Vec<StreamFactory>,
    demuxer_options: MockDemuxerOptions,
    codec_options: MockCodecOptions,
    config: Config,
    permission: Option<Arc<dyn PlaybackPermission>>,
    render_target: bool,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            demuxer_options: MockDemuxerOptions::default(),
            codec_options: MockCodecOptions::default(),
            config: Config::default(),
            permission: None,
            render_target: true,
        }
    }
}

impl FixtureBuilder {
    pub fn audio(self, duration: Duration) -> Self {
        self.stream(StreamFactory::audio(duration))
    }

    pub fn video(self, duration: Duration) -> Self {
        self.stream(StreamFactory::video(duration))
    }

    pub fn stream(mut self, factory: StreamFactory) -> Self {
        self.streams.push(factory);
        self
    }

    pub fn demuxer_options(mut self, options: MockDemuxerOptions) -> Self {
        self.demuxer_options = options;
        self
    }

    pub fn codec_options(mut self, options: MockCodecOptions) -> Self {
        self.codec_options = options;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn permission(mut self, permission: Arc<dyn PlaybackPermission>) -> Self {
        self.permission = Some(permission);
        self
    }

    /// Leave the player without a render target
    pub fn without_render_target(mut self) -> Self {
        self.render_target = false;
        self
    }

    pub fn build(self) -> Result<PlayerFixture> {
        init_logging();

        let gate = self.codec_options.key_gate.clone().unwrap_or_else(KeyGate::locked);
        let factory = MockCodecFactory::new(self.codec_options);
        let probe = factory.probe();
        let demuxer = MockDemuxer::new(self.streams, self.demuxer_options);
        let demuxer_handle = demuxer.handle();
        let recorder = EventRecorder::new();

        let mut builder = MediaPlayerBuilder::new()
            .with_config(self.config)
            .with_demuxer(Box::new(demuxer))
            .with_codec_factory(Arc::new(factory))
            .with_event_handler(Box::new(recorder.clone()));
        if let Some(permission) = self.permission {
            builder = builder.with_permission(permission);
        }
        let player = builder.build()?;

        if self.render_target {
            player.set_render_target(Some(RenderTarget::new(1, "fixture surface")))?;
        }

        Ok(PlayerFixture {
            player,
            recorder,
            demuxer: demuxer_handle,
            probe,
            decryptor: Arc::new(MockDecryptor::new(gate)),
        })
    }
}

/// Performance measurement utilities
pub mod perf_test {
    use std::time::{Duration, Instant};

    pub struct PerfMeasure {
        name: String,
        start: Instant,
        measurements: Vec<Duration>,
    }

    impl PerfMeasure {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                start: Instant::now(),
                measurements: Vec::new(),
            }
        }

        pub fn start(&mut self) {
            self.start = Instant::now();
        }

        pub fn stop(&mut self) {
            self.measurements.push(self.start.elapsed());
        }

        pub fn average(&self) -> Duration {
            if self.measurements.is_empty() {
                return Duration::ZERO;
            }
            let sum: Duration = self.measurements.iter().sum();
            sum / self.measurements.len() as u32
        }

        pub fn max(&self) -> Option<Duration> {
            self.measurements.iter().max().copied()
        }

        pub fn report(&self) {
            log::info!(
                "{}: {} runs, average {:?}, max {:?}",
                self.name,
                self.measurements.len(),
                self.average(),
                self.max()
            );
        }
    }
}
