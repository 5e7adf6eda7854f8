//! Integration tests for a single decoder
//!
//! The tests play the part of the player: they answer data requests from a
//! synthetic stream and feed worker events back into the decoder.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcplayer::audio::{NullAudioSink, SinkPacing, VolumeControl};
use mcplayer::codec::mock::{MockCodecFactory, MockCodecOptions, MockCodecProbe};
use mcplayer::codec::RenderTarget;
use mcplayer::decoder::{
    AudioDecoder, AudioPolicy, ConfigStatus, DecoderEvent, DecoderEventKind, DecoderState,
    MediaDecoder, PrefetchProgress, StopProgress, StreamPolicy, VideoDecoder, VideoPolicy,
};
use mcplayer::demuxer::mock::StreamFactory;
use mcplayer::utils::DecoderConfig;
use mcplayer::{StreamConfigs, StreamType};
use mcplayer_integration_tests::{init_logging, Minimax};

const PATIENCE: Duration = Duration::from_secs(10);

struct Harness<P: StreamPolicy> {
    decoder: MediaDecoder<P>,
    stream: StreamFactory,
    events: Receiver<DecoderEvent>,
    probe: MockCodecProbe,
}

fn audio_harness(duration: Duration) -> Harness<AudioPolicy> {
    init_logging();
    let factory = MockCodecFactory::new(MockCodecOptions::default());
    let probe = factory.probe();
    let (tx, events) = bounded(256);
    let policy = AudioPolicy::new(
        Box::new(NullAudioSink::new(SinkPacing::Instant)),
        VolumeControl::default(),
        2,
    );
    let decoder: AudioDecoder = MediaDecoder::new(policy, Arc::new(factory), tx, &DecoderConfig::default());
    Harness::new(decoder, StreamFactory::audio(duration), events, probe)
}

fn video_harness(duration: Duration) -> Harness<VideoPolicy> {
    init_logging();
    let factory = MockCodecFactory::new(MockCodecOptions::default());
    let probe = factory.probe();
    let (tx, events) = bounded(256);
    let policy = VideoPolicy::new(Duration::from_millis(40));
    let mut decoder: VideoDecoder = MediaDecoder::new(policy, Arc::new(factory), tx, &DecoderConfig::default());
    decoder.set_render_target(Some(RenderTarget::new(3, "harness surface")));
    Harness::new(decoder, StreamFactory::video(duration), events, probe)
}

impl<P: StreamPolicy> Harness<P> {
    fn new(
        mut decoder: MediaDecoder<P>,
        stream: StreamFactory,
        events: Receiver<DecoderEvent>,
        probe: MockCodecProbe,
    ) -> Self {
        let mut configs = StreamConfigs::default();
        stream.describe(&mut configs);
        decoder.set_demuxer_configs(&configs);
        Self {
            decoder,
            stream,
            events,
            probe,
        }
    }

    /// Prefetch and create the codec
    fn prepare(&mut self) -> Result<()> {
        let mut progress = self.decoder.prefetch()?;
        while progress == PrefetchProgress::NeedsData {
            progress = self.decoder.on_data(self.stream.next_chunk());
        }
        assert_eq!(self.decoder.state(), DecoderState::Prefetched);
        assert_eq!(self.decoder.configure(None), ConfigStatus::Ok);
        Ok(())
    }

    /// Serve data requests until `done` accepts an event of the current epoch
    fn pump_until<F>(&mut self, mut done: F) -> Option<DecoderEventKind>
    where
        F: FnMut(&DecoderEventKind) -> bool,
    {
        let deadline = Instant::now() + PATIENCE;
        while Instant::now() < deadline {
            let Ok(event) = self.events.recv_timeout(Duration::from_millis(50)) else {
                continue;
            };
            if !self.decoder.accepts(&event) {
                continue;
            }
            if event.kind == DecoderEventKind::RequestData {
                self.decoder.on_data(self.stream.next_chunk());
            }
            if done(&event.kind) {
                return Some(event.kind);
            }
        }
        None
    }

    /// Events of the current epoch that arrive within `window`
    fn drain_for(&mut self, window: Duration) -> Vec<DecoderEventKind> {
        let deadline = Instant::now() + window;
        let mut kinds = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.events.recv_timeout(left) {
                Ok(event) if self.decoder.accepts(&event) => kinds.push(event.kind),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        kinds
    }
}

fn is_last_frame(kind: &DecoderEventKind) -> bool {
    matches!(kind, DecoderEventKind::LastFrameRendered { .. })
}

#[test]
fn test_audio_decoder_plays_to_end_of_stream() -> Result<()> {
    let mut harness = audio_harness(Duration::from_millis(300));
    let expected = harness.stream.total_units() as u64;
    harness.prepare()?;
    harness.decoder.start(Duration::ZERO)?;
    assert_eq!(harness.decoder.state(), DecoderState::Running);

    let mut progress = Minimax::new();
    let last = harness.pump_until(|kind| {
        if let DecoderEventKind::TimeUpdate { now_playing, .. } = kind {
            progress.add(*now_playing);
        }
        is_last_frame(kind)
    });
    assert_eq!(last, Some(DecoderEventKind::LastFrameRendered { eos: true }));

    let report = harness.decoder.on_last_frame_rendered(true)?;
    assert!(report.completed);
    assert!(!report.drained);
    assert!(harness.decoder.is_completed());
    assert!(harness.decoder.is_stopped());
    assert_eq!(harness.decoder.stats().frames_rendered, expected);
    assert!(progress.count() > 0);
    assert!(progress.max().unwrap() <= harness.stream.duration());
    Ok(())
}

#[test]
fn test_second_stop_request_is_ignored() -> Result<()> {
    let mut harness = video_harness(Duration::from_secs(3));
    harness.prepare()?;
    harness.decoder.start(Duration::ZERO)?;

    let mut frames = 0;
    harness.pump_until(|kind| {
        if matches!(kind, DecoderEventKind::TimeUpdate { .. }) {
            frames += 1;
        }
        frames >= 5
    });
    assert!(frames >= 5);

    assert_eq!(harness.decoder.request_to_stop(), StopProgress::Pending);
    assert_eq!(harness.decoder.request_to_stop(), StopProgress::Ignored);
    assert_eq!(harness.decoder.state(), DecoderState::Stopping);

    let last = harness.pump_until(is_last_frame);
    assert_eq!(last, Some(DecoderEventKind::LastFrameRendered { eos: false }));
    let report = harness.decoder.on_last_frame_rendered(false)?;
    assert!(!report.completed);
    assert!(harness.decoder.is_stopped());

    let late = harness.drain_for(Duration::from_millis(200));
    assert!(!late.iter().any(is_last_frame));
    assert_eq!(harness.probe.outstanding_output_buffers(), 0);
    Ok(())
}

#[test]
fn test_sync_stop_cancels_pending_events() -> Result<()> {
    let mut harness = video_harness(Duration::from_secs(3));
    harness.prepare()?;
    harness.decoder.start(Duration::ZERO)?;

    let mut frames = 0;
    harness.pump_until(|kind| {
        if matches!(kind, DecoderEventKind::TimeUpdate { .. }) {
            frames += 1;
        }
        frames >= 3
    });

    harness.decoder.sync_stop();
    assert_eq!(harness.decoder.state(), DecoderState::Stopped);
    assert_eq!(harness.probe.outstanding_output_buffers(), 0);

    // Whatever the worker sent before the stop belongs to a cancelled epoch
    while let Ok(event) = harness.events.try_recv() {
        assert!(!harness.decoder.accepts(&event));
    }

    harness.decoder.flush()?;
    assert!(harness.decoder.queue().info().data_length == 0);
    Ok(())
}

#[test]
fn test_preroll_skips_frames_before_timestamp() -> Result<()> {
    let preroll = Duration::from_millis(200);
    let mut harness = video_harness(Duration::from_secs(1));
    harness.decoder.set_preroll_timestamp(preroll);
    harness.prepare()?;
    harness.decoder.preroll()?;

    let done = harness.pump_until(|kind| *kind == DecoderEventKind::PrerollDone);
    assert_eq!(done, Some(DecoderEventKind::PrerollDone));
    assert_eq!(harness.decoder.state(), DecoderState::Prerolled);
    harness.decoder.on_preroll_done();
    assert!(!harness.decoder.not_completed_and_needs_preroll());

    harness.decoder.start(preroll)?;
    assert_eq!(harness.decoder.state(), DecoderState::Running);
    let last = harness.pump_until(is_last_frame);
    assert_eq!(last, Some(DecoderEventKind::LastFrameRendered { eos: true }));
    harness.decoder.on_last_frame_rendered(true)?;

    let rendered: Minimax<Duration> = harness
        .probe
        .rendered_timestamps(StreamType::Video)
        .into_iter()
        .collect();
    assert!(rendered.min().unwrap() >= preroll);
    assert_eq!(rendered.max(), Some(harness.stream.last_timestamp()));
    assert!(harness.decoder.stats().frames_skipped > 0);
    Ok(())
}
