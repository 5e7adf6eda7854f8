//! Integration tests for the MCPlayer media player
//!
//! These tests drive the complete pipeline through the mock demuxer and the
//! mock codec:
//! - Playback to completion, pause and resume
//! - Seeking, prerolling and implicit key-frame seeks
//! - Mid-stream reconfiguration and starvation recovery
//! - Encrypted content
//! - Error handling and resource cleanup

use anyhow::Result;
use mcplayer::codec::mock::{KeyGate, MockCodecOptions};
use mcplayer::codec::RenderTarget;
use mcplayer::demuxer::mock::{MockDemuxerOptions, StreamFactory};
use mcplayer::player::{PlayerEvent, PlayerState};
use mcplayer::utils::ErrorKind;
use mcplayer::StreamType;
use mcplayer_integration_tests::perf_test::PerfMeasure;
use mcplayer_integration_tests::{wait_until, Minimax, MockPermission, PlayerFixture, TIMEOUT};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// True when `wanted` appears in `states` in order, gaps allowed
fn entered_in_order(states: &[PlayerState], wanted: &[PlayerState]) -> bool {
    let mut remaining = wanted.iter().peekable();
    for state in states {
        if remaining.peek() == Some(&state) {
            remaining.next();
        }
    }
    remaining.peek().is_none()
}

fn has_duplicates(timestamps: &[Duration]) -> bool {
    let mut seen = HashSet::new();
    !timestamps.iter().all(|ts| seen.insert(*ts))
}

#[tokio::test]
async fn test_video_only_renders_every_unit() -> Result<()> {
    let stream = StreamFactory::video(ms(400));
    let expected_frames = stream.total_units();
    let last_timestamp = stream.last_timestamp();

    let fixture = PlayerFixture::builder().stream(stream).build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    let rendered: Minimax<Duration> = fixture
        .probe
        .rendered_timestamps(StreamType::Video)
        .into_iter()
        .collect();
    assert_eq!(rendered.count(), expected_frames);
    assert_eq!(rendered.max(), Some(last_timestamp));
    assert_eq!(rendered.min(), Some(Duration::ZERO));
    assert_eq!(fixture.player.state(), PlayerState::Paused);
    Ok(())
}

#[tokio::test]
async fn test_audio_video_playback_completes() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .audio(ms(500))
        .video(ms(500))
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    let stats = fixture.player.stats();
    assert!(stats.audio.frames_rendered > 0);
    assert!(stats.video.frames_rendered > 0);
    assert_eq!(fixture.probe.codecs_created(StreamType::Audio), 1);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 1);
    assert!(fixture.recorder.errors().is_empty());

    let states = fixture.recorder.states();
    assert!(states.contains(&PlayerState::WaitingForPermission));
    assert!(states.contains(&PlayerState::Prefetching));
    assert!(states.contains(&PlayerState::Playing));
    assert_eq!(states.last(), Some(&PlayerState::Paused));

    assert!(fixture.recorder.count(|e| matches!(e, PlayerEvent::TimeUpdate { .. })) > 0);
    assert!(fixture.recorder.contains(&PlayerEvent::MetadataChanged {
        duration: ms(500),
        width: 320,
        height: 240,
    }));
    Ok(())
}

#[tokio::test]
async fn test_seek_never_renders_before_target() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .audio(ms(1000))
        .video(ms(1000))
        .demuxer_options(MockDemuxerOptions {
            audio_preroll: ms(60),
            video_preroll: ms(100),
            ..Default::default()
        })
        .build()?;

    fixture.player.start()?;
    assert!(wait_until(TIMEOUT, || fixture.probe.rendered_timestamps(StreamType::Video).len() >= 3).await);
    fixture.player.pause()?;
    assert!(fixture.wait_for_state(PlayerState::Paused).await);

    let before_seek = fixture.probe.rendered_timestamps(StreamType::Video).len();
    let audio_before_seek = fixture.probe.rendered_timestamps(StreamType::Audio).len();
    let target = ms(500);
    let mut seek_perf = PerfMeasure::new("Seek while paused");
    seek_perf.start();
    fixture.player.seek_to(target)?;
    assert!(fixture.wait_for_event(&PlayerEvent::SeekDone { time: target }).await);
    seek_perf.stop();
    seek_perf.report();
    assert_eq!(fixture.player.state(), PlayerState::Paused);

    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    let video = fixture.probe.rendered_timestamps(StreamType::Video);
    let after: Minimax<Duration> = video[before_seek..].iter().copied().collect();
    assert!(after.count() > 0);
    assert!(after.min().unwrap() >= target);

    let audio: Minimax<Duration> = fixture
        .recorder
        .progress_after_seek(StreamType::Audio)
        .into_iter()
        .collect();
    assert!(audio.count() > 0);
    assert!(audio.min().unwrap() >= target);

    // Audio fetched from before the target for preroll never reaches the sink
    let written = fixture.probe.rendered_timestamps(StreamType::Audio);
    let written: Minimax<Duration> = written[audio_before_seek..].iter().copied().collect();
    assert!(written.count() > 0);
    assert!(written.min().unwrap() >= target);

    assert_eq!(fixture.player.stats().seeks_completed, 1);
    assert!(fixture.demuxer.seeks().contains(&(target, false)));
    Ok(())
}

#[tokio::test]
async fn test_seek_while_playing_resumes() -> Result<()> {
    let fixture = PlayerFixture::builder().video(ms(1500)).build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_state(PlayerState::Playing).await);

    fixture.player.seek_to(ms(1000))?;
    assert!(fixture.wait_for_event(&PlayerEvent::SeekDone { time: ms(1000) }).await);
    assert!(fixture.wait_for_completion().await);

    let states = fixture.recorder.states();
    assert!(states.contains(&PlayerState::Stopping));
    assert!(states.contains(&PlayerState::WaitingForSeek));
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume() -> Result<()> {
    let fixture = PlayerFixture::builder().audio(ms(300)).video(ms(600)).build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_state(PlayerState::Playing).await);

    // A second pause while stopping must not produce a second stop
    fixture.player.pause()?;
    fixture.player.pause()?;
    assert!(fixture.wait_for_state(PlayerState::Paused).await);
    tokio::time::sleep(ms(100)).await;
    let paused = fixture
        .recorder
        .states()
        .iter()
        .filter(|state| **state == PlayerState::Paused)
        .count();
    assert_eq!(paused, 1);

    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);
    assert!(fixture.recorder.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_permission_is_requested_and_denial_interrupts() -> Result<()> {
    let mut permission = MockPermission::new();
    permission
        .expect_request_play()
        .withf(|duration, has_audio| *duration == Duration::from_millis(400) && *has_audio)
        .times(1)
        .returning(|_, _| false);

    let fixture = PlayerFixture::builder()
        .audio(ms(400))
        .permission(Arc::new(permission))
        .build()?;
    fixture.player.start()?;

    assert!(fixture.wait_for_event(&PlayerEvent::PlaybackInterrupted).await);
    assert!(fixture.wait_for_state(PlayerState::Paused).await);
    assert_eq!(fixture.probe.codecs_created(StreamType::Audio), 0);
    Ok(())
}

#[tokio::test]
async fn test_start_waits_for_configs() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .audio(ms(300))
        .demuxer_options(MockDemuxerOptions {
            defer_configs: true,
            ..Default::default()
        })
        .build()?;

    fixture.player.start()?;
    assert!(fixture.wait_for_state(PlayerState::WaitingForConfig).await);

    fixture.demuxer.post_configs();
    assert!(fixture.wait_for_completion().await);
    Ok(())
}

#[tokio::test]
async fn test_video_waits_for_render_target() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .video(ms(300))
        .without_render_target()
        .build()?;

    fixture.player.start()?;
    assert!(fixture.wait_for_state(PlayerState::WaitingForSurface).await);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 0);

    fixture
        .player
        .set_render_target(Some(RenderTarget::new(9, "late surface")))?;
    assert!(fixture.wait_for_completion().await);
    Ok(())
}

#[tokio::test]
async fn test_incompatible_config_change_recreates_codec() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .stream(StreamFactory::video(ms(600)).with_config_change_at(ms(300)))
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 2);
    assert!(fixture.recorder.count(|e| matches!(
        e,
        PlayerEvent::MetadataChanged {
            width: 640,
            height: 480,
            ..
        }
    )) > 0);
    assert!(fixture.recorder.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_audio_config_change_leaves_video_codec() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .stream(StreamFactory::audio(ms(600)).with_config_change_at(ms(300)))
        .video(ms(600))
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    assert_eq!(fixture.probe.codecs_created(StreamType::Audio), 2);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 1);
    let video = fixture.probe.rendered_timestamps(StreamType::Video);
    assert!(!has_duplicates(&video), "a video frame was presented twice");
    assert_eq!(video.iter().max(), Some(&StreamFactory::video(ms(600)).last_timestamp()));
    assert!(fixture.recorder.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_simultaneous_config_changes() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .stream(StreamFactory::audio(ms(600)).with_config_change_at(ms(300)))
        .stream(StreamFactory::video(ms(600)).with_config_change_at(ms(300)))
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    assert_eq!(fixture.probe.codecs_created(StreamType::Audio), 2);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 2);
    assert!(fixture.recorder.count(|e| matches!(
        e,
        PlayerEvent::MetadataChanged {
            width: 640,
            height: 480,
            ..
        }
    )) > 0);
    assert!(fixture.recorder.errors().is_empty());
    assert_eq!(fixture.player.state(), PlayerState::Paused);
    Ok(())
}

#[tokio::test]
async fn test_end_of_stream_during_other_stream_config_change() -> Result<()> {
    // One stream ends right around the moment the other drains for a new codec
    let cases = [
        (
            StreamFactory::audio(ms(300)),
            StreamFactory::video(ms(600)).with_config_change_at(ms(280)),
            StreamType::Video,
        ),
        (
            StreamFactory::audio(ms(600)).with_config_change_at(ms(280)),
            StreamFactory::video(ms(300)),
            StreamType::Audio,
        ),
    ];

    for (audio, video, changed) in cases {
        let fixture = PlayerFixture::builder().stream(audio).stream(video).build()?;
        fixture.player.start()?;
        assert!(fixture.wait_for_completion().await, "{} change did not complete", changed);

        assert_eq!(fixture.probe.codecs_created(changed), 2);
        assert!(fixture.recorder.errors().is_empty());
        assert_eq!(fixture.player.state(), PlayerState::Paused);
        assert!(wait_until(TIMEOUT, || fixture.probe.outstanding_output_buffers() == 0).await);
    }
    Ok(())
}

#[tokio::test]
async fn test_starvation_stops_and_prefetches_again() -> Result<()> {
    let stream = StreamFactory::video(ms(600));
    let expected_frames = stream.total_units();
    let last_timestamp = stream.last_timestamp();

    // Chunks cover 80 ms of video but take 120 ms to arrive
    let fixture = PlayerFixture::builder()
        .stream(stream)
        .demuxer_options(MockDemuxerOptions {
            data_delay: ms(120),
            ..Default::default()
        })
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    assert!(fixture.player.stats().video.starvations > 0);
    assert!(entered_in_order(
        &fixture.recorder.states(),
        &[
            PlayerState::Playing,
            PlayerState::Stopping,
            PlayerState::WaitingForPermission,
            PlayerState::Prefetching,
            PlayerState::Playing,
        ]
    ));

    let video = fixture.probe.rendered_timestamps(StreamType::Video);
    assert!(!has_duplicates(&video));
    assert_eq!(video.len(), expected_frames);
    assert_eq!(video.iter().max(), Some(&last_timestamp));
    assert!(fixture.recorder.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_audio_waits_for_video_preroll() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .audio(ms(1000))
        .video(ms(1000))
        .demuxer_options(MockDemuxerOptions {
            video_preroll: ms(300),
            ..Default::default()
        })
        .build()?;

    fixture.player.start()?;
    assert!(wait_until(TIMEOUT, || fixture.probe.rendered_timestamps(StreamType::Video).len() >= 3).await);
    fixture.player.pause()?;
    assert!(fixture.wait_for_state(PlayerState::Paused).await);

    let target = ms(600);
    fixture.player.seek_to(target)?;
    assert!(fixture.wait_for_event(&PlayerEvent::SeekDone { time: target }).await);
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);

    let events = fixture.recorder.events();
    let seek_done = events
        .iter()
        .position(|e| *e == PlayerEvent::SeekDone { time: target })
        .unwrap();
    let progress_of = |stream: StreamType| -> Vec<usize> {
        events
            .iter()
            .enumerate()
            .skip(seek_done)
            .filter(|(_, e)| matches!(e, PlayerEvent::DecoderProgress { stream: s, .. } if *s == stream))
            .map(|(index, _)| index)
            .collect()
    };
    let audio = progress_of(StreamType::Audio);
    let video = progress_of(StreamType::Video);
    assert!(audio.len() >= 2);
    assert!(!video.is_empty());

    // Audio holds its prerolled buffer until video has prerolled too
    assert!(video[0] < audio[1]);
    let first_time_update = events
        .iter()
        .skip(seek_done)
        .position(|e| matches!(e, PlayerEvent::TimeUpdate { .. }))
        .map(|offset| seek_done + offset)
        .unwrap();
    assert!(video[0] < first_time_update);
    assert!(fixture.player.stats().video.frames_skipped > 0);
    Ok(())
}

#[tokio::test]
async fn test_adaptive_codec_absorbs_size_change() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .stream(StreamFactory::video(ms(600)).with_config_change_at(ms(300)))
        .codec_options(MockCodecOptions {
            adaptive_playback: true,
            ..Default::default()
        })
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 1);
    Ok(())
}

#[tokio::test]
async fn test_new_render_target_without_key_frame_seeks_implicitly() -> Result<()> {
    let fixture = PlayerFixture::builder().video(ms(2000)).build()?;
    fixture.player.start()?;
    assert!(wait_until(TIMEOUT, || fixture.probe.rendered_timestamps(StreamType::Video).len() >= 20).await);

    fixture
        .player
        .set_render_target(Some(RenderTarget::new(2, "second surface")))?;
    assert!(wait_until(TIMEOUT, || fixture.demuxer.seeks().iter().any(|(_, browser)| *browser)).await);
    assert!(fixture.wait_for_completion().await);

    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 2);
    assert_eq!(fixture.recorder.count(|e| matches!(e, PlayerEvent::SeekDone { .. })), 0);
    assert_eq!(fixture.player.stats().seeks_completed, 0);
    Ok(())
}

#[tokio::test]
async fn test_encrypted_playback_waits_for_key() -> Result<()> {
    let gate = KeyGate::locked();
    let fixture = PlayerFixture::builder()
        .stream(StreamFactory::audio(ms(300)).with_encryption(true))
        .stream(StreamFactory::video(ms(300)).with_encryption(true))
        .codec_options(MockCodecOptions {
            key_gate: Some(gate.clone()),
            ..Default::default()
        })
        .build()?;

    fixture.player.start()?;
    assert!(fixture.wait_for_state(PlayerState::WaitingForDecryptor).await);

    fixture.player.set_content_decryptor(fixture.decryptor.clone())?;
    assert!(fixture.wait_for_event(&PlayerEvent::WaitingForKey).await);
    assert!(!gate.is_open());

    fixture.decryptor.add_key();
    assert!(fixture.wait_for_completion().await);
    assert!(fixture.recorder.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_codec_error_releases_codecs_before_reporting() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .video(ms(1000))
        .codec_options(MockCodecOptions {
            fail_after_inputs: Some(6),
            ..Default::default()
        })
        .build()?;

    let live_at_error = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&live_at_error);
    let probe = fixture.probe.clone();
    let _subscription = fixture.player.subscribe_events(move |event| {
        if let PlayerEvent::Error { kind, .. } = event {
            *seen.lock() = Some((kind, probe.live_codecs()));
        }
    });

    fixture.player.start()?;
    assert!(wait_until(TIMEOUT, || live_at_error.lock().is_some()).await);
    assert_eq!(*live_at_error.lock(), Some((ErrorKind::Codec, 0)));
    assert!(fixture.wait_for_state(PlayerState::Error).await);

    // Error is terminal
    fixture.player.release()?;
    fixture.player.start()?;
    tokio::time::sleep(ms(100)).await;
    assert_eq!(fixture.player.state(), PlayerState::Error);
    Ok(())
}

#[tokio::test]
async fn test_codec_create_failure_is_config_failure() -> Result<()> {
    let fixture = PlayerFixture::builder()
        .audio(ms(300))
        .codec_options(MockCodecOptions {
            fail_create: true,
            ..Default::default()
        })
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_state(PlayerState::Error).await);
    assert_eq!(
        fixture
            .recorder
            .count(|e| matches!(e, PlayerEvent::Error { kind: ErrorKind::ConfigFailure, .. })),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_release_frees_codecs_and_allows_restart() -> Result<()> {
    let fixture = PlayerFixture::builder().video(ms(800)).build()?;
    fixture.player.start()?;
    assert!(wait_until(TIMEOUT, || fixture.probe.rendered_timestamps(StreamType::Video).len() >= 3).await);

    fixture.player.release()?;
    assert!(fixture.wait_for_state(PlayerState::Paused).await);
    assert!(wait_until(TIMEOUT, || fixture.probe.live_codecs() == 0).await);
    assert_eq!(fixture.probe.outstanding_output_buffers(), 0);

    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 2);
    Ok(())
}

#[tokio::test]
async fn test_duration_change_updates_metadata() -> Result<()> {
    let fixture = PlayerFixture::builder().audio(ms(300)).build()?;
    assert!(wait_until(TIMEOUT, || fixture.player.duration() == ms(300)).await);

    fixture.demuxer.post_duration(ms(900));
    assert!(wait_until(TIMEOUT, || fixture.player.duration() == ms(900)).await);
    assert!(fixture.recorder.contains(&PlayerEvent::MetadataChanged {
        duration: ms(900),
        width: 0,
        height: 0,
    }));
    Ok(())
}
