//! Configuration loading tests
//!
//! Environment overrides are process-wide, so these tests run serially.

use anyhow::Result;
use serial_test::serial;
use std::time::Duration;

use mcplayer::codec::mock::MockCodecOptions;
use mcplayer::demuxer::mock::StreamFactory;
use mcplayer::utils::ErrorKind;
use mcplayer::{Config, StreamType};
use mcplayer_integration_tests::PlayerFixture;

const OVERRIDES: [&str; 4] = [
    "MCPLAYER_HISTORY_CHUNKS",
    "MCPLAYER_PREFETCH_LIMIT",
    "MCPLAYER_AUDIO_VOLUME",
    "MCPLAYER_LOG_LEVEL",
];

fn clear_overrides() {
    for name in OVERRIDES {
        std::env::remove_var(name);
    }
}

#[test]
#[serial]
fn test_save_and_load_round_trip() -> Result<()> {
    clear_overrides();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.decoder.prefetch_limit = 12;
    config.playback.always_reconfigure_video = true;
    config.general.log_level = "debug".to_string();
    config.save_to(&path)?;

    let loaded = Config::load_from(&path)?;
    assert_eq!(loaded, config);
    Ok(())
}

#[test]
#[serial]
fn test_partial_file_falls_back_to_defaults() -> Result<()> {
    clear_overrides();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[audio]\nvolume = 0.25\n")?;

    let loaded = Config::load_from(&path)?;
    assert_eq!(loaded.audio.volume, 0.25);
    assert_eq!(loaded.decoder, Config::default().decoder);
    assert_eq!(loaded.playback, Config::default().playback);
    Ok(())
}

#[test]
#[serial]
fn test_environment_overrides_file() -> Result<()> {
    clear_overrides();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    Config::default().save_to(&path)?;

    std::env::set_var("MCPLAYER_PREFETCH_LIMIT", "20");
    std::env::set_var("MCPLAYER_HISTORY_CHUNKS", "5");
    std::env::set_var("MCPLAYER_LOG_LEVEL", "warn");
    let loaded = Config::load_from(&path);
    clear_overrides();

    let loaded = loaded?;
    assert_eq!(loaded.decoder.prefetch_limit, 20);
    assert_eq!(loaded.decoder.history_chunks, 5);
    assert_eq!(loaded.general.log_level, "warn");
    Ok(())
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() -> Result<()> {
    clear_overrides();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    Config::default().save_to(&path)?;

    std::env::set_var("MCPLAYER_AUDIO_VOLUME", "loud");
    let unparsable = Config::load_from(&path);
    std::env::set_var("MCPLAYER_AUDIO_VOLUME", "1.5");
    let out_of_range = Config::load_from(&path);
    clear_overrides();

    assert_eq!(unparsable.unwrap_err().kind(), ErrorKind::Config);
    assert_eq!(out_of_range.unwrap_err().kind(), ErrorKind::Config);

    std::fs::write(&path, "[decoder]\nprefetch_limit = 2\nplayback_low_limit = 4\n")?;
    assert!(Config::load_from(&path).is_err());

    std::fs::write(&path, "not toml at all [")?;
    assert!(Config::load_from(&path).is_err());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_always_reconfigure_recreates_adaptive_codec() -> Result<()> {
    let mut config = Config::default();
    config.playback.always_reconfigure_video = true;

    let fixture = PlayerFixture::builder()
        .stream(StreamFactory::video(Duration::from_millis(600)).with_config_change_at(Duration::from_millis(300)))
        .codec_options(MockCodecOptions {
            adaptive_playback: true,
            ..Default::default()
        })
        .config(config)
        .build()?;
    fixture.player.start()?;
    assert!(fixture.wait_for_completion().await);
    assert_eq!(fixture.probe.codecs_created(StreamType::Video), 2);
    Ok(())
}
