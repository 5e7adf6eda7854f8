use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use mcplayer::audio::{NullAudioSink, SinkPacing};
use mcplayer::codec::mock::{KeyGate, MockCodecFactory, MockCodecOptions, MockDecryptor};
use mcplayer::codec::RenderTarget;
use mcplayer::demuxer::mock::{MockDemuxer, MockDemuxerOptions, StreamFactory};
use mcplayer::player::{MediaPlayerBuilder, PlayerEvent, PlayerEventHandler};
use mcplayer::utils::{format_timestamp, Config};

/// MCPlayer - plays a synthetic segmented stream through the decode pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Length of the synthetic media
    #[arg(long, value_name = "MS", default_value = "2000")]
    duration_ms: u64,

    /// Leave out the audio stream
    #[arg(long)]
    no_audio: bool,

    /// Leave out the video stream
    #[arg(long)]
    no_video: bool,

    /// Seek here before starting
    #[arg(long, value_name = "MS")]
    seek_ms: Option<u64>,

    /// Encrypt the streams; the key is added once the player asks for it
    #[arg(long)]
    encrypted: bool,

    /// Pace audio output at the real sample rate
    #[arg(long)]
    realtime: bool,

    /// Configuration file to use instead of the system and user files
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the final statistics as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.no_audio && args.no_video {
        bail!("nothing to play: both streams are disabled");
    }

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => mcplayer::utils::load_config().context("loading configuration")?,
    };

    let log_level = if args.debug { "debug" } else { config.general.log_level.as_str() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting MCPlayer v{}", env!("CARGO_PKG_VERSION"));

    let duration = Duration::from_millis(args.duration_ms);
    let mut streams = Vec::new();
    if !args.no_audio {
        streams.push(StreamFactory::audio(duration).with_encryption(args.encrypted));
    }
    if !args.no_video {
        streams.push(StreamFactory::video(duration).with_encryption(args.encrypted));
    }

    let gate = KeyGate::locked();
    let factory = MockCodecFactory::new(MockCodecOptions {
        key_gate: args.encrypted.then(|| gate.clone()),
        ..Default::default()
    });
    let pacing = if args.realtime { SinkPacing::Realtime } else { SinkPacing::Instant };

    let media_player = MediaPlayerBuilder::new()
        .with_config(config)
        .with_demuxer(Box::new(MockDemuxer::new(streams, MockDemuxerOptions::default())))
        .with_codec_factory(Arc::new(factory))
        .with_audio_sink(Box::new(NullAudioSink::new(pacing)))
        .with_event_handler(Box::new(LoggingEventHandler))
        .build()?;

    // Forward the events the main loop reacts to
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let _event_sub = media_player.subscribe_events(move |event| match event {
        PlayerEvent::PlaybackComplete
        | PlayerEvent::PlaybackInterrupted
        | PlayerEvent::WaitingForKey
        | PlayerEvent::Error { .. } => {
            let _ = event_tx.send(event);
        }
        _ => {}
    });

    let decryptor = Arc::new(MockDecryptor::new(gate));
    if args.encrypted {
        media_player.set_content_decryptor(decryptor.clone())?;
    }
    if !args.no_video {
        media_player.set_render_target(Some(RenderTarget::new(1, "null surface")))?;
    }
    if let Some(seek_ms) = args.seek_ms {
        media_player.seek_to(Duration::from_millis(seek_ms))?;
    }
    media_player.start()?;

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                media_player.pause()?;
                break;
            }
            event = event_rx.recv() => match event {
                Some(PlayerEvent::WaitingForKey) => {
                    info!("Adding the decryption key");
                    decryptor.add_key();
                }
                Some(PlayerEvent::PlaybackComplete) => break,
                Some(PlayerEvent::PlaybackInterrupted) => {
                    warn!("Playback was not permitted");
                    break;
                }
                Some(PlayerEvent::Error { kind, message }) => {
                    error!("Player error ({:?}): {}", kind, message);
                    failed = true;
                    break;
                }
                Some(other) => debug!("Ignoring {:?}", other),
                None => break,
            },
        }
    }

    let snapshot = media_player.snapshot();
    if args.json {
        println!("{}", snapshot.to_json()?);
    } else {
        let stats = &snapshot.stats;
        println!("state:           {}", snapshot.state);
        println!("position:        {}", format_timestamp(snapshot.current_time));
        println!("duration:        {}", format_timestamp(snapshot.duration));
        println!(
            "audio frames:    {} rendered, {} skipped",
            stats.audio.frames_rendered, stats.audio.frames_skipped
        );
        println!(
            "video frames:    {} rendered, {} late, {} skipped",
            stats.video.frames_rendered, stats.video.frames_late, stats.video.frames_skipped
        );
        println!(
            "codecs created:  {} audio, {} video",
            stats.audio.codecs_created, stats.video.codecs_created
        );
        println!("seeks completed: {}", stats.seeks_completed);
    }

    if failed {
        bail!("playback failed");
    }
    Ok(())
}

/// Event handler that logs events
struct LoggingEventHandler;

impl PlayerEventHandler for LoggingEventHandler {
    fn handle_event(&mut self, event: &PlayerEvent) {
        match event {
            PlayerEvent::StateChanged { from, to } => debug!("State: {} -> {}", from, to),
            PlayerEvent::MetadataChanged {
                duration,
                width,
                height,
            } => info!("Media: {} {}x{}", format_timestamp(*duration), width, height),
            PlayerEvent::TimeUpdate { current } => {
                // Per frame; keep it out of the default log
                log::trace!("Position: {}", format_timestamp(*current));
            }
            PlayerEvent::SeekDone { time } => info!("Seek done at {}", format_timestamp(*time)),
            PlayerEvent::CodecCreated { stream } => debug!("{} codec created", stream),
            _ => {}
        }
    }
}
