//! Audio half of the decoder
//!
//! Decoded PCM goes to an [`AudioSink`]. The playback clock comes from the
//! sink: the timestamp of the last written frame, minus the frames the sink
//! has not played yet.

use log::{debug, info};
use std::time::Duration;

use crate::audio::{AudioFormat, AudioSink, VolumeControl};
use crate::codec::{CodecConfig, CodecEngine, OutputBuffer};
use crate::decoder::policy::{ConfigureRequest, Configured, RenderMode, StreamPolicy};
use crate::decoder::worker::Notifier;
use crate::media::{AudioConfigs, StreamConfigs, StreamType};
use crate::utils::error::Result;

/// Maps a running frame count to media timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTimestampHelper {
    base: Duration,
    sample_rate: u32,
    frame_count: u64,
}

impl AudioTimestampHelper {
    pub fn new(base: Duration, sample_rate: u32) -> Self {
        Self {
            base,
            sample_rate,
            frame_count: 0,
        }
    }

    /// Restart counting from `base`
    pub fn set_base_timestamp(&mut self, base: Duration) {
        self.base = base;
        self.frame_count = 0;
    }

    pub fn add_frames(&mut self, frames: u64) {
        self.frame_count += frames;
    }

    /// Timestamp right after the last added frame
    pub fn timestamp(&self) -> Duration {
        self.base + self.frame_duration(self.frame_count)
    }

    /// Play time of `frames` frames
    pub fn frame_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = frames as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// Audio stream policy
pub struct AudioPolicy {
    sink: Box<dyn AudioSink>,
    volume: VolumeControl,
    applied_volume: Option<f32>,
    bytes_per_sample: u16,
    format: Option<AudioFormat>,
    base_timestamp: Duration,
    helper: Option<AudioTimestampHelper>,
    /// Frames written since the sink was opened or flushed
    frames_written: u64,
}

impl AudioPolicy {
    pub fn new(sink: Box<dyn AudioSink>, volume: VolumeControl, bytes_per_sample: u16) -> Self {
        Self {
            sink,
            volume,
            applied_volume: None,
            bytes_per_sample,
            format: None,
            base_timestamp: Duration::ZERO,
            helper: None,
            frames_written: 0,
        }
    }

    fn open_sink(&mut self, sample_rate: u32, channels: u16) -> Result<()> {
        let format = AudioFormat::new(sample_rate, channels, self.bytes_per_sample);
        self.sink.open(format)?;
        self.format = Some(format);
        self.frames_written = 0;
        self.applied_volume = None;

        // Continue where the previous codec left off, e.g. after a drain
        let base = self.helper.map_or(self.base_timestamp, |helper| helper.timestamp());
        self.helper = Some(AudioTimestampHelper::new(base, sample_rate));
        debug!("audio sink opened: {} Hz, {} channels, base {:?}", sample_rate, channels, base);
        Ok(())
    }

    fn apply_volume(&mut self) {
        let volume = self.volume.volume();
        if self.applied_volume != Some(volume) {
            self.sink.set_volume(volume);
            self.applied_volume = Some(volume);
        }
    }
}

impl StreamPolicy for AudioPolicy {
    type Config = AudioConfigs;

    const STREAM: StreamType = StreamType::Audio;
    const NAME: &'static str = "AudioDecoder";

    fn extract_config(configs: &StreamConfigs) -> Option<AudioConfigs> {
        configs.audio.clone()
    }

    fn is_encrypted(config: &AudioConfigs) -> bool {
        config.is_encrypted
    }

    fn is_reconfigure_needed(
        &self,
        current: &AudioConfigs,
        next: &AudioConfigs,
        _codec: Option<&dyn CodecEngine>,
    ) -> bool {
        current.codec != next.codec
            || current.sampling_rate != next.sampling_rate
            || current.channels != next.channels
            || current.is_encrypted != next.is_encrypted
            || current.extra_data != next.extra_data
    }

    fn configure(&mut self, request: ConfigureRequest<'_, AudioConfigs>) -> Result<Configured> {
        let config = request.config;
        let codec = request
            .factory
            .create(&CodecConfig::Audio(config.clone()), None, request.crypto)?;
        self.open_sink(config.sampling_rate, config.channels)?;
        info!(
            "audio codec {:?} created: {} Hz, {} channels",
            config.codec, config.sampling_rate, config.channels
        );
        Ok(Configured::Created(codec))
    }

    fn on_output_format_changed(&mut self, codec: &dyn CodecEngine, _notifier: &Notifier) -> Result<()> {
        let sample_rate = codec.output_sampling_rate();
        let channels = codec.output_channel_count();
        let unchanged = self
            .format
            .is_some_and(|f| f.sample_rate == sample_rate && f.channels == channels);
        if unchanged || sample_rate == 0 || channels == 0 {
            return Ok(());
        }
        info!("audio output format changed: {} Hz, {} channels", sample_rate, channels);
        self.open_sink(sample_rate, channels)
    }

    fn render(
        &mut self,
        codec: &mut dyn CodecEngine,
        buffer: OutputBuffer,
        mode: RenderMode,
        notifier: &Notifier,
    ) -> Result<()> {
        let has_data = buffer.size > 0 && !buffer.end_of_stream;
        if !has_data || mode == RenderMode::Skip {
            if has_data {
                notifier.frame_skipped();
            }
            return codec.release_output_buffer(buffer.handle, false);
        }

        self.apply_volume();
        let postpone = mode == RenderMode::AfterPreroll;
        let head = {
            let pcm = codec.output_data(&buffer)?;
            self.sink.write(pcm, postpone)?
        };
        codec.release_output_buffer(buffer.handle, false)?;

        let frames = self.format.map_or(0, |f| f.frames_in(buffer.size));
        self.frames_written += frames;
        let helper = self
            .helper
            .get_or_insert_with(|| AudioTimestampHelper::new(buffer.timestamp, 0));
        helper.add_frames(frames);

        let last_buffered = helper.timestamp();
        let unplayed = self.frames_written.saturating_sub(head);
        let now_playing = last_buffered.saturating_sub(helper.frame_duration(unplayed));

        notifier.frame_rendered();
        notifier.time_update(now_playing, last_buffered, postpone);
        Ok(())
    }

    fn on_start(&mut self, base: Duration) {
        debug!("audio sink playing from {:?}", base);
        self.apply_volume();
        self.sink.play();
    }

    fn on_stop(&mut self) {
        self.sink.pause();
    }

    fn on_flush(&mut self) {
        self.sink.flush();
        self.frames_written = 0;
    }

    fn set_base_timestamp(&mut self, base: Duration) {
        self.base_timestamp = base;
        if let Some(helper) = self.helper.as_mut() {
            helper.set_base_timestamp(base);
        }
    }
}
