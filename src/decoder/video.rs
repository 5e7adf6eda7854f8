//! Video half of the decoder
//!
//! Decoded pictures are presented on the render target when they are due.
//! Frames due in the future are held back and released by the worker loop.

use log::{debug, info, trace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::codec::{CodecConfig, CodecEngine, Handle, OutputBuffer};
use crate::decoder::policy::{ConfigureRequest, Configured, RenderMode, StreamPolicy};
use crate::decoder::worker::Notifier;
use crate::decoder::DecoderEventKind;
use crate::media::{StreamConfigs, StreamType, VideoCodec, VideoConfigs};
use crate::utils::error::{McPlayerError, Result};

#[derive(Debug)]
struct DelayedFrame {
    handle: Handle,
    timestamp: Duration,
    due: Instant,
}

/// Video stream policy
#[derive(Debug)]
pub struct VideoPolicy {
    delayed: VecDeque<DelayedFrame>,
    /// Wall time at which the media time in the second field is presented
    anchor: Option<(Instant, Duration)>,
    late_threshold: Duration,
    size: (u32, u32),
    size_reported: bool,
}

impl VideoPolicy {
    /// # Arguments
    ///
    /// * `late_threshold` - How far past its due time a frame may be presented before it counts as late
    pub fn new(late_threshold: Duration) -> Self {
        Self {
            delayed: VecDeque::new(),
            anchor: None,
            late_threshold,
            size: (0, 0),
            size_reported: false,
        }
    }

    fn due_time(&self, timestamp: Duration) -> Option<Instant> {
        let (wall, media) = self.anchor?;
        Some(wall + timestamp.saturating_sub(media))
    }

    fn present(
        &mut self,
        codec: &mut dyn CodecEngine,
        handle: Handle,
        timestamp: Duration,
        postponed: bool,
        notifier: &Notifier,
    ) -> Result<()> {
        codec.release_output_buffer(handle, true)?;
        notifier.frame_rendered();
        trace!("video frame presented at {:?}", timestamp);
        notifier.time_update(timestamp, timestamp, postponed);
        Ok(())
    }
}

impl Default for VideoPolicy {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl StreamPolicy for VideoPolicy {
    type Config = VideoConfigs;

    const STREAM: StreamType = StreamType::Video;
    const NAME: &'static str = "VideoDecoder";

    fn extract_config(configs: &StreamConfigs) -> Option<VideoConfigs> {
        configs.video.clone()
    }

    fn is_encrypted(config: &VideoConfigs) -> bool {
        config.is_encrypted
    }

    fn is_reconfigure_needed(
        &self,
        current: &VideoConfigs,
        next: &VideoConfigs,
        codec: Option<&dyn CodecEngine>,
    ) -> bool {
        if current.codec != next.codec
            || current.is_encrypted != next.is_encrypted
            || current.extra_data != next.extra_data
        {
            return true;
        }
        if current.width == next.width && current.height == next.height {
            return false;
        }
        !codec.is_some_and(|codec| codec.is_adaptive_playback_supported(next.width, next.height))
    }

    fn configure(&mut self, request: ConfigureRequest<'_, VideoConfigs>) -> Result<Configured> {
        let config = request.config;
        if config.codec == VideoCodec::Unknown {
            return Err(McPlayerError::config_failure("unknown video codec"));
        }
        let target = request
            .render_target
            .ok_or_else(|| McPlayerError::config_failure("no render target for video"))?;

        // A new codec can only start decoding at a key frame
        if !request.queue.rewind_to_last_key_frame() {
            debug!("video configure: no key frame in the queue");
            return Ok(Configured::KeyFrameRequired);
        }

        let codec = request
            .factory
            .create(&CodecConfig::Video(config.clone()), Some(target), request.crypto)?;
        self.size = (config.width, config.height);
        self.size_reported = false;
        info!(
            "video codec {:?} created: {}x{} on {}",
            config.codec,
            config.width,
            config.height,
            target.label()
        );
        Ok(Configured::Created(codec))
    }

    fn on_output_format_changed(&mut self, codec: &dyn CodecEngine, notifier: &Notifier) -> Result<()> {
        let (width, height) = codec.output_size();
        if (width, height) != self.size || !self.size_reported {
            self.size = (width, height);
            self.size_reported = true;
            info!("video size {}x{}", width, height);
            notifier.notify(DecoderEventKind::VideoSizeChanged { width, height });
        }
        Ok(())
    }

    fn render(
        &mut self,
        codec: &mut dyn CodecEngine,
        buffer: OutputBuffer,
        mode: RenderMode,
        notifier: &Notifier,
    ) -> Result<()> {
        let has_data = buffer.size > 0 && !buffer.end_of_stream;
        match mode {
            _ if !has_data => codec.release_output_buffer(buffer.handle, false),
            RenderMode::Skip => {
                notifier.frame_skipped();
                codec.release_output_buffer(buffer.handle, false)
            }
            RenderMode::AfterPreroll => {
                self.present(codec, buffer.handle, buffer.timestamp, true, notifier)
            }
            RenderMode::Now => {
                let now = Instant::now();
                match self.due_time(buffer.timestamp) {
                    Some(due) if due > now => {
                        self.delayed.push_back(DelayedFrame {
                            handle: buffer.handle,
                            timestamp: buffer.timestamp,
                            due,
                        });
                        Ok(())
                    }
                    due => {
                        let lateness = due.map_or(Duration::ZERO, |due| now.duration_since(due));
                        if lateness > self.late_threshold {
                            notifier.frame_late();
                        }
                        self.present(codec, buffer.handle, buffer.timestamp, false, notifier)
                    }
                }
            }
        }
    }

    fn on_start(&mut self, base: Duration) {
        self.anchor = Some((Instant::now(), base));
    }

    fn on_stop(&mut self) {
        self.anchor = None;
    }

    fn pending_releases(&self) -> usize {
        self.delayed.len()
    }

    fn next_release_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|frame| frame.due).min()
    }

    fn release_due(&mut self, codec: &mut dyn CodecEngine, notifier: &Notifier) -> Result<()> {
        let now = Instant::now();
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].due > now {
                index += 1;
                continue;
            }
            if let Some(frame) = self.delayed.remove(index) {
                self.present(codec, frame.handle, frame.timestamp, false, notifier)?;
            }
        }
        Ok(())
    }

    fn release_pending(&mut self, codec: &mut dyn CodecEngine) -> Result<()> {
        while let Some(frame) = self.delayed.pop_front() {
            codec.release_output_buffer(frame.handle, false)?;
        }
        Ok(())
    }

    fn forget_pending(&mut self) {
        self.delayed.clear();
    }
}
