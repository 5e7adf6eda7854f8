//! In-process Codec Engine used by tests and the demo binary
//!
//! Every queued input unit turns into one output buffer, in decode order.
//! A format change is reported before the first output. Audio outputs carry
//! one packet worth of 16-bit PCM, video outputs mirror the payload size.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{
    CodecConfig, CodecEngine, CodecFactory, CryptoContext, DequeueInput, DequeueOutput, Handle,
    HandleArena, OutputBuffer, QueueInputStatus, RenderTarget,
};
use crate::media::{DecryptConfig, StreamType};
use crate::player::{ContentDecryptor, KeyAddedListener};
use crate::utils::error::{McPlayerError, Result};

/// PCM frames produced per audio access unit
pub const AUDIO_FRAMES_PER_PACKET: usize = 1024;

const MAX_INPUT_BUFFERS: usize = 4;
const MAX_OUTPUT_BUFFERS: usize = 4;

/// Shared switch standing in for the availability of a decryption key
#[derive(Debug, Clone, Default)]
pub struct KeyGate(Arc<AtomicBool>);

impl KeyGate {
    /// A gate whose key is not available yet
    pub fn locked() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Failure injection and capabilities of created codecs
#[derive(Debug, Clone, Default)]
pub struct MockCodecOptions {
    /// Refuse to create any codec
    pub fail_create: bool,

    /// Report a codec error once this many inputs have been queued
    pub fail_after_inputs: Option<usize>,

    /// Secure input is rejected with `NoKey` while the gate is locked
    pub key_gate: Option<KeyGate>,

    /// Video codecs accept resolution changes without reconfiguration
    pub adaptive_playback: bool,
}

#[derive(Debug, Default)]
struct ProbeState {
    audio_created: usize,
    video_created: usize,
    live_codecs: usize,
    outstanding_outputs: usize,
    inputs_queued: usize,
    flushes: usize,
    rendered: Vec<(StreamType, Duration)>,
}

/// Observation point shared by a factory and every codec it created
#[derive(Debug, Clone, Default)]
pub struct MockCodecProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockCodecProbe {
    pub fn codecs_created(&self, stream: StreamType) -> usize {
        let state = self.state.lock();
        match stream {
            StreamType::Audio => state.audio_created,
            StreamType::Video => state.video_created,
        }
    }

    /// Codecs created and not yet dropped
    pub fn live_codecs(&self) -> usize {
        self.state.lock().live_codecs
    }

    /// Output buffers handed out and neither released nor flushed
    pub fn outstanding_output_buffers(&self) -> usize {
        self.state.lock().outstanding_outputs
    }

    pub fn inputs_queued(&self) -> usize {
        self.state.lock().inputs_queued
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    /// Timestamps of presented output, in order: video buffers released with
    /// `render = true` and audio buffers whose PCM was read
    pub fn rendered_timestamps(&self, stream: StreamType) -> Vec<Duration> {
        self.state
            .lock()
            .rendered
            .iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, ts)| *ts)
            .collect()
    }
}

/// Factory producing [`MockCodec`]s
#[derive(Debug, Clone, Default)]
pub struct MockCodecFactory {
    options: MockCodecOptions,
    probe: MockCodecProbe,
}

impl MockCodecFactory {
    pub fn new(options: MockCodecOptions) -> Self {
        Self {
            options,
            probe: MockCodecProbe::default(),
        }
    }

    pub fn probe(&self) -> MockCodecProbe {
        self.probe.clone()
    }
}

impl CodecFactory for MockCodecFactory {
    fn create(
        &self,
        config: &CodecConfig,
        target: Option<&RenderTarget>,
        crypto: Option<&CryptoContext>,
    ) -> Result<Box<dyn CodecEngine>> {
        if self.options.fail_create {
            return Err(McPlayerError::config_failure("codec creation disabled"));
        }
        if config.is_encrypted() && crypto.is_none() {
            return Err(McPlayerError::config_failure("encrypted stream without crypto context"));
        }
        if config.stream_type() == StreamType::Video && target.is_none() {
            return Err(McPlayerError::config_failure("video codec without render target"));
        }

        {
            let mut state = self.probe.state.lock();
            match config.stream_type() {
                StreamType::Audio => state.audio_created += 1,
                StreamType::Video => state.video_created += 1,
            }
            state.live_codecs += 1;
        }

        Ok(Box::new(MockCodec {
            config: config.clone(),
            options: self.options.clone(),
            probe: self.probe.clone(),
            inputs: HandleArena::new(),
            outputs: HandleArena::new(),
            pending: VecDeque::new(),
            format_reported: false,
            last_timestamp: Duration::ZERO,
            inputs_queued: 0,
        }))
    }
}

#[derive(Debug)]
struct PendingOutput {
    timestamp: Duration,
    size: usize,
    end_of_stream: bool,
}

#[derive(Debug)]
struct OutputSlot {
    data: Vec<u8>,
    timestamp: Duration,
}

/// Codec double created by [`MockCodecFactory`]
#[derive(Debug)]
pub struct MockCodec {
    config: CodecConfig,
    options: MockCodecOptions,
    probe: MockCodecProbe,
    inputs: HandleArena<()>,
    outputs: HandleArena<OutputSlot>,
    pending: VecDeque<PendingOutput>,
    format_reported: bool,
    last_timestamp: Duration,
    inputs_queued: usize,
}

impl MockCodec {
    fn stream(&self) -> StreamType {
        self.config.stream_type()
    }

    fn output_size_for(&self, payload: &[u8]) -> usize {
        match &self.config {
            CodecConfig::Audio(audio) => AUDIO_FRAMES_PER_PACKET * audio.channels as usize * 2,
            CodecConfig::Video(_) => payload.len().max(1),
        }
    }

    fn accept_input(&mut self, buffer: Handle, payload: &[u8], timestamp: Duration) -> Result<()> {
        if self.inputs.remove(buffer).is_none() {
            return Err(McPlayerError::codec_error("stale input buffer"));
        }
        if let Some(limit) = self.options.fail_after_inputs {
            if self.inputs_queued >= limit {
                return Err(McPlayerError::codec_error("injected decode failure"));
            }
        }

        self.inputs_queued += 1;
        self.probe.state.lock().inputs_queued += 1;
        self.last_timestamp = timestamp;
        self.pending.push_back(PendingOutput {
            timestamp,
            size: self.output_size_for(payload),
            end_of_stream: false,
        });
        Ok(())
    }

    fn drop_outputs(&mut self) {
        let dropped = self.outputs.clear();
        let mut state = self.probe.state.lock();
        state.outstanding_outputs = state.outstanding_outputs.saturating_sub(dropped);
    }
}

impl CodecEngine for MockCodec {
    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<DequeueInput> {
        if self.inputs.len() >= MAX_INPUT_BUFFERS {
            return Ok(DequeueInput::TryAgain);
        }
        Ok(DequeueInput::Available(self.inputs.insert(())))
    }

    fn queue_input_buffer(
        &mut self,
        buffer: Handle,
        payload: &[u8],
        timestamp: Duration,
    ) -> Result<QueueInputStatus> {
        self.accept_input(buffer, payload, timestamp)?;
        Ok(QueueInputStatus::Queued)
    }

    fn queue_secure_input_buffer(
        &mut self,
        buffer: Handle,
        payload: &[u8],
        _decrypt: &DecryptConfig,
        timestamp: Duration,
    ) -> Result<QueueInputStatus> {
        if let Some(gate) = &self.options.key_gate {
            if !gate.is_open() {
                return Ok(QueueInputStatus::NoKey(buffer));
            }
        }
        self.accept_input(buffer, payload, timestamp)?;
        Ok(QueueInputStatus::Queued)
    }

    fn queue_end_of_stream(&mut self, buffer: Handle) -> Result<()> {
        if self.inputs.remove(buffer).is_none() {
            return Err(McPlayerError::codec_error("stale input buffer"));
        }
        self.pending.push_back(PendingOutput {
            timestamp: self.last_timestamp,
            size: 0,
            end_of_stream: true,
        });
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> Result<DequeueOutput> {
        if self.pending.is_empty() || self.outputs.len() >= MAX_OUTPUT_BUFFERS {
            return Ok(DequeueOutput::TryAgain);
        }
        if !self.format_reported {
            self.format_reported = true;
            return Ok(DequeueOutput::FormatChanged);
        }

        let Some(next) = self.pending.pop_front() else {
            return Ok(DequeueOutput::TryAgain);
        };
        let handle = self.outputs.insert(OutputSlot {
            data: vec![0u8; next.size],
            timestamp: next.timestamp,
        });
        self.probe.state.lock().outstanding_outputs += 1;

        Ok(DequeueOutput::Buffer(OutputBuffer {
            handle,
            offset: 0,
            size: next.size,
            timestamp: next.timestamp,
            end_of_stream: next.end_of_stream,
        }))
    }

    fn output_data(&self, buffer: &OutputBuffer) -> Result<&[u8]> {
        let slot = self
            .outputs
            .get(&buffer.handle)
            .ok_or_else(|| McPlayerError::codec_error("stale output buffer"))?;
        let pcm = slot
            .data
            .get(buffer.offset..buffer.offset + buffer.size)
            .ok_or_else(|| McPlayerError::codec_error("output range out of bounds"))?;
        if self.stream() == StreamType::Audio {
            self.probe.state.lock().rendered.push((StreamType::Audio, slot.timestamp));
        }
        Ok(pcm)
    }

    fn release_output_buffer(&mut self, buffer: Handle, render: bool) -> Result<()> {
        let slot = self
            .outputs
            .remove(buffer)
            .ok_or_else(|| McPlayerError::codec_error("stale output buffer"))?;

        let stream = self.stream();
        let mut state = self.probe.state.lock();
        state.outstanding_outputs = state.outstanding_outputs.saturating_sub(1);
        if render {
            state.rendered.push((stream, slot.timestamp));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.pending.clear();
        self.inputs.clear();
        self.drop_outputs();
        self.probe.state.lock().flushes += 1;
        Ok(())
    }

    fn output_sampling_rate(&self) -> u32 {
        match &self.config {
            CodecConfig::Audio(audio) => audio.sampling_rate,
            CodecConfig::Video(_) => 0,
        }
    }

    fn output_channel_count(&self) -> u16 {
        match &self.config {
            CodecConfig::Audio(audio) => audio.channels,
            CodecConfig::Video(_) => 0,
        }
    }

    fn output_size(&self) -> (u32, u32) {
        match &self.config {
            CodecConfig::Video(video) => (video.width, video.height),
            CodecConfig::Audio(_) => (0, 0),
        }
    }

    fn is_adaptive_playback_supported(&self, _width: u32, _height: u32) -> bool {
        self.options.adaptive_playback
    }
}

impl Drop for MockCodec {
    fn drop(&mut self) {
        self.drop_outputs();
        let mut state = self.probe.state.lock();
        state.live_codecs = state.live_codecs.saturating_sub(1);
    }
}

/// Content decryptor double backed by a [`KeyGate`]
pub struct MockDecryptor {
    context: CryptoContext,
    gate: KeyGate,
    listener: Mutex<Option<KeyAddedListener>>,
}

impl MockDecryptor {
    pub fn new(gate: KeyGate) -> Self {
        Self {
            context: CryptoContext {
                key_system: "org.w3.clearkey".to_string(),
                session_id: 1,
            },
            gate,
            listener: Mutex::new(None),
        }
    }

    /// Make the key available and tell the player about it
    pub fn add_key(&self) {
        self.gate.open();
        if let Some(listener) = self.listener.lock().as_ref() {
            listener.notify_key_added();
        }
    }
}

impl ContentDecryptor for MockDecryptor {
    fn crypto_context(&self) -> CryptoContext {
        self.context.clone()
    }

    fn set_key_added_listener(&self, listener: KeyAddedListener) {
        *self.listener.lock() = Some(listener);
    }
}
