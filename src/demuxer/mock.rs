//! Synthetic demuxer used by tests and the demo binary
//!
//! [`StreamFactory`] generates AAC-like and H.264-like elementary streams with
//! fixed frame periods. [`MockDemuxer`] serves them from a delivery thread so
//! replies arrive asynchronously, the way a real demuxer's would.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::demuxer::{Demuxer, DemuxerClient};
use crate::internal_error;
use crate::media::{
    AccessUnit, AudioCodec, AudioConfigs, Chunk, DecryptConfig, StreamConfigs, StreamType,
    SubsampleEntry, VideoCodec, VideoConfigs,
};
use crate::utils::error::Result;

/// Access units per generated chunk
pub const UNITS_PER_CHUNK: usize = 4;

/// Sample rate of the synthetic audio stream
pub const AUDIO_SAMPLE_RATE: u32 = 44100;

/// Frame period of the synthetic video stream
pub const VIDEO_FRAME_PERIOD: Duration = Duration::from_millis(20);

/// Frame period of the synthetic audio stream: one 1024-sample AAC packet
pub fn audio_frame_period() -> Duration {
    Duration::from_nanos(1024 * 1_000_000_000 / AUDIO_SAMPLE_RATE as u64)
}

/// Generator of one synthetic elementary stream
#[derive(Debug, Clone)]
pub struct StreamFactory {
    stream: StreamType,
    duration: Duration,
    frame_period: Duration,
    next_timestamp: Duration,
    eos_sent: bool,
    key_frame_pending: bool,
    b_frame_swap: bool,
    encrypted: bool,
    config_change_at: Option<Duration>,
    config_change_sent: bool,
    generation: u32,
}

impl StreamFactory {
    /// AAC-like stereo stream at 44.1 kHz; every unit is a key frame
    pub fn audio(duration: Duration) -> Self {
        Self::new(StreamType::Audio, duration, audio_frame_period())
    }

    /// H.264-like 320x240 stream at 50 fps with a B-frame reorder in every chunk
    pub fn video(duration: Duration) -> Self {
        let mut factory = Self::new(StreamType::Video, duration, VIDEO_FRAME_PERIOD);
        factory.b_frame_swap = true;
        factory
    }

    fn new(stream: StreamType, duration: Duration, frame_period: Duration) -> Self {
        Self {
            stream,
            duration,
            frame_period,
            next_timestamp: Duration::ZERO,
            eos_sent: false,
            key_frame_pending: true,
            b_frame_swap: false,
            encrypted: false,
            config_change_at: None,
            config_change_sent: false,
            generation: 0,
        }
    }

    /// Swap the timestamps of the second and third unit of every full chunk
    pub fn with_b_frame_swap(mut self, enabled: bool) -> Self {
        self.b_frame_swap = enabled;
        self
    }

    /// Mark the stream encrypted and attach decrypt parameters to every unit
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encrypted = enabled;
        self
    }

    /// Insert a config change once the stream reaches `at`
    pub fn with_config_change_at(mut self, at: Duration) -> Self {
        self.config_change_at = Some(at);
        self
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn frame_period(&self) -> Duration {
        self.frame_period
    }

    /// Timestamp of the last data unit the stream will produce
    pub fn last_timestamp(&self) -> Duration {
        let frames = self.duration.as_nanos() / self.frame_period.as_nanos().max(1);
        self.frame_period * frames as u32
    }

    /// Number of data units from the start to the end of the stream
    pub fn total_units(&self) -> usize {
        (self.duration.as_nanos() / self.frame_period.as_nanos().max(1)) as usize + 1
    }

    /// Write this stream's current configuration into `configs`
    pub fn describe(&self, configs: &mut StreamConfigs) {
        match self.stream {
            StreamType::Audio => {
                configs.audio = Some(AudioConfigs {
                    codec: AudioCodec::Aac,
                    sampling_rate: if self.generation == 0 { AUDIO_SAMPLE_RATE } else { 48000 },
                    channels: 2,
                    is_encrypted: self.encrypted,
                    extra_data: vec![0x12, 0x10],
                });
            }
            StreamType::Video => {
                let (width, height) = if self.generation == 0 { (320, 240) } else { (640, 480) };
                configs.video = Some(VideoConfigs {
                    codec: VideoCodec::H264,
                    width,
                    height,
                    is_encrypted: self.encrypted,
                    extra_data: Vec::new(),
                });
            }
        }
        configs.duration = configs.duration.max(self.duration);
    }

    /// Reposition at `time`; the next unit is a key frame
    pub fn seek(&mut self, time: Duration) {
        let frames = time.as_nanos() / self.frame_period.as_nanos().max(1);
        self.next_timestamp = self.frame_period * frames as u32;
        self.eos_sent = false;
        self.key_frame_pending = true;
    }

    /// Produce the next chunk
    ///
    /// Data chunks hold up to [`UNITS_PER_CHUNK`] units. Past the duration a
    /// chunk holding a single end-of-stream unit is produced. A chunk that
    /// reaches the configured change point ends with a config-changed unit.
    pub fn next_chunk(&mut self) -> Chunk {
        if self.eos_sent || self.next_timestamp > self.duration {
            self.eos_sent = true;
            let eos = AccessUnit::end_of_stream(self.stream, self.next_timestamp);
            return Chunk::new(self.stream, vec![eos]);
        }

        let mut units = Vec::with_capacity(UNITS_PER_CHUNK);
        let mut config_changed = false;
        while units.len() < UNITS_PER_CHUNK && self.next_timestamp <= self.duration {
            if self.config_change_due() {
                self.config_change_sent = true;
                self.generation += 1;
                self.key_frame_pending = true;
                units.push(AccessUnit::config_changed(self.stream, self.next_timestamp));
                config_changed = true;
                break;
            }
            units.push(self.data_unit(self.next_timestamp));
            self.next_timestamp += self.frame_period;
        }

        if self.b_frame_swap && units.len() == UNITS_PER_CHUNK && !config_changed {
            let second = units[1].timestamp();
            let third = units[2].timestamp();
            units[1] = self.rebuilt_unit(&units[1], third);
            units[2] = self.rebuilt_unit(&units[2], second);
        }

        let chunk = Chunk::new(self.stream, units);
        if config_changed {
            let mut configs = StreamConfigs::default();
            self.describe(&mut configs);
            debug!("{} config change at {:?}", self.stream, self.next_timestamp);
            chunk.with_configs(configs)
        } else {
            chunk
        }
    }

    fn config_change_due(&self) -> bool {
        match self.config_change_at {
            Some(at) => !self.config_change_sent && self.next_timestamp >= at,
            None => false,
        }
    }

    fn data_unit(&mut self, timestamp: Duration) -> AccessUnit {
        let size = match self.stream {
            StreamType::Audio => 32,
            StreamType::Video => 64 + (timestamp.as_millis() % 64) as usize,
        };
        let mut unit = AccessUnit::new(self.stream, timestamp, vec![0xa5; size]);

        let key = match self.stream {
            StreamType::Audio => true,
            StreamType::Video => std::mem::take(&mut self.key_frame_pending),
        };
        if key {
            unit = unit.key_frame();
        }
        if self.encrypted {
            unit = unit.with_decrypt_config(DecryptConfig {
                key_id: b"mock-key".to_vec(),
                iv: vec![0; 16],
                subsamples: vec![SubsampleEntry {
                    clear_bytes: 4,
                    cypher_bytes: size as u32 - 4,
                }],
            });
        }
        unit
    }

    fn rebuilt_unit(&self, unit: &AccessUnit, timestamp: Duration) -> AccessUnit {
        let mut rebuilt = AccessUnit::new(self.stream, timestamp, unit.data().to_vec());
        if unit.is_key_frame() {
            rebuilt = rebuilt.key_frame();
        }
        if let Some(decrypt) = unit.decrypt_config() {
            rebuilt = rebuilt.with_decrypt_config(decrypt.clone());
        }
        rebuilt
    }
}

/// Timing and behavior of a [`MockDemuxer`]
#[derive(Debug, Clone, Default)]
pub struct MockDemuxerOptions {
    /// Wait for [`MockDemuxerHandle::post_configs`] instead of reporting configs on initialize
    pub defer_configs: bool,

    /// Delay before each chunk is delivered
    pub data_delay: Duration,

    /// Delay before a seek is confirmed
    pub seek_done_delay: Duration,

    /// After a seek, audio restarts this far before the seek target
    pub audio_preroll: Duration,

    /// After a seek, video restarts this far before the seek target
    pub video_preroll: Duration,
}

enum Job {
    Data(StreamType),
    Seek { time: Duration, is_browser_seek: bool },
    PostConfigs,
    Duration(Duration),
    Shutdown,
}

#[derive(Debug, Default)]
struct DemuxerRecord {
    data_requests: HashMap<StreamType, usize>,
    chunks_delivered: HashMap<StreamType, usize>,
    seeks: Vec<(Duration, bool)>,
}

/// Observes and pokes a [`MockDemuxer`] after it moved into the player
#[derive(Clone)]
pub struct MockDemuxerHandle {
    jobs: Sender<Job>,
    record: Arc<Mutex<DemuxerRecord>>,
}

impl MockDemuxerHandle {
    pub fn data_requests(&self, stream: StreamType) -> usize {
        self.record.lock().data_requests.get(&stream).copied().unwrap_or(0)
    }

    pub fn chunks_delivered(&self, stream: StreamType) -> usize {
        self.record.lock().chunks_delivered.get(&stream).copied().unwrap_or(0)
    }

    /// Seeks received so far as `(time, is_browser_seek)`
    pub fn seeks(&self) -> Vec<(Duration, bool)> {
        self.record.lock().seeks.clone()
    }

    /// Report the stream configs now
    pub fn post_configs(&self) {
        if self.jobs.send(Job::PostConfigs).is_err() {
            warn!("mock demuxer is gone, configs not posted");
        }
    }

    /// Report a new duration
    pub fn post_duration(&self, duration: Duration) {
        if self.jobs.send(Job::Duration(duration)).is_err() {
            warn!("mock demuxer is gone, duration not posted");
        }
    }
}

/// Demuxer serving synthetic streams from a delivery thread
pub struct MockDemuxer {
    streams: Option<Vec<StreamFactory>>,
    options: MockDemuxerOptions,
    jobs: Sender<Job>,
    receiver: Option<Receiver<Job>>,
    record: Arc<Mutex<DemuxerRecord>>,
    thread: Option<JoinHandle<()>>,
}

impl MockDemuxer {
    pub fn new(streams: Vec<StreamFactory>, options: MockDemuxerOptions) -> Self {
        let (jobs, receiver) = bounded(64);
        Self {
            streams: Some(streams),
            options,
            jobs,
            receiver: Some(receiver),
            record: Arc::new(Mutex::new(DemuxerRecord::default())),
            thread: None,
        }
    }

    pub fn handle(&self) -> MockDemuxerHandle {
        MockDemuxerHandle {
            jobs: self.jobs.clone(),
            record: Arc::clone(&self.record),
        }
    }

    fn submit(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("mock demuxer delivery thread is gone");
        }
    }
}

impl Demuxer for MockDemuxer {
    fn initialize(&mut self, client: DemuxerClient) -> Result<()> {
        let (Some(streams), Some(receiver)) = (self.streams.take(), self.receiver.take()) else {
            return Err(internal_error!("mock demuxer initialized twice"));
        };

        let delivery = Delivery {
            streams,
            options: self.options.clone(),
            client,
            record: Arc::clone(&self.record),
        };
        let thread = thread::Builder::new()
            .name("MockDemuxer".to_string())
            .spawn(move || delivery.run(receiver))
            .map_err(|e| internal_error!("mock demuxer thread: {}", e))?;
        self.thread = Some(thread);

        if !self.options.defer_configs {
            self.submit(Job::PostConfigs);
        }
        Ok(())
    }

    fn request_data(&mut self, stream: StreamType) {
        *self.record.lock().data_requests.entry(stream).or_insert(0) += 1;
        self.submit(Job::Data(stream));
    }

    fn request_seek(&mut self, time: Duration, is_browser_seek: bool) {
        self.record.lock().seeks.push((time, is_browser_seek));
        self.submit(Job::Seek {
            time,
            is_browser_seek,
        });
    }
}

impl Drop for MockDemuxer {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Delivery {
    streams: Vec<StreamFactory>,
    options: MockDemuxerOptions,
    client: DemuxerClient,
    record: Arc<Mutex<DemuxerRecord>>,
}

impl Delivery {
    fn run(mut self, jobs: Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            let delivered = match job {
                Job::Shutdown => break,
                Job::PostConfigs => self.client.on_configs_available(self.configs()),
                Job::Duration(duration) => self.client.on_duration_changed(duration),
                Job::Data(stream) => self.deliver(stream),
                Job::Seek {
                    time,
                    is_browser_seek,
                } => self.seek(time, is_browser_seek),
            };
            if delivered.is_err() {
                debug!("mock demuxer: player went away");
                break;
            }
        }
    }

    fn configs(&self) -> StreamConfigs {
        let mut configs = StreamConfigs::default();
        for factory in &self.streams {
            factory.describe(&mut configs);
        }
        configs
    }

    fn deliver(&mut self, stream: StreamType) -> Result<()> {
        let Some(factory) = self.streams.iter_mut().find(|f| f.stream() == stream) else {
            warn!("mock demuxer has no {} stream", stream);
            return Ok(());
        };
        if !self.options.data_delay.is_zero() {
            thread::sleep(self.options.data_delay);
        }
        let chunk = factory.next_chunk();
        *self.record.lock().chunks_delivered.entry(stream).or_insert(0) += 1;
        self.client.on_data_available(chunk)
    }

    fn seek(&mut self, time: Duration, is_browser_seek: bool) -> Result<()> {
        for factory in &mut self.streams {
            let preroll = match factory.stream() {
                StreamType::Audio => self.options.audio_preroll,
                StreamType::Video => self.options.video_preroll,
            };
            factory.seek(time.saturating_sub(preroll));
        }
        if !self.options.seek_done_delay.is_zero() {
            thread::sleep(self.options.seek_done_delay);
        }
        info!("mock demuxer seek to {:?} done (browser seek: {})", time, is_browser_seek);
        self.client
            .on_seek_done(if is_browser_seek { Some(time) } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxer::DemuxerMessage;

    fn data_timestamps(chunk: &Chunk) -> Vec<u64> {
        chunk
            .units
            .iter()
            .filter(|u| !u.is_end_of_stream() && !u.is_config_changed())
            .map(|u| u.timestamp().as_millis() as u64)
            .collect()
    }

    #[test]
    fn test_video_chunks_reorder_and_end_with_standalone_eos() {
        let mut factory = StreamFactory::video(Duration::from_millis(100));

        let first = factory.next_chunk();
        first.validate().unwrap();
        assert_eq!(data_timestamps(&first), vec![0, 40, 20, 60]);
        assert!(first.units[0].is_key_frame());
        assert!(!first.units[1].is_key_frame());

        // 80 and 100 are within the duration
        let second = factory.next_chunk();
        assert_eq!(data_timestamps(&second), vec![80, 100]);

        let eos = factory.next_chunk();
        assert_eq!(eos.len(), 1);
        assert!(eos.units[0].is_end_of_stream());
        assert_eq!(factory.total_units(), 6);
        assert_eq!(factory.last_timestamp(), Duration::from_millis(100));
    }

    #[test]
    fn test_audio_units_are_all_key_frames() {
        let mut factory = StreamFactory::audio(Duration::from_secs(1));
        let chunk = factory.next_chunk();
        assert_eq!(chunk.len(), UNITS_PER_CHUNK);
        assert!(chunk.units.iter().all(|u| u.is_key_frame()));
        assert_eq!(chunk.units[1].timestamp(), audio_frame_period());
    }

    #[test]
    fn test_seek_restarts_on_key_frame() {
        let mut factory = StreamFactory::video(Duration::from_secs(1)).with_b_frame_swap(false);
        factory.next_chunk();
        factory.seek(Duration::from_millis(510));

        let chunk = factory.next_chunk();
        assert_eq!(data_timestamps(&chunk), vec![500, 520, 540, 560]);
        assert!(chunk.units[0].is_key_frame());
    }

    #[test]
    fn test_config_change_ends_chunk() {
        let mut factory = StreamFactory::video(Duration::from_secs(1))
            .with_b_frame_swap(false)
            .with_config_change_at(Duration::from_millis(60));

        let first = factory.next_chunk();
        assert_eq!(data_timestamps(&first), vec![0, 20, 40]);
        assert!(first.units[3].is_config_changed());
        first.validate().unwrap();
        let configs = first.configs.as_ref().unwrap();
        assert_eq!(configs.video.as_ref().unwrap().width, 640);

        let next = factory.next_chunk();
        assert_eq!(next.units[0].timestamp(), Duration::from_millis(60));
        assert!(next.units[0].is_key_frame());
    }

    #[test]
    fn test_encrypted_units_carry_decrypt_config() {
        let mut factory = StreamFactory::audio(Duration::from_secs(1)).with_encryption(true);
        let mut configs = StreamConfigs::default();
        factory.describe(&mut configs);
        assert!(configs.audio.unwrap().is_encrypted);
        assert!(factory.next_chunk().units[0].decrypt_config().is_some());
    }

    #[test]
    fn test_mock_demuxer_replies_asynchronously() {
        let (tx, rx) = bounded(16);
        let mut demuxer = MockDemuxer::new(
            vec![StreamFactory::audio(Duration::from_secs(1))],
            MockDemuxerOptions::default(),
        );
        let handle = demuxer.handle();
        demuxer.initialize(DemuxerClient::new(tx)).unwrap();

        let configs = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(configs, DemuxerMessage::ConfigsAvailable(c) if c.has_audio() && !c.has_video()));

        demuxer.request_data(StreamType::Audio);
        let data = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(data, DemuxerMessage::DataAvailable(c) if c.len() == UNITS_PER_CHUNK));

        demuxer.request_seek(Duration::from_millis(300), true);
        let done = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(done, DemuxerMessage::SeekDone(Some(Duration::from_millis(300))));

        assert_eq!(handle.data_requests(StreamType::Audio), 1);
        assert_eq!(handle.chunks_delivered(StreamType::Audio), 1);
        assert_eq!(handle.seeks(), vec![(Duration::from_millis(300), true)]);
    }
}
