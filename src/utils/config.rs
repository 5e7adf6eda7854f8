//! Configuration management for MCPlayer
//!
//! This module handles loading and managing pipeline configuration
//! from various sources including config files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::error::{IntoPlayerError, McPlayerError, Result};

/// Main pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Decoder configuration
    pub decoder: DecoderConfig,

    /// Audio configuration
    pub audio: AudioConfig,

    /// Player configuration
    pub playback: PlaybackConfig,

    /// General application settings
    pub general: GeneralConfig,
}

/// Decoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Consumed chunks kept behind the cursor for key frame rewinds
    pub history_chunks: usize,

    /// Number of data units that completes a prefetch
    pub prefetch_limit: usize,

    /// Below this many data units the decoder asks the demuxer for more
    pub playback_low_limit: usize,

    /// Wait bound for dequeuing a codec input buffer, in milliseconds
    pub input_timeout_ms: u64,

    /// Wait bound for dequeuing a codec output buffer, in milliseconds
    pub output_timeout_ms: u64,

    /// Pause between two iterations of the decode loop, in milliseconds
    pub frame_delay_ms: u64,

    /// Video frames allowed to wait for their presentation time
    pub max_delayed_frames: usize,

    /// Capacity of the decoder to player event channel
    pub event_capacity: usize,

    /// Capacity of the player to decoder command channel
    pub command_capacity: usize,
}

/// Audio configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Initial volume (0.0 - 1.0)
    pub volume: f32,

    /// Bytes per PCM sample produced by the audio codec
    pub bytes_per_sample: u16,
}

/// Player configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Capacity of the caller to player command channel
    pub command_capacity: usize,

    /// Capacity of the demuxer to player channel
    pub demuxer_capacity: usize,

    /// Lateness tolerated before a video frame counts as late, in milliseconds
    pub late_frame_threshold_ms: u64,

    /// Drain and recreate the audio codec on every config change
    pub always_reconfigure_audio: bool,

    /// Drain and recreate the video codec on every config change
    pub always_reconfigure_video: bool,
}

/// General application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            history_chunks: 2,
            prefetch_limit: 8,
            playback_low_limit: 4,
            input_timeout_ms: 20,
            output_timeout_ms: 20,
            frame_delay_ms: 1,
            max_delayed_frames: 1,
            event_capacity: 256,
            command_capacity: 16,
        }
    }
}

impl DecoderConfig {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_millis(self.output_timeout_ms)
    }

    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            bytes_per_sample: 2,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            command_capacity: 32,
            demuxer_capacity: 64,
            late_frame_threshold_ms: 0,
            always_reconfigure_audio: false,
            always_reconfigure_video: false,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/mcplayer/config.toml on Linux)
    /// 3. User config file (~/.config/mcplayer/config.toml on Linux)
    /// 4. Environment variables (MCPLAYER_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config.merge_from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config.merge_from_file(&user_path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from an explicit file, then apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.merge_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the given path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).config_err("Failed to create config directory")?;
        }

        let toml = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(path, toml).config_err("Failed to write config file")?;

        Ok(())
    }

    /// Merge configuration from a TOML file
    ///
    /// Sections and keys missing from the file fall back to defaults.
    fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).config_err("Failed to read config file")?;
        let file_config: Config = toml::from_str(&contents).config_err("Failed to parse config file")?;

        *self = file_config;

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(depth) = std::env::var("MCPLAYER_HISTORY_CHUNKS") {
            self.decoder.history_chunks = depth.parse()
                .map_err(|_| McPlayerError::Config("Invalid MCPLAYER_HISTORY_CHUNKS".to_string()))?;
        }

        if let Ok(limit) = std::env::var("MCPLAYER_PREFETCH_LIMIT") {
            self.decoder.prefetch_limit = limit.parse()
                .map_err(|_| McPlayerError::Config("Invalid MCPLAYER_PREFETCH_LIMIT".to_string()))?;
        }

        if let Ok(volume) = std::env::var("MCPLAYER_AUDIO_VOLUME") {
            self.audio.volume = volume.parse()
                .map_err(|_| McPlayerError::Config("Invalid MCPLAYER_AUDIO_VOLUME".to_string()))?;
        }

        if let Ok(log_level) = std::env::var("MCPLAYER_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let decoder = &self.decoder;
        if decoder.prefetch_limit == 0 {
            return Err(McPlayerError::Config("Prefetch limit must be non-zero".to_string()));
        }

        if decoder.playback_low_limit > decoder.prefetch_limit {
            return Err(McPlayerError::Config(format!(
                "Playback low limit {} exceeds prefetch limit {}",
                decoder.playback_low_limit, decoder.prefetch_limit
            )));
        }

        if decoder.max_delayed_frames == 0 {
            return Err(McPlayerError::Config("Max delayed frames must be non-zero".to_string()));
        }

        if decoder.input_timeout_ms == 0 || decoder.output_timeout_ms == 0 {
            return Err(McPlayerError::Config("Codec timeouts must be non-zero".to_string()));
        }

        if decoder.event_capacity == 0
            || decoder.command_capacity == 0
            || self.playback.command_capacity == 0
            || self.playback.demuxer_capacity == 0
        {
            return Err(McPlayerError::Config("Channel capacities must be non-zero".to_string()));
        }

        if !(0.0..=1.0).contains(&self.audio.volume) {
            return Err(McPlayerError::Config("Audio volume must be between 0.0 and 1.0".to_string()));
        }

        if self.audio.bytes_per_sample == 0 {
            return Err(McPlayerError::Config("Bytes per sample must be non-zero".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(McPlayerError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level,
                valid_log_levels
            )));
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/mcplayer/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA").ok()
            .map(|p| PathBuf::from(p).join("MCPlayer").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/MCPlayer/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return dirs::config_dir()
            .map(|p| p.join("mcplayer").join("config.toml"));

        #[cfg(not(target_os = "linux"))]
        return dirs::config_dir()
            .map(|p| p.join("MCPlayer").join("config.toml"));
    }
}
