//! Utility module for MCPlayer
//!
//! This module provides common utilities used throughout the crate:
//! - Error handling with custom error types
//! - Configuration management
//! - Common helper functions

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{AudioConfig, Config, DecoderConfig, GeneralConfig, PlaybackConfig};
pub use error::{ErrorKind, IntoPlayerError, McPlayerError, Result};

/// Initialize the pipeline configuration
///
/// Loads configuration from:
/// 1. Default values
/// 2. System configuration file
/// 3. User configuration file
/// 4. Environment variables
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Format a media timestamp for display
///
/// # Arguments
///
/// * `duration` - Timestamp to format
///
/// # Returns
///
/// Formatted string as "MM:SS.mmm", or "HH:MM:SS.mmm" past the first hour
pub fn format_timestamp(duration: std::time::Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
    }
}
