//! Error types for MCPlayer
//!
//! This module defines the error type shared by the queue, the decoders and the
//! player. We use thiserror for the library error type and anyhow for
//! application-level error handling in the binary and the integration tests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for MCPlayer
#[derive(Error, Debug)]
pub enum McPlayerError {
    /// A Codec Engine could not be created for the current configuration
    #[error("Configuration failure: {0}")]
    ConfigFailure(String),

    /// The Codec Engine reported an error while decoding
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration file or environment errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation was requested in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The other side of a channel has gone away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`McPlayerError`], carried by player error events
///
/// Missing keys, starvation and missing key frames are not errors here. The
/// decoders report them as events and the player recovers without surfacing
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigFailure,
    Codec,
    Config,
    Io,
    InvalidInput,
    InvalidState,
    ChannelClosed,
    Internal,
}

impl McPlayerError {
    /// Create a codec error from string
    pub fn codec_error<S: Into<String>>(msg: S) -> Self {
        McPlayerError::Codec(msg.into())
    }

    /// Create a configuration failure from string
    pub fn config_failure<S: Into<String>>(msg: S) -> Self {
        McPlayerError::ConfigFailure(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            McPlayerError::ConfigFailure(_) => ErrorKind::ConfigFailure,
            McPlayerError::Codec(_) => ErrorKind::Codec,
            McPlayerError::Config(_) => ErrorKind::Config,
            McPlayerError::FileIO(_) => ErrorKind::Io,
            McPlayerError::InvalidInput(_) => ErrorKind::InvalidInput,
            McPlayerError::InvalidState(_) => ErrorKind::InvalidState,
            McPlayerError::ChannelClosed(_) => ErrorKind::ChannelClosed,
            McPlayerError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience type alias for Results in MCPlayer
pub type Result<T> = std::result::Result<T, McPlayerError>;

/// Extension trait for converting other errors to McPlayerError
pub trait IntoPlayerError<T> {
    /// Convert this error into a configuration error with the given context
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoPlayerError<T> for std::result::Result<T, E> {
    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| McPlayerError::Config(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::McPlayerError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::McPlayerError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McPlayerError::Codec("dequeue failed".to_string());
        assert_eq!(err.to_string(), "Codec error: dequeue failed");

        let err = McPlayerError::config_failure("no render target for video");
        assert_eq!(err.to_string(), "Configuration failure: no render target for video");
        assert_eq!(err.kind(), ErrorKind::ConfigFailure);
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let player_err: McPlayerError = io_err.into();
        assert!(matches!(player_err, McPlayerError::FileIO(_)));
        assert_eq!(player_err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_into_player_error_trait() {
        let result: std::result::Result<(), &str> = Err("expected a table");
        let converted = result.config_err("Parsing config file");

        match converted {
            Err(McPlayerError::Config(msg)) => {
                assert_eq!(msg, "Parsing config file: expected a table");
            }
            _ => panic!("Expected Config error"),
        }
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("worker {} lost", "audio");
        match err {
            McPlayerError::Internal(msg) => {
                assert!(msg.starts_with("worker audio lost at "));
                assert!(msg.contains("error.rs"));
            }
            _ => panic!("Expected Internal error"),
        }
    }
}
