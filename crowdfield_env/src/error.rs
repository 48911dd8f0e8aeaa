//! Error types for trajectory sources.

use thiserror::Error;

/// Errors that can occur while reading or writing trajectory data.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// Underlying file operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file starts with a version tag this reader does not know
    #[error("Unrecognized SCB version: {0}")]
    UnsupportedVersion(String),

    /// The header could not be parsed
    #[error("Malformed trajectory header: {0}")]
    MalformedHeader(String),

    /// The file ended in the middle of a frame
    #[error("Truncated frame {frame}: expected {expected} bytes, found {found}")]
    TruncatedFrame {
        frame: usize,
        expected: usize,
        found: usize,
    },

    /// Source configuration is unusable (zero stride, empty agent set, ...)
    #[error("Invalid source configuration: {0}")]
    InvalidConfig(String),

    /// Frames handed to a writer do not match its agent count
    #[error("Frame has {found} agents, expected {expected}")]
    AgentCountMismatch { expected: usize, found: usize },
}

impl TrajectoryError {
    /// Creates a malformed-header error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Result alias for trajectory operations.
pub type Result<T> = std::result::Result<T, TrajectoryError>;
