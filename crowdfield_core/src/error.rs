//! Error types for field rasterization and grid-sequence files.

use crowdfield_env::TrajectoryError;
use thiserror::Error;

/// A clipped window, as `(left, bottom, right, top)` with exclusive upper ends.
pub type WindowBounds = (i64, i64, i64, i64);

/// Errors raised while building fields or reading and writing sequences.
#[derive(Debug, Error)]
pub enum FieldError {
    /// Underlying file operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The trajectory source failed
    #[error("Trajectory error: {0}")]
    Trajectory(#[from] TrajectoryError),

    /// A density function name that is not in the function table
    #[error("Unknown density function: {0}")]
    UnknownDensityFunction(String),

    /// A speed mode name that is not in the mode table
    #[error("Unknown speed mode: {0}")]
    UnknownSpeedMode(String),

    /// The mode exists but this pass cannot run it
    #[error("Mode {mode} is not supported by {pass}")]
    UnsupportedMode { mode: String, pass: String },

    /// Parameters that no pass can honor
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Clipped kernel and grid windows disagree in size
    #[error(
        "Window mismatch for agent {agent}: grid window {dst:?} vs kernel window {src:?} (kernel {kernel_cols}x{kernel_rows})"
    )]
    WindowMismatch {
        agent: usize,
        dst: WindowBounds,
        src: WindowBounds,
        kernel_cols: usize,
        kernel_rows: usize,
    },

    /// Two grids that must share a resolution do not
    #[error("Resolution mismatch: {expected:?} vs {found:?}")]
    ResolutionMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// The body holds fewer grids than the header declares
    #[error("Sequence truncated at grid {index}: header declares {declared}")]
    TruncatedSequence { index: usize, declared: usize },

    /// The header was never patched (the writer did not finish)
    #[error("Sequence header reports no grids; the file was not finalized")]
    IncompleteSequence,

    /// An element-type id this reader cannot decode
    #[error("Unsupported element type id {0}")]
    UnsupportedElementType(i32),

    /// A rasterization worker panicked
    #[error("Raster worker {0} panicked")]
    WorkerPanicked(usize),

    /// A thread panicked while holding the frame source lock
    #[error("Frame source lock poisoned by a panicked thread")]
    SourcePoisoned,
}

impl FieldError {
    /// Creates an invalid-configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates an unsupported-mode error for the given pass.
    pub fn unsupported(mode: impl Into<String>, pass: impl Into<String>) -> Self {
        Self::UnsupportedMode {
            mode: mode.into(),
            pass: pass.into(),
        }
    }

    /// True for errors raised before any data was touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownDensityFunction(_)
                | Self::UnknownSpeedMode(_)
                | Self::UnsupportedMode { .. }
                | Self::InvalidConfig(_)
        )
    }
}

/// Result alias for field operations.
pub type Result<T> = std::result::Result<T, FieldError>;
