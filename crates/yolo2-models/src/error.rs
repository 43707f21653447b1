//! Error types for network description and orchestration

use std::path::PathBuf;
use thiserror::Error;
use yolo2_chip::Violation;
use yolo2_driver::AccelError;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while parsing, planning or running a network
#[derive(Debug, Error)]
pub enum ModelError {
    /// Malformed cfg text
    #[error("cfg line {line}: {reason}")]
    Parse {
        /// 1-based line number (0 when not tied to a line)
        line: usize,
        /// Reason for failure
        reason: String,
    },

    /// Layer with missing or unusable geometry
    #[error("layer {index}: {reason}")]
    InvalidLayer {
        /// Layer index
        index: usize,
        /// Reason for failure
        reason: String,
    },

    /// A tensor does not fit in the arena
    #[error("arena overflow at layer {layer}: {reason}")]
    ArenaOverflow {
        /// Layer being placed
        layer: usize,
        /// What collided
        reason: String,
    },

    /// Concatenated route sources are not adjacent in memory
    #[error("route {layer}: sources {sources:?} are not contiguous in the arena")]
    RouteNotContiguous {
        /// Route layer
        layer: usize,
        /// Source layers
        sources: Vec<usize>,
    },

    /// A far-consumed tensor has no shelf
    #[error("route {layer}: source {source_layer} is consumed out of order and needs a shelf")]
    UnshelvedRouteSource {
        /// Route layer
        layer: usize,
        /// Source layer
        source_layer: usize,
    },

    /// A shelf is smaller than the tensor it holds
    #[error("shelf for layer {layer} holds {len} elements, needs {needed}")]
    ShelfTooSmall {
        /// Producer layer
        layer: usize,
        /// Shelf size
        len: usize,
        /// Layer footprint
        needed: usize,
    },

    /// A required parameter file is absent
    #[error("missing parameter table: {path}")]
    MissingTable {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Data length disagrees with the network
    #[error("{what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// What was checked
        what: String,
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Driver or backend failure
    #[error("accelerator: {source}")]
    Accel {
        /// Underlying driver error
        #[from]
        source: AccelError,
    },
}

impl ModelError {
    /// Create a parse error
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    /// Create an invalid layer error
    pub fn invalid_layer(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidLayer {
            index,
            reason: reason.into(),
        }
    }

    /// Create an arena overflow error
    pub fn arena_overflow(layer: usize, reason: impl Into<String>) -> Self {
        Self::ArenaOverflow {
            layer,
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// True if the error came from the device and ends the inference.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Accel { source } if source.is_fatal())
    }
}

impl From<Violation> for ModelError {
    fn from(violation: Violation) -> Self {
        Self::Accel {
            source: AccelError::from(violation),
        }
    }
}
