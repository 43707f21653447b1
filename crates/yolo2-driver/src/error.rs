//! Error types for accelerator driver operations

use std::path::PathBuf;
use thiserror::Error;
use yolo2_chip::Violation;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, AccelError>;

/// Errors that can occur while allocating buffers or running jobs
#[derive(Debug, Error)]
pub enum AccelError {
    /// Device node or sysfs entry not found
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Insufficient privileges for a device node
    #[error("Permission denied: {path} (run as root or fix udev rules)")]
    PermissionDenied {
        /// Path that was opened
        path: PathBuf,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Job parameters rejected before issue
    #[error("Invalid job parameters: {violation}")]
    InvalidParams {
        /// The offending parameter
        #[from]
        violation: Violation,
    },

    /// Job did not complete in time; the in-flight tile state is unknown
    #[error("Layer timeout after {duration_ms}ms (AP_CTRL = {status:#x})")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
        /// Last observed handshake register
        status: u32,
    },

    /// DMA buffer allocation failed
    #[error("Allocation of {requested} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes
        requested: usize,
        /// Reason for failure
        reason: String,
    },

    /// Physical address (or pointer) outside every live allocation
    #[error("Address {addr:#x} (+{len} bytes) is not inside a mapped DMA buffer")]
    AddressNotMapped {
        /// Address that failed to resolve
        addr: u64,
        /// Length of the access
        len: usize,
    },

    /// Address not aligned for the element type
    #[error("Address {addr:#x} misaligned for {align}-byte elements")]
    Misaligned {
        /// Offending address
        addr: u64,
        /// Required alignment
        align: usize,
    },

    /// Job output overlaps one of its inputs
    #[error("Buffer overlap: {reason}")]
    BufferOverlap {
        /// Description of the overlap
        reason: String,
    },

    /// Register access or mapping failed
    #[error("Register access failed: {reason}")]
    RegisterAccess {
        /// Reason for failure
        reason: String,
    },

    /// Device or buffer is in an invalid state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },
}

impl AccelError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create an allocation failure
    pub fn allocation_failed(requested: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            requested,
            reason: reason.into(),
        }
    }

    /// Create a register access error
    pub fn register_access(reason: impl Into<String>) -> Self {
        Self::RegisterAccess {
            reason: reason.into(),
        }
    }

    /// Create a buffer overlap error
    pub fn buffer_overlap(reason: impl Into<String>) -> Self {
        Self::BufferOverlap {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Map an `open()` failure on a device node to the closest variant
    pub fn from_open(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::DeviceNotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { source: err },
        }
    }

    /// True for errors after which the inference cannot continue on the
    /// same device without a reset
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RegisterAccess { .. })
    }
}
