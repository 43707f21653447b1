//! Execution backend implementations
//!
//! Two backends:
//! - **Register**: the FPGA, through `/dev/mem` mappings of the control and
//!   Q GPIO blocks (needs root and a u-dma-buf carve-out)
//! - **Software**: a model of the datapath, generic over precision, for CI
//!   and as the numerical reference

pub mod register;
pub mod software;

pub use register::{HandshakeConfig, RegisterBackend};
pub use software::SoftwareBackend;

/// Milliseconds for error reports, saturating.
pub(crate) fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
