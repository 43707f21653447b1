//! Execution backend abstraction
//!
//! A backend takes a validated [`ControlJob`] and runs it to completion,
//! either on the FPGA through its register handshake or in the software
//! model of the datapath. Both backends read their operands from, and
//! write results to, the physical addresses in the job, so the same job
//! stream and buffer plan drive either one.

use crate::backends::register::{HandshakeConfig, RegisterBackend};
use crate::backends::software::{ScheduleStats, SoftwareBackend};
use crate::dma::{BufferAllocator, HostAllocator, UdmabufAllocator, UDMABUF_SYSFS};
use crate::error::{AccelError, Result};
use crate::mmio::DEV_MEM;
use std::fmt::{self, Debug};
use std::path::Path;
use std::time::Duration;
use yolo2_chip::regs::ap_ctrl;
use yolo2_chip::{ControlJob, Precision};

/// Runs control jobs on some implementation of the datapath
pub trait ExecutionBackend: Debug + Send {
    /// Run one job to completion.
    ///
    /// The job is validated first; nothing is written for an invalid job.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidParams`] for an invalid job,
    /// [`AccelError::Timeout`] if the device does not finish within
    /// `timeout`, or an address error if an operand cannot be resolved.
    fn execute(&mut self, job: &ControlJob, timeout: Duration) -> Result<ExecutionReport>;

    /// Read the handshake register.
    ///
    /// # Errors
    ///
    /// Returns error if the register cannot be read.
    fn status(&mut self) -> Result<DeviceStatus>;

    /// Read a control-block register.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of range or unaligned.
    fn read_register(&mut self, offset: usize) -> Result<u32>;

    /// Write a control-block register. Writing `START` to `AP_CTRL` starts
    /// the job currently programmed.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of range or unaligned.
    fn write_register(&mut self, offset: usize, value: u32) -> Result<()>;

    /// Backend type for logs.
    fn backend_type(&self) -> BackendType;

    /// True when a job can be issued.
    fn is_ready(&self) -> bool;
}

/// Snapshot of the `AP_CTRL` handshake register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub u32);

impl DeviceStatus {
    /// Block idle.
    pub const fn is_idle(self) -> bool {
        self.0 & ap_ctrl::IDLE != 0
    }

    /// Run finished since the last read.
    pub const fn is_done(self) -> bool {
        self.0 & ap_ctrl::DONE != 0
    }

    /// Run in progress.
    pub const fn is_busy(self) -> bool {
        !self.is_idle() && !self.is_done()
    }

    /// Ready for new inputs.
    pub const fn is_ready(self) -> bool {
        self.0 & ap_ctrl::READY != 0
    }

    /// Start bit still latched.
    pub const fn is_started(self) -> bool {
        self.0 & ap_ctrl::START != 0
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bits = Vec::with_capacity(4);
        if self.is_started() {
            bits.push("START");
        }
        if self.is_done() {
            bits.push("DONE");
        }
        if self.is_idle() {
            bits.push("IDLE");
        }
        if self.is_ready() {
            bits.push("READY");
        }
        if bits.is_empty() {
            bits.push("BUSY");
        }
        write!(f, "{:#x} [{}]", self.0, bits.join("|"))
    }
}

/// Outcome of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Wall time from start to completion.
    pub duration: Duration,
    /// Status polls issued while waiting (zero for the software model).
    pub polls: u32,
    /// Pipeline counters, when the backend models the schedule.
    pub stats: Option<ScheduleStats>,
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Software model of the datapath.
    Software,

    /// FPGA through `/dev/mem` register windows.
    Register,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software => write!(f, "Software (datapath model)"),
            Self::Register => write!(f, "Register (FPGA)"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// FPGA when its device nodes exist, otherwise the software model.
    #[default]
    Auto,

    /// Force the software model.
    Software,

    /// Force the FPGA.
    Register,
}

/// A backend and the allocator whose buffers it can address
#[derive(Debug)]
pub struct Platform {
    /// Job executor.
    pub backend: Box<dyn ExecutionBackend>,
    /// Buffer allocator.
    pub allocator: Box<dyn BufferAllocator>,
}

/// True when `/dev/mem` and a u-dma-buf carve-out are present.
pub fn hardware_present() -> bool {
    Path::new(DEV_MEM).exists() && Path::new(UDMABUF_SYSFS).exists()
}

/// Build a backend and matching allocator.
///
/// The FPGA only implements the 16-bit fixed-point datapath, so a
/// floating-point precision always gets the software model under `Auto`.
///
/// # Errors
///
/// Returns error if the requested backend cannot be initialized.
pub fn select_backend<P: Precision>(selection: BackendSelection, handshake: &HandshakeConfig) -> Result<Platform> {
    match selection {
        BackendSelection::Auto => {
            if P::IS_FIXED && hardware_present() {
                match open_register(handshake) {
                    Ok(platform) => return Ok(platform),
                    Err(e) => tracing::warn!("FPGA unavailable ({e}), using software model"),
                }
            }
            tracing::info!("Using software backend ({})", P::NAME);
            Ok(open_software::<P>())
        }

        BackendSelection::Software => Ok(open_software::<P>()),

        BackendSelection::Register => {
            if !P::IS_FIXED {
                return Err(AccelError::invalid_state(format!(
                    "FPGA datapath is 16-bit fixed point, not {}",
                    P::NAME
                )));
            }
            open_register(handshake)
        }
    }
}

fn open_software<P: Precision>() -> Platform {
    let allocator = HostAllocator::new();
    let backend = SoftwareBackend::<P>::new(allocator.registry());
    Platform {
        backend: Box::new(backend),
        allocator: Box::new(allocator),
    }
}

fn open_register(handshake: &HandshakeConfig) -> Result<Platform> {
    let allocator = UdmabufAllocator::discover()?;
    let backend = RegisterBackend::open(handshake.clone())?;
    tracing::info!(
        "Using FPGA backend with {} ({} MB)",
        allocator.info().name,
        allocator.info().size / (1024 * 1024)
    );
    Ok(Platform {
        backend: Box::new(backend),
        allocator: Box::new(allocator),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use yolo2_chip::{Fixed16, Float32};

    #[test]
    fn status_bits_decode() {
        let idle = DeviceStatus(ap_ctrl::IDLE | ap_ctrl::READY);
        assert!(idle.is_idle() && !idle.is_busy() && !idle.is_done());
        assert_eq!(idle.to_string(), "0xc [IDLE|READY]");

        let busy = DeviceStatus(0);
        assert!(busy.is_busy());
        assert_eq!(busy.to_string(), "0x0 [BUSY]");

        let done = DeviceStatus(ap_ctrl::DONE | ap_ctrl::IDLE);
        assert!(done.is_done() && !done.is_busy());
    }

    #[test]
    fn software_selection_always_available() {
        let platform = select_backend::<Float32>(BackendSelection::Software, &HandshakeConfig::default()).unwrap();
        assert_eq!(platform.backend.backend_type(), BackendType::Software);
        assert!(platform.backend.is_ready());
        assert_eq!(platform.allocator.name(), "host");
    }

    #[test]
    fn float_never_selects_fpga() {
        let err = select_backend::<Float32>(BackendSelection::Register, &HandshakeConfig::default()).unwrap_err();
        assert!(matches!(err, AccelError::InvalidState { .. }));

        let platform = select_backend::<Float32>(BackendSelection::Auto, &HandshakeConfig::default()).unwrap();
        assert_eq!(platform.backend.backend_type(), BackendType::Software);
    }

    #[test]
    #[ignore] // Requires hardware
    fn auto_selects_fpga_when_present() {
        let platform = select_backend::<Fixed16>(BackendSelection::Auto, &HandshakeConfig::default()).unwrap();
        assert_eq!(platform.backend.backend_type(), BackendType::Register);
    }
}
