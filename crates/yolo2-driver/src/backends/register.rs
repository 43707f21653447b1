//! FPGA backend: drives the control block and Q GPIO blocks through
//! `/dev/mem` mappings.
//!
//! Handshake per job:
//!
//! ```text
//! 1. read AP_CTRL (clears a stale DONE)
//! 2. wait for IDLE                         (idle_wait)
//! 3. write the register program, then the Q GPIO words if any Q ≠ 0
//! 4. write START and confirm the block accepted it (start_poll_limit)
//! 5. poll until DONE, or IDLE with START clear   (layer timeout)
//! ```
//!
//! A timeout clears START and is reported as fatal: the tile pipeline may
//! be stopped mid-layer and its buffers hold unknown state.

use super::duration_ms;
use crate::backend::{BackendType, DeviceStatus, ExecutionBackend, ExecutionReport};
use crate::error::{AccelError, Result};
use crate::mmio::MappedRegion;
use std::time::{Duration, Instant};
use yolo2_chip::regs::{self, ap_ctrl, gpio_program, register_program};
use yolo2_chip::window::Window;
use yolo2_chip::ControlJob;

/// Handshake timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// How long to wait for IDLE before programming a job.
    pub idle_wait: Duration,
    /// Back-to-back reads while waiting for START to latch; later reads
    /// sleep `poll_interval` and a warning is logged.
    pub start_poll_limit: u32,
    /// Sleep between completion polls.
    pub poll_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(1000),
            start_poll_limit: 100,
            poll_interval: Duration::from_micros(100),
        }
    }
}

/// Accelerator on the FPGA fabric
#[derive(Debug)]
pub struct RegisterBackend {
    control: MappedRegion,
    gpio: Vec<MappedRegion>,
    config: HandshakeConfig,
    jobs: u64,
}

impl RegisterBackend {
    /// Map the control block and the four Q GPIO blocks.
    ///
    /// # Errors
    ///
    /// Returns error if `/dev/mem` cannot be opened or mapped (usually
    /// missing root privileges).
    pub fn open(config: HandshakeConfig) -> Result<Self> {
        let control = MappedRegion::physical(Window::Control.base(), Window::Control.size())?;
        let gpio = (0..4)
            .filter_map(Window::q_gpio)
            .map(|w| MappedRegion::physical(w.base(), w.size()))
            .collect::<Result<Vec<_>>>()?;
        Self::with_regions(control, gpio, config)
    }

    /// Build from already mapped windows.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::RegisterAccess`] unless exactly four GPIO
    /// windows are given and the control window covers the register span.
    pub fn with_regions(control: MappedRegion, gpio: Vec<MappedRegion>, config: HandshakeConfig) -> Result<Self> {
        if gpio.len() != 4 {
            return Err(AccelError::register_access(format!(
                "expected 4 Q GPIO windows, got {}",
                gpio.len()
            )));
        }
        if control.size() < regs::SPAN {
            return Err(AccelError::register_access(format!(
                "control window {:#x} smaller than register span {:#x}",
                control.size(),
                regs::SPAN
            )));
        }
        Ok(Self {
            control,
            gpio,
            config,
            jobs: 0,
        })
    }

    fn read_ctrl(&self) -> Result<u32> {
        self.control.read_u32(regs::AP_CTRL)
    }

    fn wait_idle(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            let status = self.read_ctrl()?;
            if status & ap_ctrl::IDLE != 0 {
                return Ok(());
            }
            if started.elapsed() > self.config.idle_wait {
                return Err(AccelError::Timeout {
                    duration_ms: duration_ms(self.config.idle_wait),
                    status,
                });
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn program(&mut self, job: &ControlJob) -> Result<()> {
        for (offset, value) in register_program(job) {
            self.control.write_u32(offset, value)?;
        }
        if let Some(words) = gpio_program(&job.q) {
            for (block, word) in self.gpio.iter_mut().zip(words) {
                block.write_u32(regs::GPIO_DATA, word)?;
            }
        }
        Ok(())
    }

    /// Write START and wait for the block to leave IDLE. Returns the reads
    /// used.
    fn start(&mut self, timeout: Duration) -> Result<u32> {
        self.control.write_u32(regs::AP_CTRL, ap_ctrl::START)?;
        let started = Instant::now();
        let mut polls = 0_u32;
        loop {
            let status = self.read_ctrl()?;
            polls += 1;
            if start_latched(status) {
                return Ok(polls);
            }
            if polls == self.config.start_poll_limit {
                tracing::warn!("START not latched after {polls} reads, AP_CTRL = {}", DeviceStatus(status));
            }
            if started.elapsed() > timeout {
                self.control.write_u32(regs::AP_CTRL, 0)?;
                tracing::error!("START never latched in {} ms", timeout.as_millis());
                return Err(AccelError::Timeout {
                    duration_ms: duration_ms(timeout),
                    status,
                });
            }
            if polls >= self.config.start_poll_limit {
                std::thread::sleep(self.config.poll_interval);
            }
        }
    }
}

/// The block has taken START once it drops IDLE, or has already finished.
const fn start_latched(status: u32) -> bool {
    status & ap_ctrl::IDLE == 0 || status & ap_ctrl::DONE != 0
}

impl ExecutionBackend for RegisterBackend {
    fn execute(&mut self, job: &ControlJob, timeout: Duration) -> Result<ExecutionReport> {
        job.validate()?;

        let stale = self.read_ctrl()?;
        tracing::trace!("AP_CTRL before job: {}", DeviceStatus(stale));
        self.wait_idle()?;
        self.program(job)?;

        let started = Instant::now();
        let mut polls = self.start(timeout)?;

        loop {
            let status = self.read_ctrl()?;
            polls += 1;
            let finished =
                status & ap_ctrl::DONE != 0 || (status & ap_ctrl::IDLE != 0 && status & ap_ctrl::START == 0);
            if finished {
                break;
            }
            if started.elapsed() > timeout {
                self.control.write_u32(regs::AP_CTRL, 0)?;
                tracing::error!(
                    "{} layer timed out after {} ms, AP_CTRL = {}",
                    job.kind(),
                    timeout.as_millis(),
                    DeviceStatus(status)
                );
                return Err(AccelError::Timeout {
                    duration_ms: duration_ms(timeout),
                    status,
                });
            }
            std::thread::sleep(self.config.poll_interval);
        }

        let duration = started.elapsed();
        self.jobs += 1;
        tracing::debug!(
            "FPGA {} layer done in {:.2} ms ({polls} polls)",
            job.kind(),
            duration.as_secs_f64() * 1e3
        );

        Ok(ExecutionReport {
            duration,
            polls,
            stats: None,
        })
    }

    fn status(&mut self) -> Result<DeviceStatus> {
        self.read_ctrl().map(DeviceStatus)
    }

    fn read_register(&mut self, offset: usize) -> Result<u32> {
        self.control.read_u32(offset)
    }

    fn write_register(&mut self, offset: usize, value: u32) -> Result<()> {
        self.control.write_u32(offset, value)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Register
    }

    fn is_ready(&self) -> bool {
        self.read_ctrl().is_ok_and(|s| s & ap_ctrl::IDLE != 0)
    }
}
