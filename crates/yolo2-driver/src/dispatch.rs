//! Layer dispatch
//!
//! Wraps a [`Platform`] with the cache discipline and timeout policy every
//! job needs:
//!
//! ```text
//! validate → flush inputs → execute → invalidate output
//! ```
//!
//! # Configuration
//!
//! The per-layer timeout defaults to [`DEFAULT_LAYER_TIMEOUT_MS`] and can
//! be overridden with `YOLO2_LAYER_TIMEOUT_MS`:
//!
//! | Value | Effect |
//! |-------|--------|
//! | unset or empty | default |
//! | not a number, or `0` | warning, default |
//! | above `u32::MAX` | clamped to `u32::MAX` ms |

use crate::backend::{ExecutionReport, Platform};
use crate::backends::register::HandshakeConfig;
use crate::dma::DmaBuffer;
use crate::error::{AccelError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use yolo2_chip::ControlJob;

/// Environment variable overriding the per-layer timeout.
pub const TIMEOUT_ENV: &str = "YOLO2_LAYER_TIMEOUT_MS";

/// Per-layer timeout when no override is given.
pub const DEFAULT_LAYER_TIMEOUT_MS: u64 = 10_000;

/// Dispatch configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Time allowed for one layer.
    pub layer_timeout: Duration,
    /// Register handshake timing.
    pub handshake: HandshakeConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            layer_timeout: Duration::from_millis(DEFAULT_LAYER_TIMEOUT_MS),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Defaults plus the `YOLO2_LAYER_TIMEOUT_MS` override.
    pub fn from_env() -> Self {
        Self::with_timeout_override(std::env::var(TIMEOUT_ENV).ok().as_deref())
    }

    /// Defaults plus an optional raw timeout override.
    pub fn with_timeout_override(raw: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = raw.and_then(parse_timeout_ms) {
            config.layer_timeout = Duration::from_millis(ms);
        }
        config
    }
}

fn parse_timeout_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(0) => {
            warn!("{TIMEOUT_ENV}=0 ignored, using {DEFAULT_LAYER_TIMEOUT_MS} ms");
            None
        }
        Ok(ms) => Some(ms.min(u64::from(u32::MAX))),
        Err(e) => {
            warn!("{TIMEOUT_ENV}={raw:?} ignored ({e}), using {DEFAULT_LAYER_TIMEOUT_MS} ms");
            None
        }
    }
}

/// A byte range of a DMA buffer touched by a job
#[derive(Debug, Clone, Copy)]
pub struct BufferRange<'a> {
    /// Buffer.
    pub buffer: &'a DmaBuffer,
    /// First byte.
    pub offset: usize,
    /// Length in bytes.
    pub len: usize,
}

impl<'a> BufferRange<'a> {
    /// `len` bytes at `offset`.
    pub const fn new(buffer: &'a DmaBuffer, offset: usize, len: usize) -> Self {
        Self { buffer, offset, len }
    }

    /// The whole buffer.
    pub const fn whole(buffer: &'a DmaBuffer) -> Self {
        Self {
            buffer,
            offset: 0,
            len: buffer.len(),
        }
    }

    /// Physical address of the first byte.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is past the end of the buffer.
    pub fn phys(&self) -> Result<u64> {
        self.buffer.phys_at(self.offset)
    }
}

/// Issues jobs on a platform
#[derive(Debug)]
pub struct JobDispatcher {
    platform: Platform,
    config: DispatchConfig,
    dispatched: u64,
    poisoned: bool,
}

impl JobDispatcher {
    /// Wrap a platform.
    pub fn new(platform: Platform, config: DispatchConfig) -> Self {
        debug!(
            "Dispatcher on {} / {} allocator, layer timeout {} ms",
            platform.backend.backend_type(),
            platform.allocator.name(),
            config.layer_timeout.as_millis()
        );
        Self {
            platform,
            config,
            dispatched: 0,
            poisoned: false,
        }
    }

    /// Run one job: flush `inputs`, execute, invalidate `output`.
    ///
    /// # Errors
    ///
    /// Returns the backend error, or [`AccelError::InvalidState`] once an
    /// earlier job has failed fatally.
    pub fn dispatch(
        &mut self,
        job: &ControlJob,
        inputs: &[BufferRange<'_>],
        output: BufferRange<'_>,
    ) -> Result<ExecutionReport> {
        if self.poisoned {
            return Err(AccelError::invalid_state(
                "an earlier layer failed fatally; the device needs a reset",
            ));
        }
        job.validate()?;

        let started = Instant::now();
        for range in inputs {
            self.platform.allocator.flush(range.buffer, range.offset, range.len)?;
        }

        let report = match self.platform.backend.execute(job, self.config.layer_timeout) {
            Ok(report) => report,
            Err(e) => {
                if e.is_fatal() {
                    self.poisoned = true;
                }
                return Err(e);
            }
        };

        self.platform.allocator.invalidate(output.buffer, output.offset, output.len)?;
        self.dispatched += 1;

        debug!(
            "Job {} ({}): device {:.2} ms, total {:.2} ms",
            self.dispatched,
            job.kind(),
            report.duration.as_secs_f64() * 1e3,
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(report)
    }

    /// Jobs completed.
    pub const fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Configuration in use.
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The platform.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// The platform, mutably (for allocation and register access).
    pub fn platform_mut(&mut self) -> &mut Platform {
        &mut self.platform
    }
}
