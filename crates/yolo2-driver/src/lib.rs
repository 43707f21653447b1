//! Host driver for the YOLOv2 FPGA accelerator.
//!
//! Owns everything that touches memory or the device: DMA buffers, the
//! register windows, and the two execution backends.
//!
//! # Backends
//!
//! ```text
//! RegisterBackend   /dev/mem control + Q GPIO windows, u-dma-buf carve-out
//! SoftwareBackend   datapath model, fixed or floating point, host memory
//! ```
//!
//! Both consume the same [`yolo2_chip::ControlJob`] stream and resolve the
//! same physical addresses, so a buffer plan built once runs on either.
//!
//! # Quick start
//!
//! ```no_run
//! use yolo2_driver::prelude::*;
//! use yolo2_chip::{geometry::pool_geometry, ControlJob, Fixed16};
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let config = DispatchConfig::from_env();
//! let platform = select_backend::<Fixed16>(BackendSelection::Auto, &config.handshake)?;
//! let mut dispatcher = JobDispatcher::new(platform, config);
//!
//! let alloc = &mut dispatcher.platform_mut().allocator;
//! let input = alloc.allocate(32 * 416 * 416 * 2)?;
//! let output = alloc.allocate(32 * 208 * 208 * 2)?;
//!
//! let job = ControlJob::data_movement(
//!     pool_geometry(32, 416, 416, 2, 2)?,
//!     input.phys_addr(),
//!     output.phys_addr(),
//! );
//! dispatcher.dispatch(&job, &[BufferRange::whole(&input)], BufferRange::whole(&output))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
pub mod dispatch;
pub mod dma;
mod error;
pub mod loading;
pub mod mmio;

pub use backend::{
    hardware_present, select_backend, BackendSelection, BackendType, DeviceStatus, ExecutionBackend,
    ExecutionReport, Platform,
};
pub use backends::software::ScheduleStats;
pub use backends::{HandshakeConfig, RegisterBackend, SoftwareBackend};
pub use dispatch::{BufferRange, DispatchConfig, JobDispatcher};
pub use dma::{BufferAllocator, DmaBuffer, HostAllocator, RegionRegistry, UdmabufAllocator};
pub use error::{AccelError, Result};
pub use loading::{LoadMetrics, ParamBlob};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        select_backend, AccelError, BackendSelection, BufferAllocator, BufferRange, DispatchConfig, DmaBuffer,
        ExecutionBackend, JobDispatcher, ParamBlob, Platform, Result,
    };
}
