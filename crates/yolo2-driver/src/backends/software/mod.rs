//! Software backend: a cycle-free model of the accelerator datapath
//!
//! Runs the same tiling, double buffering and Q-format arithmetic as the
//! silicon, generic over [`Precision`]. With [`yolo2_chip::Fixed16`] it
//! reproduces the FPGA output bit for bit; with [`yolo2_chip::Float32`] it is
//! the floating-point reference.
//!
//! Operands are read from the physical addresses in each job. They are
//! resolved through the allocator's [`RegionRegistry`], which stays locked
//! for the whole job so no buffer can be released mid-run.
//!
//! The backend also keeps a shadow of the control block, so a job can be
//! programmed register by register and started by writing `START`, exactly
//! as on the device.

pub mod buffers;
pub mod kernels;
pub mod loader;
pub mod scheduler;

pub use buffers::TileBuffers;
pub use scheduler::{run_layer, LayerMemory, ScheduleStats};

use super::duration_ms;
use crate::backend::{BackendType, DeviceStatus, ExecutionBackend, ExecutionReport};
use crate::dma::{RegionRegistry, RegistryGuard};
use crate::error::{AccelError, Result};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};
use yolo2_chip::limits::footprint;
use yolo2_chip::regs::{self, ap_ctrl, decode_program, gpio_program, register_program};
use yolo2_chip::{ControlJob, LayerType, Precision};

/// Software model of the accelerator
pub struct SoftwareBackend<P: Precision> {
    registry: Arc<RegionRegistry>,
    buffers: TileBuffers<P>,
    shadow: Vec<u32>,
    gpio: [u32; 4],
    ap_ctrl: u32,
    jobs: u64,
}

impl<P: Precision> fmt::Debug for SoftwareBackend<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("precision", &P::NAME)
            .field("ap_ctrl", &DeviceStatus(self.ap_ctrl))
            .field("jobs", &self.jobs)
            .field("live_buffers", &self.registry.live())
            .finish_non_exhaustive()
    }
}

impl<P: Precision> SoftwareBackend<P> {
    /// Create a backend resolving addresses through `registry`.
    pub fn new(registry: Arc<RegionRegistry>) -> Self {
        tracing::debug!("Software backend ({}) initialized", P::NAME);
        Self {
            registry,
            buffers: TileBuffers::new(),
            shadow: vec![0; regs::SPAN / 4],
            gpio: [0; 4],
            ap_ctrl: ap_ctrl::IDLE,
            jobs: 0,
        }
    }

    /// Jobs completed since creation.
    pub const fn jobs(&self) -> u64 {
        self.jobs
    }

    /// GPIO data words as last written (weight, act in, act out, bias).
    pub const fn gpio(&self) -> [u32; 4] {
        self.gpio
    }

    fn program(&mut self, job: &ControlJob) {
        for (offset, value) in register_program(job) {
            self.shadow[offset / 4] = value;
        }
        // All-zero Q tables leave the GPIO blocks untouched, as on the device.
        if let Some(words) = gpio_program(&job.q) {
            self.gpio = words;
        }
    }

    fn run(&mut self, job: &ControlJob) -> Result<ScheduleStats> {
        let g = &job.geometry;
        let elem = std::mem::size_of::<P::Elem>();
        let in_len = footprint(g.in_channels, g.in_h, g.in_w);
        let out_len = footprint(g.out_channels, g.out_h, g.out_w);
        let (w_len, b_len) = match g.kind {
            LayerType::Conv => (g.weight_count(), g.out_channels),
            LayerType::Pool | LayerType::Reorg => (0, 0),
        };

        let output = (job.addrs.output, out_len * elem);
        for (name, addr, len) in [
            ("input", job.addrs.input, in_len * elem),
            ("weights", job.addrs.weight, w_len * elem),
            ("bias", job.addrs.bias, b_len * elem),
        ] {
            if len > 0 && overlaps(output, (addr, len)) {
                return Err(AccelError::buffer_overlap(format!(
                    "output {:#x}+{} overlaps {name} {addr:#x}+{len}",
                    output.0, output.1
                )));
            }
        }

        let registry = Arc::clone(&self.registry);
        let guard = registry.lock();
        let input = resolve::<P::Elem>(&guard, job.addrs.input, in_len)?;
        let out = resolve::<P::Elem>(&guard, job.addrs.output, out_len)?;
        let weights = resolve::<P::Elem>(&guard, job.addrs.weight, w_len)?;
        let bias = resolve::<P::Elem>(&guard, job.addrs.bias, b_len)?;

        // SAFETY: each pointer was resolved inside a live DMA block for the
        // full element count and checked for alignment. The registry lock is
        // held until the end of this function, so no block can be freed or
        // reused while the slices exist. The output range is disjoint from
        // the three read-only ranges (checked above), so the mutable slice
        // aliases nothing.
        let mem = unsafe {
            LayerMemory {
                input: std::slice::from_raw_parts(input.as_ptr(), in_len),
                output: std::slice::from_raw_parts_mut(out.as_ptr(), out_len),
                weights: std::slice::from_raw_parts(weights.as_ptr(), w_len),
                bias: std::slice::from_raw_parts(bias.as_ptr(), b_len),
            }
        };

        let stats = run_layer::<P>(job, mem, &mut self.buffers);
        drop(guard);
        Ok(stats)
    }
}

impl<P: Precision> ExecutionBackend for SoftwareBackend<P> {
    fn execute(&mut self, job: &ControlJob, timeout: Duration) -> Result<ExecutionReport> {
        job.validate()?;
        self.program(job);

        self.ap_ctrl = ap_ctrl::START;
        let started = Instant::now();
        let stats = match self.run(job) {
            Ok(stats) => stats,
            Err(e) => {
                self.ap_ctrl = ap_ctrl::IDLE;
                return Err(e);
            }
        };
        let duration = started.elapsed();
        self.ap_ctrl = ap_ctrl::DONE | ap_ctrl::IDLE | ap_ctrl::READY;
        self.jobs += 1;

        if duration > timeout {
            tracing::error!(
                "Software {} layer took {:.1} ms, past the {} ms device timeout",
                job.kind(),
                duration.as_secs_f64() * 1e3,
                timeout.as_millis()
            );
            return Err(AccelError::Timeout {
                duration_ms: duration_ms(timeout),
                status: self.ap_ctrl,
            });
        }
        tracing::debug!(
            "Software {} layer: {} tiles, {} stores in {:.2} ms",
            job.kind(),
            stats.spatial_tiles,
            stats.stores,
            duration.as_secs_f64() * 1e3
        );

        Ok(ExecutionReport {
            duration,
            polls: 0,
            stats: Some(stats),
        })
    }

    fn status(&mut self) -> Result<DeviceStatus> {
        self.read_register(regs::AP_CTRL).map(DeviceStatus)
    }

    fn read_register(&mut self, offset: usize) -> Result<u32> {
        check_offset(offset)?;
        if offset == regs::AP_CTRL {
            let value = self.ap_ctrl;
            self.ap_ctrl &= !(ap_ctrl::DONE | ap_ctrl::READY);
            return Ok(value);
        }
        Ok(self.shadow[offset / 4])
    }

    fn write_register(&mut self, offset: usize, value: u32) -> Result<()> {
        check_offset(offset)?;
        if offset != regs::AP_CTRL {
            self.shadow[offset / 4] = value;
            return Ok(());
        }
        if value & ap_ctrl::START == 0 {
            return Ok(());
        }

        let shadow = &self.shadow;
        let job = decode_program(|off| shadow[off / 4], self.gpio)?;
        job.validate()?;
        tracing::debug!("START written, running programmed {} job", job.kind());

        self.ap_ctrl = ap_ctrl::START;
        let result = self.run(&job);
        self.ap_ctrl = ap_ctrl::IDLE;
        result?;
        self.ap_ctrl |= ap_ctrl::DONE | ap_ctrl::READY;
        self.jobs += 1;
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }

    fn is_ready(&self) -> bool {
        self.ap_ctrl & ap_ctrl::IDLE != 0
    }
}

fn check_offset(offset: usize) -> Result<()> {
    if offset >= regs::SPAN || offset % 4 != 0 {
        return Err(AccelError::register_access(format!(
            "Register offset {offset:#x} outside control block (span {:#x})",
            regs::SPAN
        )));
    }
    Ok(())
}

const fn overlaps(a: (u64, usize), b: (u64, usize)) -> bool {
    a.1 > 0 && b.1 > 0 && a.0 < b.0 + b.1 as u64 && b.0 < a.0 + a.1 as u64
}

/// Resolve `len` elements of `T` at `phys`, checking alignment.
fn resolve<T>(guard: &RegistryGuard<'_>, phys: u64, len: usize) -> Result<NonNull<T>> {
    if len == 0 {
        return Ok(NonNull::dangling());
    }
    let ptr = guard.resolve(phys, len * std::mem::size_of::<T>())?;
    let align = std::mem::align_of::<T>();
    if ptr.as_ptr() as usize % align != 0 {
        return Err(AccelError::Misaligned { addr: phys, align });
    }
    Ok(ptr.cast())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{BufferAllocator, DmaBuffer, HostAllocator};
    use yolo2_chip::geometry::{conv_geometry, pool_geometry};
    use yolo2_chip::limits::align8;
    use yolo2_chip::{BufferAddrs, Fixed16, Float32, QValues};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn filled<T: bytemuck::Pod>(alloc: &mut HostAllocator, data: &[T]) -> DmaBuffer {
        let mut buf = alloc.allocate(std::mem::size_of_val(data)).unwrap();
        buf.typed_mut::<T>().unwrap().copy_from_slice(data);
        buf
    }

    struct Conv1x1 {
        alloc: HostAllocator,
        _input: DmaBuffer,
        output: DmaBuffer,
        _weights: DmaBuffer,
        _bias: DmaBuffer,
        job: ControlJob,
    }

    /// 2 → 3 channel 1x1 convolution on a 4x4 plane, Q4 throughout.
    fn conv_1x1() -> Conv1x1 {
        let mut alloc = HostAllocator::new();
        let g = conv_geometry(2, 3, 4, 4, 1, 1, 0).unwrap();
        let input = filled(&mut alloc, &vec![16_i16; footprint(2, 4, 4)]);
        let output = alloc.allocate(footprint(3, 4, 4) * 2).unwrap();
        // filter o: weight (o+1)/16 on both inputs
        let weights = filled(&mut alloc, &[1_i16, 1, 2, 2, 3, 3]);
        let bias = filled(&mut alloc, &[16_i16, 0, -16]);
        let job = ControlJob::conv(
            g,
            BufferAddrs {
                input: input.phys_addr(),
                output: output.phys_addr(),
                weight: weights.phys_addr(),
                bias: bias.phys_addr(),
            },
            false,
            false,
            QValues::uniform(4),
        );
        Conv1x1 {
            alloc,
            _input: input,
            output,
            _weights: weights,
            _bias: bias,
            job,
        }
    }

    fn expected_plane(o: usize) -> i16 {
        // 2 × (o+1)/16 + bias
        [18, 4, -10][o]
    }

    #[test]
    fn executes_from_physical_addresses() {
        let t = conv_1x1();
        let mut backend = SoftwareBackend::<Fixed16>::new(t.alloc.registry());
        let report = backend.execute(&t.job, TIMEOUT).unwrap();
        assert_eq!(report.polls, 0);
        assert_eq!(report.stats.unwrap().stores, 1);

        let out = t.output.typed::<i16>().unwrap();
        let plane = 4 * align8(4);
        for o in 0..3 {
            assert_eq!(out[o * plane], expected_plane(o), "channel {o}");
            assert_eq!(out[o * plane + 3 * align8(4) + 3], expected_plane(o));
        }
        assert_eq!(backend.jobs(), 1);
    }

    #[test]
    fn overrunning_the_timeout_is_fatal() {
        let t = conv_1x1();
        let mut backend = SoftwareBackend::<Fixed16>::new(t.alloc.registry());
        let err = backend.execute(&t.job, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AccelError::Timeout { duration_ms: 0, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn register_path_matches_execute() {
        let t = conv_1x1();
        let mut backend = SoftwareBackend::<Fixed16>::new(t.alloc.registry());

        // Program once through execute so the GPIO words are set, then
        // clear the output and re-run by poking the control block.
        backend.execute(&t.job, TIMEOUT).unwrap();
        let first = t.output.typed::<i16>().unwrap().to_vec();
        let mut output = t.output;
        output.typed_mut::<i16>().unwrap().fill(0);

        for (offset, value) in register_program(&t.job) {
            backend.write_register(offset, value).unwrap();
        }
        backend.write_register(regs::AP_CTRL, ap_ctrl::START).unwrap();
        assert_eq!(output.typed::<i16>().unwrap(), first.as_slice());

        let status = backend.status().unwrap();
        assert!(status.is_done() && status.is_idle());
        // DONE clears on read
        assert!(!backend.status().unwrap().is_done());
    }

    #[test]
    fn invalid_job_writes_nothing() {
        let t = conv_1x1();
        let mut backend = SoftwareBackend::<Fixed16>::new(t.alloc.registry());
        let mut job = t.job;
        job.geometry.tm = 33;
        let err = backend.execute(&job, TIMEOUT).unwrap_err();
        assert!(matches!(err, AccelError::InvalidParams { .. }));
        assert_eq!(backend.read_register(regs::TM).unwrap(), 0);
        assert_eq!(backend.gpio(), [0; 4]);
    }

    #[test]
    fn unmapped_address_is_rejected() {
        let t = conv_1x1();
        let mut backend = SoftwareBackend::<Fixed16>::new(t.alloc.registry());
        let mut job = t.job;
        job.addrs.input = 0x10;
        assert!(matches!(
            backend.execute(&job, TIMEOUT),
            Err(AccelError::AddressNotMapped { .. })
        ));
        assert!(backend.is_ready());
    }

    #[test]
    fn output_overlapping_input_is_rejected() {
        let t = conv_1x1();
        let mut backend = SoftwareBackend::<Fixed16>::new(t.alloc.registry());
        let mut job = t.job;
        job.addrs.output = job.addrs.input + 8;
        assert!(matches!(
            backend.execute(&job, TIMEOUT),
            Err(AccelError::BufferOverlap { .. })
        ));
    }

    #[test]
    fn misaligned_address_is_rejected() {
        let mut alloc = HostAllocator::new();
        let g = pool_geometry(1, 2, 2, 2, 2).unwrap();
        let input = alloc.allocate(128).unwrap();
        let output = alloc.allocate(64).unwrap();
        let job = ControlJob::data_movement(g, input.phys_addr() + 2, output.phys_addr());
        let mut backend = SoftwareBackend::<Float32>::new(alloc.registry());
        assert!(matches!(
            backend.execute(&job, TIMEOUT),
            Err(AccelError::Misaligned { align: 4, .. })
        ));
    }

    #[test]
    fn register_offsets_are_checked() {
        let mut backend = SoftwareBackend::<Float32>::new(RegionRegistry::new());
        assert!(backend.read_register(regs::SPAN).is_err());
        assert!(backend.write_register(0x42, 1).is_err());
        backend.write_register(regs::KSIZE, 3).unwrap();
        assert_eq!(backend.read_register(regs::KSIZE).unwrap(), 3);
    }
}
