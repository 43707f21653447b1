//! DMA-visible buffer allocation
//!
//! Every buffer the accelerator touches is described to it by physical
//! address. Allocators hand out [`DmaBuffer`]s and record each live block in
//! a shared [`RegionRegistry`], so that:
//!
//! - any pointer inside a live block maps back to its physical address
//!   ([`BufferAllocator::phys_addr_of`]);
//! - the software model can resolve the physical addresses in a job back to
//!   host memory, exactly as the DMA engine would.
//!
//! ```text
//! HostAllocator      page-aligned heap, synthetic physical addresses
//! UdmabufAllocator   first-fit blocks inside a u-dma-buf carve-out
//! ```
//!
//! Cache discipline: [`BufferAllocator::flush`] before the device reads,
//! [`BufferAllocator::invalidate`] after the device writes and before the
//! CPU reads.

use crate::error::{AccelError, Result};
use crate::mmio::{MappedRegion, PAGE_SIZE};
use bytemuck::Pod;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Alignment of every block (one page, one AXI burst boundary multiple).
pub const DMA_ALIGN: usize = PAGE_SIZE;

/// First synthetic physical address handed out by [`HostAllocator`].
pub const HOST_PHYS_BASE: u64 = 0x4000_0000;

/// sysfs class directory of the u-dma-buf kernel module.
pub const UDMABUF_SYSFS: &str = "/sys/class/u-dma-buf";

#[derive(Debug, Clone, Copy)]
struct Region {
    id: u64,
    virt: usize,
    phys: u64,
    len: usize,
}

impl Region {
    fn contains_virt(&self, virt: usize) -> bool {
        virt >= self.virt && virt < self.virt + self.len
    }

    fn contains_phys(&self, phys: u64, len: usize) -> bool {
        phys >= self.phys && phys + len as u64 <= self.phys + self.len as u64
    }
}

/// Live DMA blocks, shared by an allocator, its buffers and the backend.
#[derive(Debug, Default)]
pub struct RegionRegistry {
    regions: Mutex<Vec<Region>>,
    next_id: AtomicU64,
}

impl RegionRegistry {
    /// Empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn regions(&self) -> MutexGuard<'_, Vec<Region>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, virt: usize, phys: u64, len: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.regions().push(Region { id, virt, phys, len });
        tracing::trace!("Registered DMA block {id}: virt {virt:#x} phys {phys:#x} len {len}");
        id
    }

    fn unregister(&self, id: u64) {
        self.regions().retain(|r| r.id != id);
        tracing::trace!("Released DMA block {id}");
    }

    /// Number of live blocks.
    pub fn live(&self) -> usize {
        self.regions().len()
    }

    /// Physical address of a pointer inside any live block.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AddressNotMapped`] if no block contains `ptr`.
    pub fn phys_of(&self, ptr: *const u8) -> Result<u64> {
        let virt = ptr as usize;
        self.regions()
            .iter()
            .find(|r| r.contains_virt(virt))
            .map(|r| r.phys + (virt - r.virt) as u64)
            .ok_or(AccelError::AddressNotMapped {
                addr: virt as u64,
                len: 0,
            })
    }

    /// Lock the registry for the duration of a job. Blocks cannot be freed
    /// while the guard is held.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard(self.regions())
    }

    /// First gap of `len` bytes inside `[base, base + size)`.
    fn first_fit(&self, base: u64, size: usize, len: usize) -> Option<u64> {
        let mut taken: Vec<(u64, u64)> = self
            .regions()
            .iter()
            .filter(|r| r.phys >= base && r.phys < base + size as u64)
            .map(|r| (r.phys, r.phys + round_up(r.len, DMA_ALIGN) as u64))
            .collect();
        taken.sort_unstable();

        let mut cursor = base;
        for (start, end) in taken {
            if start >= cursor + len as u64 {
                break;
            }
            cursor = cursor.max(end);
        }
        (cursor + len as u64 <= base + size as u64).then_some(cursor)
    }
}

/// Registry held locked while a job resolves and uses its addresses.
pub struct RegistryGuard<'a>(MutexGuard<'a, Vec<Region>>);

impl RegistryGuard<'_> {
    /// Host pointer for `len` bytes at physical address `phys`.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AddressNotMapped`] unless one live block
    /// contains the whole range.
    pub fn resolve(&self, phys: u64, len: usize) -> Result<NonNull<u8>> {
        self.0
            .iter()
            .find(|r| r.contains_phys(phys, len))
            .and_then(|r| NonNull::new((r.virt + (phys - r.phys) as usize) as *mut u8))
            .ok_or(AccelError::AddressNotMapped { addr: phys, len })
    }
}

enum Backing {
    Heap(Layout),
    Carveout(Arc<MappedRegion>),
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(layout) => write!(f, "Heap({} bytes)", layout.size()),
            Self::Carveout(region) => write!(f, "Carveout({})", region.path().display()),
        }
    }
}

/// One physically contiguous, device-visible block
#[derive(Debug)]
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    phys: u64,
    id: u64,
    registry: Arc<RegionRegistry>,
    backing: Backing,
}

impl DmaBuffer {
    /// Size in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of the first byte.
    pub const fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Physical address of byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AddressNotMapped`] if `offset` is past the end.
    pub fn phys_at(&self, offset: usize) -> Result<u64> {
        if offset > self.len {
            return Err(AccelError::AddressNotMapped {
                addr: self.phys + offset as u64,
                len: 0,
            });
        }
        Ok(self.phys + offset as u64)
    }

    /// Host pointer of the first byte.
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Byte view.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self (heap
        // allocation or live carve-out mapping), initialized (zeroed or
        // written), and aliasing follows the &self borrow.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable byte view.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for as_bytes; &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Typed view of the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::Misaligned`] if the length is not a multiple of
    /// the element size.
    pub fn typed<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|_| AccelError::Misaligned {
            addr: self.phys,
            align: std::mem::size_of::<T>(),
        })
    }

    /// Mutable typed view of the whole buffer.
    ///
    /// # Errors
    ///
    /// See [`DmaBuffer::typed`].
    pub fn typed_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        let phys = self.phys;
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()).map_err(|_| AccelError::Misaligned {
            addr: phys,
            align: std::mem::size_of::<T>(),
        })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(AccelError::AddressNotMapped {
                addr: self.phys + offset as u64,
                len,
            });
        }
        Ok(())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
        if let Backing::Heap(layout) = self.backing {
            // SAFETY: ptr was returned by alloc_zeroed with exactly this
            // layout in HostAllocator::allocate and is deallocated once.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// SAFETY: Send - DmaBuffer exclusively owns its block; the carve-out mapping
// is kept alive by the Arc and is valid from any thread.
unsafe impl Send for DmaBuffer {}

// SAFETY: Sync - shared access only yields &[u8]; mutation requires &mut self.
unsafe impl Sync for DmaBuffer {}

/// Allocator of device-visible memory
pub trait BufferAllocator: fmt::Debug + Send {
    /// Allocate `bytes` of zeroed, page-aligned, physically contiguous memory.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AllocationFailed`] if no block is available.
    fn allocate(&mut self, bytes: usize) -> Result<DmaBuffer>;

    /// Registry shared with buffers and backends.
    fn registry(&self) -> Arc<RegionRegistry>;

    /// Allocator name for logs.
    fn name(&self) -> &'static str;

    /// Make CPU writes in `[offset, offset + len)` visible to the device.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AddressNotMapped`] if the range is outside `buf`.
    fn flush(&self, buf: &DmaBuffer, offset: usize, len: usize) -> Result<()> {
        buf.check_range(offset, len)?;
        fence(Ordering::SeqCst);
        tracing::trace!("Flush {len} bytes @ {:#x}", buf.phys + offset as u64);
        Ok(())
    }

    /// Make device writes in `[offset, offset + len)` visible to the CPU.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AddressNotMapped`] if the range is outside `buf`.
    fn invalidate(&self, buf: &DmaBuffer, offset: usize, len: usize) -> Result<()> {
        buf.check_range(offset, len)?;
        fence(Ordering::SeqCst);
        tracing::trace!("Invalidate {len} bytes @ {:#x}", buf.phys + offset as u64);
        Ok(())
    }

    /// Release a buffer.
    fn free(&mut self, buf: DmaBuffer) {
        tracing::debug!("Freeing {} bytes @ {:#x}", buf.len(), buf.phys_addr());
        drop(buf);
    }

    /// Physical address of any pointer inside a live buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AddressNotMapped`] if `ptr` is not inside one.
    fn phys_addr_of(&self, ptr: *const u8) -> Result<u64> {
        self.registry().phys_of(ptr)
    }
}

/// Heap-backed allocator with synthetic physical addresses, used with the
/// software backend
#[derive(Debug)]
pub struct HostAllocator {
    registry: Arc<RegionRegistry>,
    next_phys: u64,
}

impl HostAllocator {
    /// Create an allocator with a fresh registry.
    pub fn new() -> Self {
        Self {
            registry: RegionRegistry::new(),
            next_phys: HOST_PHYS_BASE,
        }
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for HostAllocator {
    fn allocate(&mut self, bytes: usize) -> Result<DmaBuffer> {
        let rounded = round_up(bytes.max(1), DMA_ALIGN);
        let layout = Layout::from_size_align(rounded, DMA_ALIGN)
            .map_err(|e| AccelError::allocation_failed(bytes, e.to_string()))?;

        // SAFETY: layout has non-zero size (bytes.max(1)) and a valid
        // power-of-two alignment; the result is checked for null below and
        // released with the same layout in DmaBuffer::drop.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| AccelError::allocation_failed(bytes, "out of memory"))?;

        let phys = self.next_phys;
        // Leave a guard page between blocks so off-by-one addresses fail to resolve.
        self.next_phys += (rounded + DMA_ALIGN) as u64;
        let id = self.registry.register(ptr.as_ptr() as usize, phys, bytes);

        tracing::debug!("Host DMA block: {bytes} bytes, phys {phys:#x}");

        Ok(DmaBuffer {
            ptr,
            len: bytes,
            phys,
            id,
            registry: Arc::clone(&self.registry),
            backing: Backing::Heap(layout),
        })
    }

    fn registry(&self) -> Arc<RegionRegistry> {
        Arc::clone(&self.registry)
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

/// Attributes of one u-dma-buf device from sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdmabufInfo {
    /// Device name, e.g. `udmabuf0`.
    pub name: String,
    /// Carve-out size in bytes.
    pub size: usize,
    /// Physical base address.
    pub phys_addr: u64,
    /// sysfs directory.
    pub sysfs: PathBuf,
}

impl UdmabufInfo {
    /// Read `size` and `phys_addr` from a sysfs device directory.
    ///
    /// # Errors
    ///
    /// Returns error if either attribute is missing or malformed.
    pub fn from_sysfs(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AccelError::device_not_found(dir))?;

        let size = read_attr(&dir.join("size"))?;
        let size = parse_number(&size)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| AccelError::invalid_state(format!("{name}: bad size {size:?}")))?;
        let phys = read_attr(&dir.join("phys_addr"))?;
        let phys_addr = parse_number(&phys)
            .ok_or_else(|| AccelError::invalid_state(format!("{name}: bad phys_addr {phys:?}")))?;

        Ok(Self {
            name,
            size,
            phys_addr,
            sysfs: dir.to_path_buf(),
        })
    }

    /// All u-dma-buf devices under `class_dir`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::DeviceNotFound`] if the class directory is absent.
    pub fn scan(class_dir: &Path) -> Result<Vec<Self>> {
        let entries = fs::read_dir(class_dir).map_err(|e| AccelError::from_open(class_dir, e))?;
        let mut found: Vec<Self> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("udmabuf"))
            .filter_map(|e| match Self::from_sysfs(&e.path()) {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!("Skipping {}: {err}", e.path().display());
                    None
                }
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

/// Allocator over a u-dma-buf carve-out
#[derive(Debug)]
pub struct UdmabufAllocator {
    info: UdmabufInfo,
    mapping: Arc<MappedRegion>,
    registry: Arc<RegionRegistry>,
}

impl UdmabufAllocator {
    /// Open the first u-dma-buf device on the system.
    ///
    /// # Errors
    ///
    /// Returns error if no device exists or it cannot be mapped.
    pub fn discover() -> Result<Self> {
        let infos = UdmabufInfo::scan(Path::new(UDMABUF_SYSFS))?;
        let info = infos
            .into_iter()
            .next()
            .ok_or_else(|| AccelError::device_not_found(UDMABUF_SYSFS))?;
        Self::open(info)
    }

    /// Map a specific device.
    ///
    /// # Errors
    ///
    /// Returns error if the device node cannot be opened or mapped.
    pub fn open(info: UdmabufInfo) -> Result<Self> {
        // Coherent, uncached CPU mapping; not fatal if the attribute is read-only.
        if let Err(e) = fs::write(info.sysfs.join("sync_mode"), "1") {
            tracing::warn!("{}: cannot set sync_mode: {e}", info.name);
        }

        let node = Path::new("/dev").join(&info.name);
        let mapping = MappedRegion::open(&node, 0, info.size)?;

        tracing::info!(
            "u-dma-buf {}: {} MB at phys {:#x}",
            info.name,
            info.size / (1024 * 1024),
            info.phys_addr
        );

        Ok(Self {
            info,
            mapping: Arc::new(mapping),
            registry: RegionRegistry::new(),
        })
    }

    /// Device attributes.
    pub const fn info(&self) -> &UdmabufInfo {
        &self.info
    }
}

impl BufferAllocator for UdmabufAllocator {
    fn allocate(&mut self, bytes: usize) -> Result<DmaBuffer> {
        let rounded = round_up(bytes.max(1), DMA_ALIGN);
        let phys = self
            .registry
            .first_fit(self.info.phys_addr, self.info.size, rounded)
            .ok_or_else(|| {
                AccelError::allocation_failed(
                    bytes,
                    format!("{} exhausted ({} bytes total)", self.info.name, self.info.size),
                )
            })?;
        let offset = usize::try_from(phys - self.info.phys_addr)
            .map_err(|e| AccelError::allocation_failed(bytes, e.to_string()))?;

        // SAFETY: first_fit returned a range inside [phys_addr, phys_addr + size),
        // so offset + rounded <= mapping size and the pointer stays in the mapping.
        let raw = unsafe { self.mapping.as_ptr().as_ptr().add(offset) };
        let ptr = NonNull::new(raw).ok_or_else(|| AccelError::allocation_failed(bytes, "null mapping"))?;

        // SAFETY: the block is inside the live mapping and not handed out to
        // any other DmaBuffer (first_fit skips registered blocks).
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };

        let id = self.registry.register(ptr.as_ptr() as usize, phys, bytes);
        tracing::debug!("{} block: {bytes} bytes, phys {phys:#x}", self.info.name);

        Ok(DmaBuffer {
            ptr,
            len: bytes,
            phys,
            id,
            registry: Arc::clone(&self.registry),
            backing: Backing::Carveout(Arc::clone(&self.mapping)),
        })
    }

    fn registry(&self) -> Arc<RegionRegistry> {
        Arc::clone(&self.registry)
    }

    fn name(&self) -> &'static str {
        "udmabuf"
    }
}

const fn round_up(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}

fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| AccelError::from_open(path, e))
}

/// Parse a sysfs number, hex with `0x` prefix or decimal.
fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_blocks_are_aligned_and_zeroed() {
        let mut alloc = HostAllocator::new();
        let buf = alloc.allocate(1000).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.as_ptr() as usize % DMA_ALIGN, 0);
        assert_eq!(buf.phys_addr() % DMA_ALIGN as u64, 0);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn phys_derivable_from_interior_pointer() {
        let mut alloc = HostAllocator::new();
        let _first = alloc.allocate(64).unwrap();
        let buf = alloc.allocate(4096).unwrap();
        // SAFETY: 100 < len
        let interior = unsafe { buf.as_ptr().add(100) };
        assert_eq!(alloc.phys_addr_of(interior).unwrap(), buf.phys_addr() + 100);
        assert_eq!(buf.phys_at(100).unwrap(), buf.phys_addr() + 100);
    }

    #[test]
    fn freed_blocks_stop_resolving() {
        let mut alloc = HostAllocator::new();
        let buf = alloc.allocate(256).unwrap();
        let phys = buf.phys_addr();
        let registry = alloc.registry();
        assert!(registry.lock().resolve(phys, 256).is_ok());
        alloc.free(buf);
        assert_eq!(registry.live(), 0);
        assert!(matches!(
            registry.lock().resolve(phys, 256),
            Err(AccelError::AddressNotMapped { .. })
        ));
    }

    #[test]
    fn resolve_rejects_ranges_past_the_block() {
        let mut alloc = HostAllocator::new();
        let buf = alloc.allocate(128).unwrap();
        let guard = buf.registry.lock();
        assert!(guard.resolve(buf.phys_addr() + 64, 64).is_ok());
        assert!(guard.resolve(buf.phys_addr() + 64, 65).is_err());
    }

    #[test]
    fn typed_views_share_storage() {
        let mut alloc = HostAllocator::new();
        let mut buf = alloc.allocate(8).unwrap();
        buf.typed_mut::<i16>().unwrap().copy_from_slice(&[1, -2, 3, -4]);
        assert_eq!(buf.typed::<i16>().unwrap(), &[1, -2, 3, -4]);
        assert!(buf.typed::<[u8; 3]>().is_err());
    }

    #[test]
    fn flush_checks_bounds() {
        let mut alloc = HostAllocator::new();
        let buf = alloc.allocate(64).unwrap();
        assert!(alloc.flush(&buf, 0, 64).is_ok());
        assert!(alloc.invalidate(&buf, 32, 33).is_err());
    }

    #[test]
    fn first_fit_reuses_gaps() {
        let registry = RegionRegistry::new();
        let base = 0x1000_0000;
        let a = registry.register(0x10_0000, base, 4096);
        let _b = registry.register(0x20_0000, base + 4096, 4096);
        assert_eq!(registry.first_fit(base, 4 * 4096, 4096), Some(base + 2 * 4096));
        registry.unregister(a);
        assert_eq!(registry.first_fit(base, 4 * 4096, 4096), Some(base));
        assert_eq!(registry.first_fit(base, 4 * 4096, 3 * 4096), None);
    }

    #[test]
    fn sysfs_attributes_parse() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("udmabuf0");
        fs::create_dir(&dev).unwrap();
        fs::write(dev.join("size"), "33554432\n").unwrap();
        fs::write(dev.join("phys_addr"), "0x0000000070000000\n").unwrap();
        fs::create_dir(dir.path().join("not-a-buffer")).unwrap();

        let found = UdmabufInfo::scan(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "udmabuf0");
        assert_eq!(found[0].size, 32 * 1024 * 1024);
        assert_eq!(found[0].phys_addr, 0x7000_0000);
    }

    #[test]
    fn sysfs_missing_attribute_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("size"), "4096").unwrap();
        assert!(UdmabufInfo::from_sysfs(dir.path()).is_err());
    }

    #[test]
    #[ignore] // Requires hardware
    fn udmabuf_allocates_inside_carveout() {
        let mut alloc = UdmabufAllocator::discover().unwrap();
        let buf = alloc.allocate(1 << 20).unwrap();
        let base = alloc.info().phys_addr;
        assert!(buf.phys_addr() >= base);
        assert!(buf.phys_addr() + buf.len() as u64 <= base + alloc.info().size as u64);
    }
}
