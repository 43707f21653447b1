//! Memory-mapped device windows
//!
//! Provides bounds-checked access to physical windows mapped through a
//! device file: `/dev/mem` for the control and GPIO blocks, `/dev/udmabufN`
//! for the DMA carve-out. Files are opened with `O_SYNC` so the kernel maps
//! the pages uncached.

use crate::error::{AccelError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Page size assumed for mapping offsets.
pub const PAGE_SIZE: usize = 4096;

/// Physical memory device.
pub const DEV_MEM: &str = "/dev/mem";

/// A mapped window of a device file
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: PathBuf,
    offset: u64,
}

impl MappedRegion {
    /// Map `size` bytes of `path` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `offset` is not page aligned or `size` is zero
    /// - the device file cannot be opened (missing, permissions)
    /// - mmap fails
    pub fn open(path: impl AsRef<Path>, offset: u64, size: usize) -> Result<Self> {
        let path = path.as_ref();

        if size == 0 {
            return Err(AccelError::register_access(format!(
                "Refusing zero-sized mapping of {}",
                path.display()
            )));
        }
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(AccelError::register_access(format!(
                "Mapping offset {offset:#x} of {} is not page aligned",
                path.display()
            )));
        }

        tracing::debug!("Mapping {} @ {offset:#x} ({size:#x} bytes)", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| AccelError::from_open(path, e))?;

        // SAFETY: mmap preconditions:
        // - fd is valid (just opened, kept alive in the struct for the mapping lifetime)
        // - size is non-zero (checked above)
        // - offset is page aligned (checked above)
        // - MAP_SHARED + READ|WRITE is required for device memory
        // - The mapping is released in Drop with the same size
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| AccelError::register_access(format!("mmap of {} failed: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| AccelError::register_access("mmap returned a null mapping"))?;

        tracing::info!("Mapped {} @ {offset:#x} ({} KB at {ptr:p})", path.display(), size / 1024);

        Ok(Self {
            ptr,
            size,
            _file: file,
            path: path.to_path_buf(),
            offset,
        })
    }

    /// Map a physical register window through `/dev/mem`.
    ///
    /// # Errors
    ///
    /// See [`MappedRegion::open`].
    pub fn physical(base: u64, size: usize) -> Result<Self> {
        Self::open(DEV_MEM, base, size)
    }

    fn check(&self, offset: usize, len: usize, op: &str) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(AccelError::register_access(format!(
                "Out of bounds {op}: offset={offset:#x}, size={len}, limit={:#x}",
                self.size
            )));
        }
        if offset % 4 != 0 && len == 4 {
            return Err(AccelError::register_access(format!(
                "Unaligned register {op} at {offset:#x}"
            )));
        }
        Ok(())
    }

    /// Read 32-bit register at offset
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4, "read")?;

        // SAFETY: Volatile read from memory-mapped hardware register.
        // - Bounds validated above: offset + 4 <= self.size
        // - ptr is valid (successful mmap, NonNull)
        // - Alignment validated above; the mapping base is page aligned
        // - read_volatile: registers have side effects (AP_CTRL clears on read)
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    /// Write 32-bit register at offset
    ///
    /// # Errors
    ///
    /// Returns error if offset is out of bounds or unaligned
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4, "write")?;

        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");

        // SAFETY: Volatile write to memory-mapped hardware register.
        // - Bounds and alignment validated above
        // - ptr is valid (successful mmap, NonNull)
        // - write_volatile: the write triggers hardware and must not be elided
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }

        Ok(())
    }

    /// Base of the mapping
    pub const fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapped size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Device file backing the mapping
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the mapping inside the device file
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {} @ {:#x}", self.path.display(), self.offset);

        // SAFETY: munmap requires:
        // - addr returned by mmap (self.ptr, from open())
        // - length equal to the mapped length (self.size)
        // - no further use of the mapping (we are in Drop)
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: Send is sound because:
// - MappedRegion owns its mapping exclusively
// - The mapping is process-wide; moving the owner between threads does not invalidate it
unsafe impl Send for MappedRegion {}

// SAFETY: Sync is sound because:
// - Writes require &mut self (exclusive access enforced by the borrow checker)
// - Reads through &self are bounds-checked volatile loads
// - ptr, size and the file are immutable after construction
unsafe impl Sync for MappedRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0_u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn rejects_unaligned_offset() {
        let file = scratch_file(PAGE_SIZE);
        let err = MappedRegion::open(file.path(), 12, 64).unwrap_err();
        assert!(matches!(err, AccelError::RegisterAccess { .. }));
    }

    #[test]
    fn missing_device_is_not_found() {
        let err = MappedRegion::open("/nonexistent/udmabuf9", 0, PAGE_SIZE).unwrap_err();
        assert!(matches!(err, AccelError::DeviceNotFound { .. }));
    }

    #[test]
    fn file_backed_register_round_trip() {
        let file = scratch_file(PAGE_SIZE);
        let mut region = MappedRegion::open(file.path(), 0, PAGE_SIZE).unwrap();
        region.write_u32(0x40, 0xdead_beef).unwrap();
        assert_eq!(region.read_u32(0x40).unwrap(), 0xdead_beef);
        assert!(region.read_u32(PAGE_SIZE).is_err());
        assert!(region.write_u32(0x42, 1).is_err());
    }

    #[test]
    #[ignore] // Requires hardware
    fn control_block_reads_idle() {
        use yolo2_chip::{regs, window};
        let region = MappedRegion::physical(window::control::BASE, window::control::SIZE).unwrap();
        let status = region.read_u32(regs::AP_CTRL).unwrap();
        assert_ne!(status & regs::ap_ctrl::IDLE, 0);
    }
}
