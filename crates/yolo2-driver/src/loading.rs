//! Parameter upload into DMA memory
//!
//! Weights and biases are read once from disk into a [`ParamBlob`] and
//! copied into a device-visible buffer in chunks, then verified by
//! checksum and flushed so the datapath sees them.

use crate::dma::{BufferAllocator, DmaBuffer};
use crate::error::{AccelError, Result};
use bytemuck::Pod;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Copy granularity of an upload.
pub const UPLOAD_CHUNK: usize = 1 << 20;

/// A parameter image ready for upload
#[derive(Debug, Clone)]
pub struct ParamBlob {
    /// Raw little-endian bytes (cheaply cloneable).
    pub data: Bytes,
    /// Wrapping byte sum.
    pub checksum: u32,
}

impl ParamBlob {
    /// Wrap raw bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = checksum(&data);
        debug!("Parameter blob: {} bytes, checksum {checksum:#010x}", data.len());
        Self { data, checksum }
    }

    /// Blob holding a typed slice.
    pub fn from_slice<T: Pod>(values: &[T]) -> Self {
        Self::new(Bytes::copy_from_slice(bytemuck::cast_slice(values)))
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an empty blob.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Upload statistics
#[derive(Debug, Clone, PartialEq)]
pub struct LoadMetrics {
    /// Bytes copied.
    pub bytes_transferred: usize,
    /// Chunks copied.
    pub chunks_transferred: usize,
    /// Wall time.
    pub duration: Duration,
    /// Throughput in MB/s.
    pub throughput_mbps: f64,
}

/// Allocate a buffer for `blob`, copy it in and flush it.
///
/// # Errors
///
/// Returns error if allocation fails or the read-back checksum differs.
pub fn upload(allocator: &mut dyn BufferAllocator, blob: &ParamBlob) -> Result<(DmaBuffer, LoadMetrics)> {
    let mut buffer = allocator.allocate(blob.len())?;
    let metrics = upload_into(allocator, &mut buffer, 0, blob)?;
    Ok((buffer, metrics))
}

/// Copy `blob` into `buffer` at byte `offset`, verify and flush it.
///
/// # Errors
///
/// Returns error if the blob does not fit or the read-back checksum differs.
pub fn upload_into(
    allocator: &dyn BufferAllocator,
    buffer: &mut DmaBuffer,
    offset: usize,
    blob: &ParamBlob,
) -> Result<LoadMetrics> {
    let end = offset
        .checked_add(blob.len())
        .filter(|&end| end <= buffer.len())
        .ok_or_else(|| {
            AccelError::allocation_failed(
                blob.len(),
                format!("blob does not fit at offset {offset} of a {} byte buffer", buffer.len()),
            )
        })?;

    let started = Instant::now();
    let target = &mut buffer.as_bytes_mut()[offset..end];
    let mut chunks = 0;
    for (dst, src) in target.chunks_mut(UPLOAD_CHUNK).zip(blob.data.chunks(UPLOAD_CHUNK)) {
        dst.copy_from_slice(src);
        chunks += 1;
    }

    let readback = checksum(&buffer.as_bytes()[offset..end]);
    if readback != blob.checksum {
        return Err(AccelError::invalid_state(format!(
            "upload checksum mismatch: wrote {:#010x}, read {readback:#010x}",
            blob.checksum
        )));
    }
    allocator.flush(buffer, offset, blob.len())?;

    let duration = started.elapsed();
    let metrics = LoadMetrics {
        bytes_transferred: blob.len(),
        chunks_transferred: chunks,
        duration,
        throughput_mbps: calculate_throughput(blob.len(), duration.as_secs_f64()),
    };
    info!(
        "Uploaded {} bytes in {chunks} chunks ({:.1} MB/s) @ {:#x}",
        metrics.bytes_transferred,
        metrics.throughput_mbps,
        buffer.phys_addr() + offset as u64
    );
    Ok(metrics)
}

/// Wrapping byte sum.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0_u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

fn calculate_throughput(bytes: usize, seconds: f64) -> f64 {
    if seconds == 0.0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let megabytes = bytes as f64 / 1_048_576.0;
    megabytes / seconds
}
