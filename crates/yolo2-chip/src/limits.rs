//! Fixed on-chip capacities of the accelerator.
//!
//! These values size every tile buffer in the datapath. A job that asks for
//! more than any of them is rejected before it reaches the device, since the
//! hardware does not check and will hang on an out-of-range loop bound.
//!
//! ```text
//! Buffer            Shape                         Elements
//! ───────────────── ───────────────────────────── ────────
//! input tile        MAX_TN × IB_HEIGHT × IB_WIDTH   11 236
//! weight tile       MAX_TM × MAX_TN × K × K          1 152
//! output tile       MAX_TM × MAX_TR × MAX_TC        21 632
//! bias              MAX_BETA_LENGTH                  1 024
//! ```

// ── Tile maxima ──────────────────────────────────────────────────────────────

/// Output channels per tile.
pub const MAX_TM: usize = 32;
/// Input channels per tile.
pub const MAX_TN: usize = 4;
/// Output rows per tile.
pub const MAX_TR: usize = 26;
/// Output columns per tile.
pub const MAX_TC: usize = 26;

// ── Kernel maxima ────────────────────────────────────────────────────────────

/// Largest supported square kernel.
pub const MAX_KSIZE: usize = 3;
/// Largest supported stride.
pub const MAX_KSTRIDE: usize = 2;
/// Largest supported zero padding.
pub const MAX_PADDING: usize = 4;

// ── On-chip line buffer ──────────────────────────────────────────────────────

/// Input tile height: enough rows to produce `MAX_TR` outputs at the worst
/// stride/kernel combination.
pub const ONCHIP_IB_HEIGHT: usize = (MAX_TR - 1) * MAX_KSTRIDE + MAX_KSIZE;
/// Input tile width.
pub const ONCHIP_IB_WIDTH: usize = (MAX_TC - 1) * MAX_KSTRIDE + MAX_KSIZE;

/// Bias buffer length; bounds the output channel count of a convolution.
pub const MAX_BETA_LENGTH: usize = 1024;

// ── Layer maxima ─────────────────────────────────────────────────────────────

/// Channel count accepted by the control block.
pub const MAX_CHANNELS: usize = 2048;
/// Spatial extent accepted by the control block.
pub const MAX_DIM: usize = 1024;

// ── DDR layout ───────────────────────────────────────────────────────────────

/// Feature-map rows are padded to one 256-bit beat of 16-bit elements.
pub const ROW_ALIGN: usize = 8;

/// Round a row width up to the DDR beat.
#[must_use]
pub const fn align8(width: usize) -> usize {
    (width + ROW_ALIGN - 1) & !(ROW_ALIGN - 1)
}

/// Element count of a `[c][h][align8(w)]` feature map.
#[must_use]
pub const fn footprint(c: usize, h: usize, w: usize) -> usize {
    c * h * align8(w)
}
