//! Control jobs: one register program per layer dispatch.
//!
//! A [`ControlJob`] is everything the control block needs to run one layer:
//! four DDR addresses, the tiling from [`crate::geometry`], the activation
//! flags and four Q values. It is immutable once built and is checked
//! against the hardware maxima by [`ControlJob::validate`] before any
//! register is written. The silicon performs no checking of its own; an
//! out-of-range loop bound hangs the datapath.

use crate::geometry::{LayerType, LoopBounds, TileGeometry};
use crate::limits::{
    MAX_BETA_LENGTH, MAX_CHANNELS, MAX_DIM, MAX_KSIZE, MAX_KSTRIDE, MAX_PADDING, MAX_TC, MAX_TM,
    MAX_TN, MAX_TR,
};
use thiserror::Error;

/// A job parameter the hardware cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    /// Parameter outside its supported range.
    #[error("{param} = {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Parameter name.
        param: &'static str,
        /// Offending value.
        value: usize,
        /// Inclusive minimum.
        min: usize,
        /// Inclusive maximum.
        max: usize,
    },

    /// Parameter disagrees with the value derived from the rest of the job.
    #[error("{param} = {value}, expected {expected}")]
    Inconsistent {
        /// Parameter name.
        param: &'static str,
        /// Offending value.
        value: usize,
        /// Derived value.
        expected: usize,
    },

    /// Shape that cannot be tiled at all.
    #[error("degenerate layer: {reason}")]
    Degenerate {
        /// Description.
        reason: String,
    },
}

impl Violation {
    /// Create a degenerate-shape violation.
    pub fn degenerate(reason: impl Into<String>) -> Self {
        Self::Degenerate {
            reason: reason.into(),
        }
    }
}

/// Physical DDR addresses of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferAddrs {
    /// Input feature map.
    pub input: u64,
    /// Output feature map.
    pub output: u64,
    /// First weight of this layer.
    pub weight: u64,
    /// First bias of this layer.
    pub bias: u64,
}

/// Binary-point positions for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QValues {
    /// Weights.
    pub weight: i32,
    /// Incoming activations.
    pub act_in: i32,
    /// Outgoing activations.
    pub act_out: i32,
    /// Bias.
    pub bias: i32,
}

impl QValues {
    /// All formats at `q`.
    #[must_use]
    pub const fn uniform(q: i32) -> Self {
        Self {
            weight: q,
            act_in: q,
            act_out: q,
            bias: q,
        }
    }

    /// True when any format is non-zero; the GPIO block is only written then.
    #[must_use]
    pub const fn any_nonzero(&self) -> bool {
        self.weight != 0 || self.act_in != 0 || self.act_out != 0 || self.bias != 0
    }

    /// Format of a raw product `weight × activation`.
    #[must_use]
    pub const fn product(&self) -> i32 {
        self.weight + self.act_in
    }
}

/// One layer dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlJob {
    /// DDR addresses.
    pub addrs: BufferAddrs,
    /// Tiling and shape.
    pub geometry: TileGeometry,
    /// Apply the leaky rectifier on write-back.
    pub leaky: bool,
    /// Batch-norm folded into weights and bias.
    pub batch_norm: bool,
    /// Q formats.
    pub q: QValues,
}

impl ControlJob {
    /// Job for a convolution.
    #[must_use]
    pub const fn conv(geometry: TileGeometry, addrs: BufferAddrs, leaky: bool, batch_norm: bool, q: QValues) -> Self {
        Self {
            addrs,
            geometry,
            leaky,
            batch_norm,
            q,
        }
    }

    /// Job for a max-pool or reorg; these carry no weights and keep the Q
    /// of their input.
    #[must_use]
    pub const fn data_movement(geometry: TileGeometry, input: u64, output: u64) -> Self {
        Self {
            addrs: BufferAddrs {
                input,
                output,
                weight: 0,
                bias: 0,
            },
            geometry,
            leaky: false,
            batch_norm: false,
            q: QValues::uniform(0),
        }
    }

    /// Layer kind.
    #[must_use]
    pub const fn kind(&self) -> LayerType {
        self.geometry.kind
    }

    /// Check every parameter against the hardware maxima.
    ///
    /// # Errors
    ///
    /// Returns the first [`Violation`] found.
    pub fn validate(&self) -> Result<(), Violation> {
        let g = &self.geometry;

        check_range("ifm", g.in_channels, 1, MAX_CHANNELS)?;
        check_range("ofm", g.out_channels, 1, MAX_CHANNELS)?;
        check_range("ksize", g.ksize, 1, MAX_KSIZE)?;
        check_range("kstride", g.kstride, 1, MAX_KSTRIDE)?;
        check_range("in_w", g.in_w, 1, MAX_DIM)?;
        check_range("in_h", g.in_h, 1, MAX_DIM)?;
        check_range("out_w", g.out_w, 1, MAX_DIM)?;
        check_range("out_h", g.out_h, 1, MAX_DIM)?;
        check_range("padding", g.padding, 0, MAX_PADDING)?;
        check_range("tr", g.tr, 1, MAX_TR)?;
        check_range("tc", g.tc, 1, MAX_TC)?;

        match g.kind {
            LayerType::Conv => {
                check_range("tm", g.tm, 1, MAX_TM)?;
                check_range("tn", g.tn, 1, MAX_TN)?;
                check_range("ofm", g.out_channels, 1, MAX_BETA_LENGTH)?;
                check_eq("out_w", g.out_w, (g.in_w + 2 * g.padding).saturating_sub(g.ksize) / g.kstride + 1)?;
                check_eq("out_h", g.out_h, (g.in_h + 2 * g.padding).saturating_sub(g.ksize) / g.kstride + 1)?;
            }
            LayerType::Pool => {
                // The pool datapath walks MAX_TN channels per tile.
                check_range("tm", g.tm, 1, MAX_TN)?;
                check_range("tn", g.tn, 0, MAX_TN)?;
                check_eq("ofm", g.out_channels, g.in_channels)?;
                check_eq("padding", g.padding, 0)?;
                check_eq("out_w", g.out_w, g.in_w.saturating_sub(g.ksize) / g.kstride + 1)?;
                check_eq("out_h", g.out_h, g.in_h.saturating_sub(g.ksize) / g.kstride + 1)?;
            }
            LayerType::Reorg => {
                check_range("tm", g.tm, 1, MAX_TN.min(MAX_TM / 4))?;
                check_range("tn", g.tn, 0, MAX_TN)?;
                check_eq("ksize", g.ksize, 2)?;
                check_eq("kstride", g.kstride, 2)?;
                check_eq("ofm", g.out_channels, g.in_channels * 4)?;
                check_eq("out_w", g.out_w, g.in_w / 2)?;
                check_eq("out_h", g.out_h, g.in_h / 2)?;
            }
        }

        let expected = LoopBounds::new(g.kind, g.m_channels(), g.tm);
        check_eq("ofm_bound", g.bounds.ofm_bound, expected.ofm_bound)?;
        check_eq("mloops_x_tm", g.bounds.mloops_x_tm, expected.mloops_x_tm)?;
        check_eq("mloops_a1_x_tm", g.bounds.mloops_a1_x_tm, expected.mloops_a1_x_tm)?;

        Ok(())
    }
}

fn check_range(param: &'static str, value: usize, min: usize, max: usize) -> Result<(), Violation> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Violation::OutOfRange { param, value, min, max })
    }
}

fn check_eq(param: &'static str, value: usize, expected: usize) -> Result<(), Violation> {
    if value == expected {
        Ok(())
    } else {
        Err(Violation::Inconsistent { param, value, expected })
    }
}
