//! Tile geometry and pipeline loop bounds.
//!
//! Every layer is cut into spatial tiles of `TR × TC` output pixels and
//! channel tiles of `TM` outputs (`TN` inputs for convolution). Inside one
//! spatial tile the device walks the channel tiles as a software pipeline:
//!
//! ```text
//! Conv  (2 stages)   m = 0 .. (mLoops+1)·TM      LOAD+COMPUTE | STORE
//! Pool  (3 stages)   m = 0 .. (mLoops+2)·TM      LOAD | PROCESS | STORE
//! Reorg (3 stages)   m = 0 .. (mLoops+2)·TM      LOAD | PROCESS | STORE
//! ```
//!
//! The extra iterations drain the later stages. The three loop-bound
//! integers programmed into the control block exist only to generate the
//! per-iteration enable flags, see [`PipelineFlags`].

use crate::job::Violation;
use crate::limits::{
    MAX_KSTRIDE, MAX_TC, MAX_TM, MAX_TN, MAX_TR, ONCHIP_IB_HEIGHT, ONCHIP_IB_WIDTH,
};
use std::fmt;

/// Layer-kind tag understood by the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LayerType {
    /// Convolution with bias, optional leaky activation.
    Conv = 0,
    /// Max-pool.
    Pool = 1,
    /// 2×2 space-to-depth.
    Reorg = 2,
}

impl LayerType {
    /// Raw tag for the `LAYERTYPE` register.
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Decode a raw tag.
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Conv),
            1 => Some(Self::Pool),
            2 => Some(Self::Reorg),
            _ => None,
        }
    }

    /// Number of pipeline stages the datapath runs for this kind.
    #[must_use]
    pub const fn stages(self) -> usize {
        match self {
            Self::Conv => 2,
            Self::Pool | Self::Reorg => 3,
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Conv => "conv",
            Self::Pool => "maxpool",
            Self::Reorg => "reorg",
        })
    }
}

/// The three derived loop bounds programmed alongside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopBounds {
    /// Exclusive upper bound of the channel-tile loop.
    pub ofm_bound: usize,
    /// `mLoops · TM`: first iteration with no real tile left to load.
    pub mloops_x_tm: usize,
    /// `(mLoops + 1) · TM`.
    pub mloops_a1_x_tm: usize,
}

impl LoopBounds {
    /// Bounds for walking `channels` in tiles of `tm`.
    ///
    /// `tm` must be non-zero.
    #[must_use]
    pub const fn new(kind: LayerType, channels: usize, tm: usize) -> Self {
        let m_loops = channels.div_ceil(tm);
        let drain = kind.stages() - 1;
        Self {
            ofm_bound: (m_loops + drain) * tm,
            mloops_x_tm: m_loops * tm,
            mloops_a1_x_tm: (m_loops + 1) * tm,
        }
    }

    /// Number of real channel tiles.
    #[must_use]
    pub const fn m_loops(&self, tm: usize) -> usize {
        self.mloops_x_tm / tm
    }

    /// Channel-loop iterations per spatial tile, drain included.
    #[must_use]
    pub const fn iterations(&self, tm: usize) -> usize {
        self.ofm_bound / tm
    }
}

/// Stage enables for one channel-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineFlags {
    /// LOAD runs (for convolution also COMPUTE).
    pub input: bool,
    /// PROCESS runs (pool and reorg).
    pub process: bool,
    /// STORE runs.
    pub write: bool,
}

impl PipelineFlags {
    /// Flags at channel offset `m`, exactly as the datapath derives them.
    #[must_use]
    pub fn at(kind: LayerType, m: usize, tm: usize, bounds: &LoopBounds) -> Self {
        let m_ne_0 = m != 0;
        let m_ne_1 = m != tm;
        let m_ne_mloops = m != bounds.mloops_x_tm;
        let m_ne_mloops_a1 = m != bounds.mloops_a1_x_tm;

        match kind {
            LayerType::Conv => Self {
                input: m_ne_mloops,
                process: m_ne_mloops,
                write: m_ne_0,
            },
            LayerType::Pool | LayerType::Reorg => Self {
                input: m_ne_mloops && m_ne_mloops_a1,
                process: m_ne_0 && m_ne_mloops_a1,
                write: m_ne_0 && m_ne_1,
            },
        }
    }
}

/// Complete tiling of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    /// Layer kind.
    pub kind: LayerType,
    /// Input feature maps.
    pub in_channels: usize,
    /// Output feature maps.
    pub out_channels: usize,
    /// Input width.
    pub in_w: usize,
    /// Input height.
    pub in_h: usize,
    /// Output width.
    pub out_w: usize,
    /// Output height.
    pub out_h: usize,
    /// Square kernel size.
    pub ksize: usize,
    /// Stride.
    pub kstride: usize,
    /// Zero padding (convolution only).
    pub padding: usize,
    /// Channel tile of the m loop.
    pub tm: usize,
    /// Input channel tile (0 for pool and reorg).
    pub tn: usize,
    /// Output rows per tile.
    pub tr: usize,
    /// Output columns per tile.
    pub tc: usize,
    /// Derived loop bounds.
    pub bounds: LoopBounds,
}

/// Output extent of a convolution window sweep.
///
/// # Errors
///
/// Returns [`Violation::Degenerate`] if the stride is zero or the kernel does
/// not fit inside the padded input.
pub fn conv_output_dim(input: usize, ksize: usize, stride: usize, pad: usize) -> Result<usize, Violation> {
    if stride == 0 || ksize == 0 {
        return Err(Violation::degenerate(format!(
            "kernel {ksize} / stride {stride} must be non-zero"
        )));
    }
    let padded = input + 2 * pad;
    if padded < ksize {
        return Err(Violation::degenerate(format!(
            "kernel {ksize} larger than padded input {padded}"
        )));
    }
    Ok((padded - ksize) / stride + 1)
}

/// Rows (or columns) of output a tile can hold given the line buffer.
#[must_use]
pub fn tile_extent(buffer: usize, max_tile: usize, ksize: usize, stride: usize, out: usize) -> usize {
    let by_buffer = buffer.saturating_sub(ksize) / stride.max(1) + 1;
    by_buffer.min(max_tile).min(out)
}

/// Tiling of a convolution.
///
/// # Errors
///
/// Returns a [`Violation`] if the shape is degenerate.
pub fn conv_geometry(
    ifm: usize,
    ofm: usize,
    in_w: usize,
    in_h: usize,
    ksize: usize,
    kstride: usize,
    padding: usize,
) -> Result<TileGeometry, Violation> {
    if ifm == 0 || ofm == 0 {
        return Err(Violation::degenerate("convolution needs channels"));
    }
    let out_w = conv_output_dim(in_w, ksize, kstride, padding)?;
    let out_h = conv_output_dim(in_h, ksize, kstride, padding)?;
    let tm = ofm.min(MAX_TM);
    let tn = ifm.min(MAX_TN);

    Ok(TileGeometry {
        kind: LayerType::Conv,
        in_channels: ifm,
        out_channels: ofm,
        in_w,
        in_h,
        out_w,
        out_h,
        ksize,
        kstride,
        padding,
        tm,
        tn,
        tr: tile_extent(ONCHIP_IB_HEIGHT, MAX_TR, ksize, kstride, out_h),
        tc: tile_extent(ONCHIP_IB_WIDTH, MAX_TC, ksize, kstride, out_w),
        bounds: LoopBounds::new(LayerType::Conv, ofm, tm),
    })
}

/// Tiling of a max-pool. The pool datapath applies no padding.
///
/// # Errors
///
/// Returns a [`Violation`] if the shape is degenerate.
pub fn pool_geometry(
    channels: usize,
    in_w: usize,
    in_h: usize,
    ksize: usize,
    kstride: usize,
) -> Result<TileGeometry, Violation> {
    if channels == 0 {
        return Err(Violation::degenerate("max-pool needs channels"));
    }
    let out_w = conv_output_dim(in_w, ksize, kstride, 0)?;
    let out_h = conv_output_dim(in_h, ksize, kstride, 0)?;
    let tm = MAX_TM.min(MAX_TN).min(channels);

    Ok(TileGeometry {
        kind: LayerType::Pool,
        in_channels: channels,
        out_channels: channels,
        in_w,
        in_h,
        out_w,
        out_h,
        ksize,
        kstride,
        padding: 0,
        tm,
        tn: 0,
        tr: tile_extent(ONCHIP_IB_HEIGHT, MAX_TR, ksize, kstride, out_h),
        tc: tile_extent(ONCHIP_IB_WIDTH, MAX_TC, ksize, kstride, out_w),
        bounds: LoopBounds::new(LayerType::Pool, channels, tm),
    })
}

/// Tiling of a stride-2 space-to-depth. `tm` counts input channels per
/// group; each group produces `4·tm` output channels.
///
/// # Errors
///
/// Returns a [`Violation`] if the shape is degenerate.
pub fn reorg_geometry(channels: usize, in_w: usize, in_h: usize) -> Result<TileGeometry, Violation> {
    const STRIDE: usize = MAX_KSTRIDE;
    if channels == 0 {
        return Err(Violation::degenerate("reorg needs channels"));
    }
    if in_w % STRIDE != 0 || in_h % STRIDE != 0 {
        return Err(Violation::degenerate(format!(
            "reorg input {in_w}x{in_h} not divisible by {STRIDE}"
        )));
    }
    let out_w = in_w / STRIDE;
    let out_h = in_h / STRIDE;
    let tm = (MAX_TM / (STRIDE * STRIDE)).min(MAX_TN).min(channels);

    Ok(TileGeometry {
        kind: LayerType::Reorg,
        in_channels: channels,
        out_channels: channels * STRIDE * STRIDE,
        in_w,
        in_h,
        out_w,
        out_h,
        ksize: STRIDE,
        kstride: STRIDE,
        padding: 0,
        tm,
        tn: 0,
        tr: tile_extent(ONCHIP_IB_HEIGHT, MAX_TR, STRIDE, STRIDE, out_h),
        tc: tile_extent(ONCHIP_IB_WIDTH, MAX_TC, STRIDE, STRIDE, out_w),
        bounds: LoopBounds::new(LayerType::Reorg, channels, tm),
    })
}

impl TileGeometry {
    /// Channels walked by the m loop: outputs for convolution, inputs
    /// otherwise.
    #[must_use]
    pub const fn m_channels(&self) -> usize {
        match self.kind {
            LayerType::Conv => self.out_channels,
            LayerType::Pool | LayerType::Reorg => self.in_channels,
        }
    }

    /// Real channel tiles.
    #[must_use]
    pub const fn m_loops(&self) -> usize {
        self.bounds.m_loops(self.tm)
    }

    /// Spatial tiles over the output plane.
    #[must_use]
    pub const fn spatial_tiles(&self) -> usize {
        self.out_h.div_ceil(self.tr) * self.out_w.div_ceil(self.tc)
    }

    /// Input rows fetched per tile.
    #[must_use]
    pub const fn tile_rows(&self) -> usize {
        (self.tr - 1) * self.kstride + self.ksize
    }

    /// Input columns fetched per tile.
    #[must_use]
    pub const fn tile_cols(&self) -> usize {
        (self.tc - 1) * self.kstride + self.ksize
    }

    /// Weight elements consumed by a convolution.
    #[must_use]
    pub const fn weight_count(&self) -> usize {
        match self.kind {
            LayerType::Conv => self.in_channels * self.out_channels * self.ksize * self.ksize,
            LayerType::Pool | LayerType::Reorg => 0,
        }
    }

    /// Pipeline flags at channel offset `m`.
    #[must_use]
    pub fn flags(&self, m: usize) -> PipelineFlags {
        PipelineFlags::at(self.kind, m, self.tm, &self.bounds)
    }
}

impl fmt::Display for TileGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<7} {:>4}x{:<4}x{:>4} -> {:>4}x{:<4}x{:>4}  k{}/s{}/p{}  TM={} TN={} TR={} TC={}  bounds=({}, {}, {})",
            self.kind,
            self.in_w,
            self.in_h,
            self.in_channels,
            self.out_w,
            self.out_h,
            self.out_channels,
            self.ksize,
            self.kstride,
            self.padding,
            self.tm,
            self.tn,
            self.tr,
            self.tc,
            self.bounds.ofm_bound,
            self.bounds.mloops_x_tm,
            self.bounds.mloops_a1_x_tm,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_output_dims() {
        assert_eq!(conv_output_dim(416, 3, 1, 1).unwrap(), 416);
        assert_eq!(conv_output_dim(8, 3, 1, 1).unwrap(), 8);
        assert_eq!(conv_output_dim(13, 1, 1, 0).unwrap(), 13);
        assert_eq!(conv_output_dim(416, 2, 2, 0).unwrap(), 208);
        assert!(conv_output_dim(1, 3, 1, 0).is_err());
        assert!(conv_output_dim(8, 3, 0, 1).is_err());
    }

    #[test]
    fn first_yolo_layer_tiles() {
        let g = conv_geometry(3, 32, 416, 416, 3, 1, 1).unwrap();
        assert_eq!((g.tm, g.tn, g.tr, g.tc), (32, 3, 26, 26));
        assert_eq!(g.m_loops(), 1);
        assert_eq!(g.bounds, LoopBounds { ofm_bound: 64, mloops_x_tm: 32, mloops_a1_x_tm: 64 });
        assert_eq!(g.spatial_tiles(), 16 * 16);
        assert_eq!(g.tile_rows(), 28);
    }

    #[test]
    fn conv_bounds_with_remainder() {
        let g = conv_geometry(64, 40, 13, 13, 1, 1, 0).unwrap();
        assert_eq!(g.tm, 32);
        assert_eq!(g.m_loops(), 2);
        assert_eq!(g.bounds, LoopBounds { ofm_bound: 96, mloops_x_tm: 64, mloops_a1_x_tm: 96 });
        assert_eq!(g.bounds.iterations(g.tm), 3);
    }

    #[test]
    fn pool_uses_three_stage_bounds() {
        let g = pool_geometry(32, 416, 416, 2, 2).unwrap();
        assert_eq!((g.out_w, g.out_h), (208, 208));
        assert_eq!((g.tm, g.tn), (4, 0));
        assert_eq!(g.m_loops(), 8);
        assert_eq!(g.bounds, LoopBounds { ofm_bound: 40, mloops_x_tm: 32, mloops_a1_x_tm: 36 });
        assert_eq!(g.tr, 26);
    }

    #[test]
    fn reorg_quadruples_channels() {
        let g = reorg_geometry(64, 26, 26).unwrap();
        assert_eq!((g.out_w, g.out_h, g.out_channels), (13, 13, 256));
        assert_eq!(g.tm, 4);
        assert_eq!(g.m_loops(), 16);
        assert_eq!(g.tr, 13);
        assert!(reorg_geometry(64, 13, 13).is_err());
    }

    #[test]
    fn tile_extent_clamps_to_output() {
        assert_eq!(tile_extent(ONCHIP_IB_HEIGHT, MAX_TR, 3, 1, 416), 26);
        assert_eq!(tile_extent(ONCHIP_IB_HEIGHT, MAX_TR, 3, 2, 416), 26);
        assert_eq!(tile_extent(ONCHIP_IB_HEIGHT, MAX_TR, 3, 1, 13), 13);
    }

    #[test]
    fn conv_flags_have_one_drain_iteration() {
        let g = conv_geometry(4, 64, 13, 13, 1, 1, 0).unwrap();
        let flags: Vec<_> = (0..g.bounds.ofm_bound).step_by(g.tm).map(|m| g.flags(m)).collect();
        assert_eq!(flags.len(), 3);
        assert!(flags[0].input && !flags[0].write);
        assert!(flags[1].input && flags[1].write);
        assert!(!flags[2].input && flags[2].write);
    }

    #[test]
    fn pool_flags_fill_and_drain() {
        let g = pool_geometry(8, 26, 26, 2, 2).unwrap();
        let flags: Vec<_> = (0..g.bounds.ofm_bound).step_by(g.tm).map(|m| g.flags(m)).collect();
        // two real tiles, two drain iterations
        assert_eq!(flags.len(), 4);
        let pattern: Vec<_> = flags.iter().map(|f| (f.input, f.process, f.write)).collect();
        assert_eq!(
            pattern,
            vec![
                (true, false, false),
                (true, true, false),
                (false, true, true),
                (false, false, true),
            ]
        );
    }

    #[test]
    fn layer_type_tags_round_trip() {
        for kind in [LayerType::Conv, LayerType::Pool, LayerType::Reorg] {
            assert_eq!(LayerType::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(LayerType::from_tag(7), None);
    }
}
