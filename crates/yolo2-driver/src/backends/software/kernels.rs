//! Tile compute kernels: convolution MAC, max-pool window, space-to-depth.

use super::buffers::{in_idx, out_idx, w_idx};
use yolo2_chip::limits::MAX_TN;
use yolo2_chip::{Precision, QValues, TileGeometry};

/// Extent of one tile clipped to the output plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileExtent {
    /// Output rows.
    pub rows: usize,
    /// Output columns.
    pub cols: usize,
}

impl TileExtent {
    /// Extent of the tile at output origin `(r, c)`.
    pub fn at(g: &TileGeometry, r: usize, c: usize) -> Self {
        Self {
            rows: g.tr.min(g.out_h - r),
            cols: g.tc.min(g.out_w - c),
        }
    }
}

/// Accumulate one `(m, n)` weight/input tile pair into the output tile.
///
/// Every kernel tap is summed over all `MAX_TN` input lanes at product
/// precision, moved to the output format, then added to the running sum.
/// On the very first tap of a channel tile (`first_group` and `i = j = 0`)
/// the running sum starts from the bias instead of the tile contents.
#[allow(clippy::too_many_arguments)]
pub fn conv_tile<P: Precision>(
    out: &mut [P::Acc],
    input: &[P::Elem],
    weights: &[P::Elem],
    bias: &[P::Elem],
    g: &TileGeometry,
    m: usize,
    tm_min: usize,
    extent: TileExtent,
    q: &QValues,
    first_group: bool,
) {
    let s = g.kstride;
    for i in 0..g.ksize {
        for j in 0..g.ksize {
            let seed = first_group && i == 0 && j == 0;
            for tr in 0..extent.rows {
                for tc in 0..extent.cols {
                    for tm in 0..tm_min {
                        let mut partial = P::ZERO;
                        for tn in 0..MAX_TN {
                            let w = weights[w_idx(tm, tn, i, j)];
                            let x = input[in_idx(tn, s * tr + i, s * tc + j)];
                            partial = partial + P::mul(w, x);
                        }
                        let partial = P::rescale(partial, q.product(), q.act_out);

                        let slot = &mut out[out_idx(tm, tr, tc)];
                        let base = if seed {
                            P::rescale(P::widen(bias[m + tm]), q.bias, q.act_out)
                        } else {
                            *slot
                        };
                        *slot = base + partial;
                    }
                }
            }
        }
    }
}

/// Max over each `K × K` window, for every input lane.
pub fn pool_tile<P: Precision>(out: &mut [P::Acc], input: &[P::Elem], g: &TileGeometry, extent: TileExtent) {
    let (k, s) = (g.ksize, g.kstride);
    for lane in 0..MAX_TN {
        for tr in 0..extent.rows {
            for tc in 0..extent.cols {
                let mut best = P::POOL_SENTINEL;
                for i in 0..k {
                    for j in 0..k {
                        let v = input[in_idx(lane, s * tr + i, s * tc + j)];
                        if v > best {
                            best = v;
                        }
                    }
                }
                out[out_idx(lane, tr, tc)] = P::widen(best);
            }
        }
    }
}

/// Stride-2 space-to-depth: output channel `4·lane + 2·ky + kx` takes pixel
/// `(2y + ky, 2x + kx)` of input lane `lane`.
pub fn reorg_tile<P: Precision>(out: &mut [P::Acc], input: &[P::Elem], lanes: usize, extent: TileExtent) {
    for lane in 0..lanes {
        for ky in 0..2 {
            for kx in 0..2 {
                let ch = 4 * lane + 2 * ky + kx;
                for y in 0..extent.rows {
                    for x in 0..extent.cols {
                        out[out_idx(ch, y, x)] = P::widen(input[in_idx(lane, 2 * y + ky, 2 * x + kx)]);
                    }
                }
            }
        }
    }
}
