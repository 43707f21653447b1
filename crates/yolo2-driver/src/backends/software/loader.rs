//! DDR ↔ tile transfers.
//!
//! Feature maps live in DDR as `[channel][row][align8(width)]`. Input tiles
//! are fetched with the padding halo applied on the fly; output tiles are
//! written back one row at a time, as the datapath bursts them.

use super::buffers::{in_idx, out_idx, w_idx};
use yolo2_chip::limits::{align8, MAX_TM, MAX_TN};
use yolo2_chip::{Precision, TileGeometry};

/// Fill an input tile for channels `[chan, chan + lanes)` at output tile
/// origin `(r, c)`.
///
/// All `MAX_TN` lanes are written: lanes past `lanes`, and pixels outside
/// the input plane, receive `pad`.
#[allow(clippy::too_many_arguments, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn load_input<P: Precision>(
    tile: &mut [P::Elem],
    ddr: &[P::Elem],
    g: &TileGeometry,
    chan: usize,
    lanes: usize,
    r: usize,
    c: usize,
    pad: P::Elem,
) {
    let (h, w, wa) = (g.in_h, g.in_w, align8(g.in_w));
    let row0 = (r * g.kstride) as isize - g.padding as isize;
    let col0 = (c * g.kstride) as isize - g.padding as isize;
    let (rows, cols) = (g.tile_rows(), g.tile_cols());

    for lane in 0..MAX_TN {
        let enabled = lane < lanes;
        let plane = (chan + lane) * h * wa;
        for t2 in 0..rows {
            let row = row0 + t2 as isize;
            for t3 in 0..cols {
                let col = col0 + t3 as isize;
                let inside = enabled && row >= 0 && col >= 0 && (row as usize) < h && (col as usize) < w;
                tile[in_idx(lane, t2, t3)] = if inside {
                    ddr[plane + row as usize * wa + col as usize]
                } else {
                    pad
                };
            }
        }
    }
}

/// Fill a weight tile from the packed stream at `*cursor` and advance it.
///
/// The stream holds one `tm_min × tn_min × K × K` block per `(m, n)` tile
/// in `[i][j][tm][tn]` order; unused lanes of the tile are zeroed.
pub fn load_weights<P: Precision>(
    tile: &mut [P::Elem],
    ddr: &[P::Elem],
    cursor: &mut usize,
    ksize: usize,
    tm_min: usize,
    tn_min: usize,
) {
    let mut next = *cursor;
    for i in 0..ksize {
        for j in 0..ksize {
            for tm in 0..MAX_TM {
                for tn in 0..MAX_TN {
                    tile[w_idx(tm, tn, i, j)] = if tm < tm_min && tn < tn_min {
                        next += 1;
                        ddr[next - 1]
                    } else {
                        P::Elem::default()
                    };
                }
            }
        }
    }
    *cursor = next;
}

/// Copy a layer's bias into the on-chip bias buffer.
pub fn load_bias<P: Precision>(buffer: &mut [P::Elem], ddr: &[P::Elem]) {
    let n = ddr.len().min(buffer.len());
    buffer[..n].copy_from_slice(&ddr[..n]);
}

/// Write output tile channels `[0, count)` to DDR channels
/// `[chan, chan + count)` at output origin `(r, c)`.
///
/// Returns the number of row iterations the write-back pipeline ran
/// (`count · rows + 1`, one extra to drain the row double buffer).
#[allow(clippy::too_many_arguments)]
pub fn store_output<P: Precision>(
    ddr: &mut [P::Elem],
    tile: &[P::Acc],
    g: &TileGeometry,
    chan: usize,
    count: usize,
    r: usize,
    c: usize,
    leaky: bool,
) -> usize {
    let (oh, wa) = (g.out_h, align8(g.out_w));
    let tr_min = g.tr.min(g.out_h - r);
    let tc_min = g.tc.min(g.out_w - c);

    for ch in 0..count {
        for tr in 0..tr_min {
            let row = (chan + ch) * oh * wa + (r + tr) * wa + c;
            for tc in 0..tc_min {
                let acc = tile[out_idx(ch, tr, tc)];
                let acc = if leaky { P::leaky(acc) } else { acc };
                ddr[row + tc] = P::narrow(acc);
            }
        }
    }
    count * tr_min + 1
}
