//! On-chip tile storage of the software model.
//!
//! Each buffer is sized for the hardware maxima and indexed the way the
//! datapath indexes its BRAM arrays. Input, weight and output tiles exist
//! twice so one copy can be filled while the other is consumed.

use yolo2_chip::limits::{
    MAX_BETA_LENGTH, MAX_KSIZE, MAX_TC, MAX_TM, MAX_TN, MAX_TR, ONCHIP_IB_HEIGHT, ONCHIP_IB_WIDTH,
};
use yolo2_chip::Precision;

/// Elements in one input tile.
pub const INPUT_TILE: usize = MAX_TN * ONCHIP_IB_HEIGHT * ONCHIP_IB_WIDTH;
/// Elements in one weight tile.
pub const WEIGHT_TILE: usize = MAX_TM * MAX_TN * MAX_KSIZE * MAX_KSIZE;
/// Elements in one output tile.
pub const OUTPUT_TILE: usize = MAX_TM * MAX_TR * MAX_TC;

/// `input[lane][row][col]`
#[inline]
pub const fn in_idx(lane: usize, row: usize, col: usize) -> usize {
    (lane * ONCHIP_IB_HEIGHT + row) * ONCHIP_IB_WIDTH + col
}

/// `weight[tm][tn][i][j]`
#[inline]
pub const fn w_idx(tm: usize, tn: usize, i: usize, j: usize) -> usize {
    ((tm * MAX_TN + tn) * MAX_KSIZE + i) * MAX_KSIZE + j
}

/// `output[ch][row][col]`
#[inline]
pub const fn out_idx(ch: usize, row: usize, col: usize) -> usize {
    (ch * MAX_TR + row) * MAX_TC + col
}

/// Ping-pong tile buffers and the bias buffer
#[derive(Debug)]
pub struct TileBuffers<P: Precision> {
    /// Input tiles.
    pub input: [Vec<P::Elem>; 2],
    /// Weight tiles.
    pub weight: [Vec<P::Elem>; 2],
    /// Output tiles, held at accumulator width until write-back.
    pub output: [Vec<P::Acc>; 2],
    /// Per-layer bias.
    pub bias: Vec<P::Elem>,
}

impl<P: Precision> TileBuffers<P> {
    /// Allocate zeroed buffers at the hardware maxima.
    pub fn new() -> Self {
        Self {
            input: [vec![P::Elem::default(); INPUT_TILE], vec![P::Elem::default(); INPUT_TILE]],
            weight: [vec![P::Elem::default(); WEIGHT_TILE], vec![P::Elem::default(); WEIGHT_TILE]],
            output: [vec![P::ZERO; OUTPUT_TILE], vec![P::ZERO; OUTPUT_TILE]],
            bias: vec![P::Elem::default(); MAX_BETA_LENGTH],
        }
    }
}

impl<P: Precision> Default for TileBuffers<P> {
    fn default() -> Self {
        Self::new()
    }
}
