//! Layer scheduler: walks the spatial tiles of one job and runs the
//! double-buffered channel pipeline inside each.
//!
//! ```text
//! Conv                       Pool / Reorg
//! ─────────────────────────  ──────────────────────────────
//! k: LOAD+COMPUTE → OUT[k%2]  k: LOAD      → IN[k%2]
//!    STORE  OUT[(k+1)%2]         PROCESS   IN[1-k%2] → OUT[1-k%2]
//!                                STORE     OUT[k%2]
//! ```
//!
//! Each stage is gated by [`yolo2_chip::PipelineFlags`]. Every buffer
//! carries a tag recording which channel tile it holds, so a later stage
//! stores exactly what an earlier one produced, drain iterations included.

use super::buffers::TileBuffers;
use super::kernels::{conv_tile, pool_tile, reorg_tile, TileExtent};
use super::loader::{load_bias, load_input, load_weights, store_output};
use yolo2_chip::{ControlJob, LayerType, Precision};

/// DDR views of one job, already resolved to host memory.
#[derive(Debug)]
pub struct LayerMemory<'a, E> {
    /// Input feature map.
    pub input: &'a [E],
    /// Output feature map.
    pub output: &'a mut [E],
    /// Packed weight stream (empty for pool and reorg).
    pub weights: &'a [E],
    /// Bias (empty for pool and reorg).
    pub bias: &'a [E],
}

/// Work counters for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Spatial tiles walked.
    pub spatial_tiles: usize,
    /// Channel-loop iterations, drain included.
    pub channel_iterations: usize,
    /// Input tile loads.
    pub loads: usize,
    /// Compute or process passes.
    pub computes: usize,
    /// Output tile stores.
    pub stores: usize,
    /// Input-group iterations of the convolution n loop.
    pub group_iterations: usize,
    /// Write-back row iterations.
    pub row_iterations: usize,
}

/// Which channel tile a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileTag {
    m: usize,
    count: usize,
}

#[derive(Debug, Default)]
struct SchedulerState {
    weight_cursor: usize,
    input_tags: [Option<TileTag>; 2],
    output_tags: [Option<TileTag>; 2],
}

/// Run one validated job to completion.
pub fn run_layer<P: Precision>(
    job: &ControlJob,
    mem: LayerMemory<'_, P::Elem>,
    bufs: &mut TileBuffers<P>,
) -> ScheduleStats {
    let g = &job.geometry;
    let mut stats = ScheduleStats::default();

    if g.kind == LayerType::Conv {
        load_bias::<P>(&mut bufs.bias, mem.bias);
    }

    for r in (0..g.out_h).step_by(g.tr) {
        for c in (0..g.out_w).step_by(g.tc) {
            stats.spatial_tiles += 1;
            let mut state = SchedulerState::default();
            let extent = TileExtent::at(g, r, c);

            for (k, m) in (0..g.bounds.ofm_bound).step_by(g.tm).enumerate() {
                stats.channel_iterations += 1;
                match g.kind {
                    LayerType::Conv => conv_step(job, &mem, bufs, &mut state, &mut stats, k, m, r, c, extent),
                    LayerType::Pool | LayerType::Reorg => {
                        data_step(job, &mem, bufs, &mut state, &mut stats, k, m, r, c, extent);
                    }
                }
                let cur = k % 2;
                if g.flags(m).write {
                    let slot = if g.kind == LayerType::Conv { 1 - cur } else { cur };
                    if let Some(tag) = state.output_tags[slot].take() {
                        let (chan, count) = match g.kind {
                            LayerType::Reorg => (4 * tag.m, 4 * tag.count),
                            LayerType::Conv | LayerType::Pool => (tag.m, tag.count),
                        };
                        stats.row_iterations += store_output::<P>(
                            mem.output,
                            &bufs.output[slot],
                            g,
                            chan,
                            count,
                            r,
                            c,
                            job.leaky,
                        );
                        stats.stores += 1;
                    }
                }
            }
        }
    }

    tracing::trace!("{} layer done: {stats:?}", g.kind);
    stats
}

/// LOAD+COMPUTE stage of a convolution: the full input-channel loop for
/// output tile `m`, itself double buffered over `n`.
#[allow(clippy::too_many_arguments)]
fn conv_step<P: Precision>(
    job: &ControlJob,
    mem: &LayerMemory<'_, P::Elem>,
    bufs: &mut TileBuffers<P>,
    state: &mut SchedulerState,
    stats: &mut ScheduleStats,
    k: usize,
    m: usize,
    r: usize,
    c: usize,
    extent: TileExtent,
) {
    let g = &job.geometry;
    if !g.flags(m).input {
        return;
    }
    let slot = k % 2;
    let tm_min = g.tm.min(g.out_channels - m);

    let mut pp = 0;
    let mut prev_n = None;
    for n in (0..g.in_channels + g.tn).step_by(g.tn) {
        stats.group_iterations += 1;
        if n < g.in_channels {
            let tn_min = g.tn.min(g.in_channels - n);
            load_input::<P>(&mut bufs.input[pp], mem.input, g, n, tn_min, r, c, P::Elem::default());
            load_weights::<P>(&mut bufs.weight[pp], mem.weights, &mut state.weight_cursor, g.ksize, tm_min, tn_min);
            stats.loads += 1;
        }
        if let Some(prev) = prev_n {
            conv_tile::<P>(
                &mut bufs.output[slot],
                &bufs.input[1 - pp],
                &bufs.weight[1 - pp],
                &bufs.bias,
                g,
                m,
                tm_min,
                extent,
                &job.q,
                prev == 0,
            );
            stats.computes += 1;
        }
        prev_n = Some(n);
        pp = 1 - pp;
    }
    state.output_tags[slot] = Some(TileTag { m, count: tm_min });
}

/// LOAD and PROCESS stages of a max-pool or reorg.
#[allow(clippy::too_many_arguments)]
fn data_step<P: Precision>(
    job: &ControlJob,
    mem: &LayerMemory<'_, P::Elem>,
    bufs: &mut TileBuffers<P>,
    state: &mut SchedulerState,
    stats: &mut ScheduleStats,
    k: usize,
    m: usize,
    r: usize,
    c: usize,
    extent: TileExtent,
) {
    let g = &job.geometry;
    let flags = g.flags(m);
    let cur = k % 2;

    if flags.input {
        let count = g.tm.min(g.in_channels - m);
        let pad = if g.kind == LayerType::Pool { P::POOL_SENTINEL } else { P::Elem::default() };
        load_input::<P>(&mut bufs.input[cur], mem.input, g, m, count, r, c, pad);
        state.input_tags[cur] = Some(TileTag { m, count });
        stats.loads += 1;
    }

    let other = 1 - cur;
    if flags.process {
        if let Some(tag) = state.input_tags[other].take() {
            let input = &bufs.input[other];
            let out = &mut bufs.output[other];
            match g.kind {
                LayerType::Pool => pool_tile::<P>(out, input, g, extent),
                LayerType::Reorg => reorg_tile::<P>(out, input, tag.count, extent),
                LayerType::Conv => {}
            }
            state.output_tags[other] = Some(tag);
            stats.computes += 1;
        }
    }
}
