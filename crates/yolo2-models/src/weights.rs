//! Convolution weights and biases
//!
//! The datapath streams weights in tile order, not in darknet's canonical
//! `[OFM][IFM][K][K]` order. For every spatial tile it walks output-channel
//! tiles, then input-channel tiles, and reads one block per pair:
//!
//! ```text
//! for m in (0..ofm).step_by(tm)
//!   for n in (0..ifm).step_by(tn)
//!     block[i][j][t < tm_min][u < tn_min]
//! ```
//!
//! Parameter files on disk are already in that order. [`pack_conv_weights`]
//! produces it from canonical weights.

use crate::error::{ModelError, Result};
use crate::layer::Network;
use bytemuck::Pod;
use std::path::Path;
use yolo2_chip::Precision;
use yolo2_driver::ParamBlob;

/// Fixed-point weight stream
pub const FIXED_WEIGHTS_FILE: &str = "weights_reorg_int16.bin";
/// Fixed-point bias
pub const FIXED_BIAS_FILE: &str = "bias_int16.bin";
/// Floating-point weight stream
pub const FLOAT_WEIGHTS_FILE: &str = "weights_reorg_f32.bin";
/// Floating-point bias
pub const FLOAT_BIAS_FILE: &str = "bias_f32.bin";

/// Parameter file names for a precision
pub fn param_files<P: Precision>() -> (&'static str, &'static str) {
    if P::IS_FIXED {
        (FIXED_WEIGHTS_FILE, FIXED_BIAS_FILE)
    } else {
        (FLOAT_WEIGHTS_FILE, FLOAT_BIAS_FILE)
    }
}

/// Element offsets of one conv's parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamOffsets {
    /// First weight element.
    pub weight: usize,
    /// First bias element.
    pub bias: usize,
}

/// Parameter layout of a network, per conv ordinal
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamLayout {
    /// Where each conv starts.
    pub offsets: Vec<ParamOffsets>,
    /// Weight and bias element counts of each conv.
    pub counts: Vec<(usize, usize)>,
}

impl ParamLayout {
    /// Lay convs out back to back in layer order.
    pub fn of(network: &Network) -> Self {
        let mut layout = Self::default();
        let mut next = ParamOffsets::default();
        for (weights, bias) in network.layers().iter().filter_map(|l| l.param_counts()) {
            layout.offsets.push(next);
            layout.counts.push((weights, bias));
            next.weight += weights;
            next.bias += bias;
        }
        layout
    }

    /// Total weight elements
    pub fn weight_total(&self) -> usize {
        self.counts.iter().map(|c| c.0).sum()
    }

    /// Total bias elements
    pub fn bias_total(&self) -> usize {
        self.counts.iter().map(|c| c.1).sum()
    }
}

/// Canonical parameters of one conv
#[derive(Debug, Clone, PartialEq)]
pub struct ConvParams<T> {
    /// `[OFM][IFM][K][K]`
    pub weights: Vec<T>,
    /// `[OFM]`
    pub bias: Vec<T>,
}

/// Reorder canonical `[OFM][IFM][K][K]` weights into the tile stream.
///
/// # Errors
///
/// Returns [`ModelError::ShapeMismatch`] if `canonical` is not
/// `ofm·ifm·k·k` long, or a tile size is zero.
pub fn pack_conv_weights<T: Copy>(
    canonical: &[T],
    ofm: usize,
    ifm: usize,
    k: usize,
    tm: usize,
    tn: usize,
) -> Result<Vec<T>> {
    let total = ofm * ifm * k * k;
    if canonical.len() != total {
        return Err(ModelError::shape_mismatch("canonical weights", total, canonical.len()));
    }
    if tm == 0 || tn == 0 {
        return Err(ModelError::shape_mismatch("weight tile", 1, 0));
    }

    let mut packed = Vec::with_capacity(total);
    for m in (0..ofm).step_by(tm) {
        let tm_min = tm.min(ofm - m);
        for n in (0..ifm).step_by(tn) {
            let tn_min = tn.min(ifm - n);
            for i in 0..k {
                for j in 0..k {
                    for t in 0..tm_min {
                        for u in 0..tn_min {
                            packed.push(canonical[((m + t) * ifm + (n + u)) * k * k + i * k + j]);
                        }
                    }
                }
            }
        }
    }
    Ok(packed)
}

/// Packed weights and biases of a whole network
#[derive(Debug, Clone)]
pub struct WeightStore {
    weights: ParamBlob,
    bias: ParamBlob,
    elem_size: usize,
    layout: ParamLayout,
}

impl WeightStore {
    /// Load the parameter files for precision `P` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MissingTable`] if a file is absent and
    /// [`ModelError::ShapeMismatch`] if one is too short for the network.
    pub fn load<P: Precision>(dir: impl AsRef<Path>, network: &Network) -> Result<Self> {
        let dir = dir.as_ref();
        let (weights_file, bias_file) = param_files::<P>();
        let read = |name: &str| -> Result<ParamBlob> {
            let path = dir.join(name);
            match std::fs::read(&path) {
                Ok(bytes) => Ok(ParamBlob::new(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ModelError::MissingTable { path }),
                Err(e) => Err(e.into()),
            }
        };
        tracing::info!("Loading {} parameters from {}", P::NAME, dir.display());
        Self::from_blobs::<P>(network, read(weights_file)?, read(bias_file)?)
    }

    /// Wrap already packed parameter images.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ShapeMismatch`] if a blob is not a whole number
    /// of elements or holds fewer than the network needs. Extra trailing
    /// data is allowed.
    pub fn from_blobs<P: Precision>(network: &Network, weights: ParamBlob, bias: ParamBlob) -> Result<Self> {
        let elem_size = std::mem::size_of::<P::Elem>();
        let layout = ParamLayout::of(network);
        check_blob("weights", &weights, elem_size, layout.weight_total())?;
        check_blob("bias", &bias, elem_size, layout.bias_total())?;
        tracing::debug!(
            "Parameters: {} convs, {} weights, {} biases",
            layout.counts.len(),
            layout.weight_total(),
            layout.bias_total()
        );
        Ok(Self {
            weights,
            bias,
            elem_size,
            layout,
        })
    }

    /// Pack canonical per-conv parameters.
    ///
    /// # Errors
    ///
    /// Returns error if the number of convs or any tensor size disagrees
    /// with the network.
    pub fn from_layers<P: Precision>(network: &Network, params: &[ConvParams<P::Elem>]) -> Result<Self> {
        let convs: Vec<_> = network.layers().iter().filter(|l| l.kind.is_conv()).collect();
        if convs.len() != params.len() {
            return Err(ModelError::shape_mismatch("conv parameter sets", convs.len(), params.len()));
        }

        let mut weights = Vec::new();
        let mut bias = Vec::new();
        for (layer, p) in convs.into_iter().zip(params) {
            let g = layer
                .tile_geometry()?
                .ok_or_else(|| ModelError::invalid_layer(layer.index, "conv has no tiling"))?;
            weights.extend(pack_conv_weights(
                &p.weights,
                g.out_channels,
                g.in_channels,
                g.ksize,
                g.tm,
                g.tn,
            )?);
            if p.bias.len() != g.out_channels {
                return Err(ModelError::shape_mismatch(
                    format!("layer {} bias", layer.index),
                    g.out_channels,
                    p.bias.len(),
                ));
            }
            bias.extend_from_slice(&p.bias);
        }
        Self::from_blobs::<P>(network, blob(&weights), blob(&bias))
    }

    /// Weight stream
    pub fn weights(&self) -> &ParamBlob {
        &self.weights
    }

    /// Bias image
    pub fn bias(&self) -> &ParamBlob {
        &self.bias
    }

    /// Bytes per element
    pub const fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Per-conv layout
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Element offsets of conv `ordinal`
    pub fn offsets(&self, ordinal: usize) -> Option<ParamOffsets> {
        self.layout.offsets.get(ordinal).copied()
    }

    /// Compare per-conv sizes against reference tables.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ShapeMismatch`] at the first disagreeing conv.
    pub fn check_offsets(&self, weight_counts: &[usize], bias_counts: &[usize]) -> Result<()> {
        check_counts(&self.layout, weight_counts, bias_counts)
    }
}

/// Compare a layout against reference per-conv sizes.
///
/// # Errors
///
/// Returns [`ModelError::ShapeMismatch`] at the first disagreeing conv.
pub fn check_counts(layout: &ParamLayout, weight_counts: &[usize], bias_counts: &[usize]) -> Result<()> {
    if layout.counts.len() != weight_counts.len() || layout.counts.len() != bias_counts.len() {
        return Err(ModelError::shape_mismatch(
            "reference conv count",
            layout.counts.len(),
            weight_counts.len().min(bias_counts.len()),
        ));
    }
    for (o, (&(w, b), (&rw, &rb))) in layout
        .counts
        .iter()
        .zip(weight_counts.iter().zip(bias_counts))
        .enumerate()
    {
        if w != rw {
            return Err(ModelError::shape_mismatch(format!("conv {o} weights"), rw, w));
        }
        if b != rb {
            return Err(ModelError::shape_mismatch(format!("conv {o} bias"), rb, b));
        }
    }
    Ok(())
}

fn blob<T: Pod>(values: &[T]) -> ParamBlob {
    ParamBlob::from_slice(values)
}

fn check_blob(what: &str, blob: &ParamBlob, elem_size: usize, needed: usize) -> Result<()> {
    if blob.len() % elem_size != 0 {
        return Err(ModelError::shape_mismatch(
            format!("{what} byte length (multiple of {elem_size})"),
            blob.len() / elem_size * elem_size,
            blob.len(),
        ));
    }
    let have = blob.len() / elem_size;
    if have < needed {
        return Err(ModelError::shape_mismatch(format!("{what} elements"), needed, have));
    }
    if have > needed {
        tracing::debug!("{what}: {} trailing elements ignored", have - needed);
    }
    Ok(())
}
