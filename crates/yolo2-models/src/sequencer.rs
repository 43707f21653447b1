//! Layer sequencing
//!
//! Runs a parsed network end to end on one [`JobDispatcher`]:
//!
//! ```text
//! image ─▶ quantize ─▶ arena top
//!   conv / pool   ─▶ ControlJob on the accelerator
//!   reorg         ─▶ host gather, concat Q alignment
//!   route         ─▶ Q bookkeeping only (the arena plan aliases)
//!   region        ─▶ dequantize ─▶ Vec<f32>
//! ```
//!
//! All buffers are allocated and the parameters uploaded once, in
//! [`Sequencer::new`]; [`Sequencer::run`] can then be called for any number
//! of images.

use crate::arena::{ArenaConfig, ArenaPlan, Placement, ShelfSpec, Span};
use crate::error::{ModelError, Result};
use crate::host::{dequantize, pad_rows, quantize, shift_q, space_to_depth, strip_rows};
use crate::layer::{Activation, LayerDescriptor, LayerKind, Network};
use crate::qstate::QState;
use crate::quant::QuantTables;
use crate::shapes::Shape;
use crate::weights::WeightStore;
use crate::zoo::Preset;
use std::marker::PhantomData;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use yolo2_chip::{BufferAddrs, ControlJob, Precision, QValues};
use yolo2_driver::loading::upload;
use yolo2_driver::{BufferRange, DmaBuffer, ExecutionReport, JobDispatcher};

/// Sequencer setup
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequencerConfig {
    /// Arena dimensions.
    pub arena: ArenaConfig,
    /// Shelves for out-of-order tensors.
    pub shelves: Vec<ShelfSpec>,
    /// Layer whose Q the reorg output is aligned with. `None` uses the
    /// other source of the route that consumes the reorg.
    pub branch_layer: Option<usize>,
    /// Per-conv weight and bias sizes the parameters must match.
    pub reference_counts: Option<(&'static [usize], &'static [usize])>,
}

impl SequencerConfig {
    /// Arena and shelves of a preset
    pub fn for_preset(preset: Preset) -> Self {
        Self {
            arena: preset.arena(),
            shelves: preset.shelves(),
            branch_layer: None,
            reference_counts: Some(preset.reference_counts()),
        }
    }
}

/// Time spent in one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerTiming {
    /// Layer index.
    pub index: usize,
    /// Layer kind name.
    pub kind: &'static str,
    /// Wall time, host work included.
    pub elapsed: Duration,
    /// Device time, for layers run on the accelerator.
    pub device: Option<Duration>,
}

/// Result of one inference
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    /// Dense `[C][H][W]` output, dequantized.
    pub data: Vec<f32>,
    /// Output shape.
    pub shape: Shape,
    /// Q the output was stored at.
    pub q_out: i32,
    /// Per-layer timing.
    pub timings: Vec<LayerTiming>,
    /// Output Q of every layer.
    pub layer_q: Vec<Option<i32>>,
    /// Wall time of the whole inference.
    pub total: Duration,
}

impl InferenceOutput {
    /// Summed device time
    pub fn device_time(&self) -> Duration {
        self.timings.iter().filter_map(|t| t.device).sum()
    }
}

/// Runs a network on the accelerator
#[derive(Debug)]
pub struct Sequencer<P: Precision> {
    network: Network,
    plan: ArenaPlan,
    weights: WeightStore,
    quant: QuantTables,
    branch_layer: Option<usize>,
    dispatcher: JobDispatcher,
    arena: DmaBuffer,
    weight_buf: DmaBuffer,
    bias_buf: DmaBuffer,
    _precision: PhantomData<P>,
}

impl<P: Precision> Sequencer<P> {
    /// Plan the arena, allocate it and upload the parameters.
    ///
    /// # Errors
    ///
    /// Returns error if the parameters were packed for another precision
    /// or disagree with `config.reference_counts`, a layer cannot be tiled,
    /// the arena plan fails, or allocation or upload fails.
    pub fn new(
        network: Network,
        weights: WeightStore,
        quant: QuantTables,
        config: SequencerConfig,
        mut dispatcher: JobDispatcher,
    ) -> Result<Self> {
        let elem = elem_size::<P>();
        if weights.elem_size() != elem {
            return Err(ModelError::shape_mismatch(
                format!("{} parameter element size", P::NAME),
                elem,
                weights.elem_size(),
            ));
        }
        if let Some((w, b)) = config.reference_counts {
            weights.check_offsets(w, b)?;
        }
        for layer in network.layers() {
            if matches!(layer.kind, LayerKind::Convolutional { .. } | LayerKind::MaxPool { .. }) {
                layer
                    .tile_geometry()
                    .map_err(|v| ModelError::invalid_layer(layer.index, v.to_string()))?;
            }
        }

        let plan = ArenaPlan::build(&network, config.arena, &config.shelves)?;
        let allocator = dispatcher.platform_mut().allocator.as_mut();
        let arena = allocator.allocate(plan.total_elements() * elem)?;
        let (weight_buf, weight_load) = upload(allocator, weights.weights())?;
        let (bias_buf, _) = upload(allocator, weights.bias())?;

        let branch_layer = config.branch_layer.or_else(|| network.reorg_branch());
        info!(
            "Sequencer ({}): {} layers, arena {} KiB, weights {} KiB ({:.1} MB/s), branch {:?}",
            P::NAME,
            network.len(),
            arena.len() / 1024,
            weight_buf.len() / 1024,
            weight_load.throughput_mbps,
            branch_layer
        );

        Ok(Self {
            network,
            plan,
            weights,
            quant,
            branch_layer,
            dispatcher,
            arena,
            weight_buf,
            bias_buf,
            _precision: PhantomData,
        })
    }

    /// Load parameters (and, for fixed point, Q tables) from `dir` and set
    /// up a sequencer.
    ///
    /// # Errors
    ///
    /// See [`WeightStore::load`], [`QuantTables::load`] and
    /// [`Sequencer::new`].
    pub fn from_dir(
        network: Network,
        dir: impl AsRef<Path>,
        config: SequencerConfig,
        dispatcher: JobDispatcher,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let weights = WeightStore::load::<P>(dir, &network)?;
        let quant = if P::IS_FIXED {
            QuantTables::load(dir, network.conv_count())?
        } else {
            QuantTables::zero()
        };
        Self::new(network, weights, quant, config, dispatcher)
    }

    /// The network
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// The arena plan
    pub fn plan(&self) -> &ArenaPlan {
        &self.plan
    }

    /// The dispatcher
    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Layer whose Q the reorg output is aligned with
    pub const fn branch_layer(&self) -> Option<usize> {
        self.branch_layer
    }

    /// Run one image, `[C][H][W]` real values.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ShapeMismatch`] if the image does not match
    /// the network input, or the first device or host failure. A device
    /// timeout ends the inference.
    pub fn run(&mut self, image: &[f32]) -> Result<InferenceOutput> {
        let started = Instant::now();
        let input_shape = self.network.input();
        if image.len() != input_shape.elements() {
            return Err(ModelError::shape_mismatch(
                format!("input image {input_shape}"),
                input_shape.elements(),
                image.len(),
            ));
        }

        let input_q = if P::IS_FIXED { self.quant.input_q() } else { 0 };
        let staged = pad_rows(&quantize::<P>(image, input_q), input_shape)?;
        self.write_span(self.plan.input(), &staged)?;
        debug!("Input {input_shape} staged at Q{input_q}");

        let mut qstate = QState::new(input_q, self.network.len());
        let mut timings = Vec::with_capacity(self.network.len());
        let mut region = None;

        for index in 0..self.network.len() {
            let layer = self.network.layers()[index].clone();
            let placement = self
                .plan
                .placement(index)
                .copied()
                .ok_or_else(|| ModelError::invalid_layer(index, "layer is not planned"))?;
            let layer_started = Instant::now();
            let mut device = None;

            match &layer.kind {
                LayerKind::Convolutional {
                    activation,
                    batch_norm,
                    ..
                } => {
                    let ordinal = self
                        .network
                        .conv_ordinal(index)
                        .ok_or_else(|| ModelError::invalid_layer(index, "conv has no ordinal"))?;
                    let table = if P::IS_FIXED {
                        self.quant.conv(ordinal)
                    } else {
                        QValues::default()
                    };
                    let q = qstate.begin_conv(table);
                    let leaky = *activation == Activation::Leaky;
                    let report = self.run_conv(&layer, ordinal, placement, leaky, *batch_norm, q)?;
                    device = Some(report.duration);
                    qstate.finish_conv(index, q.act_out);
                }
                LayerKind::MaxPool { .. } => {
                    let report = self.run_pool(&layer, placement)?;
                    device = Some(report.duration);
                    qstate.pass_through(index);
                }
                LayerKind::Reorg { stride } => {
                    self.run_reorg(&layer, *stride, placement, &mut qstate)?;
                }
                LayerKind::Route { sources } => qstate.route(index, sources),
                LayerKind::Region { .. } => {
                    let input = placement
                        .input
                        .ok_or_else(|| ModelError::invalid_layer(index, "region has no input"))?;
                    region = Some((self.read_span(input, layer.input, qstate.current())?, layer.input));
                }
            }
            if Some(index) == self.branch_layer && !matches!(layer.kind, LayerKind::Route { .. }) {
                qstate.cache_branch();
            }

            let elapsed = layer_started.elapsed();
            debug!(
                "Layer {index:2} {:<6} {:>12} -> {:>12}  Q{:<3} {:8.2} ms",
                layer.kind,
                layer.input,
                layer.output,
                qstate.current(),
                elapsed.as_secs_f64() * 1e3
            );
            timings.push(LayerTiming {
                index,
                kind: layer.kind.name(),
                elapsed,
                device,
            });
        }

        let (data, shape) = match region {
            Some(found) => found,
            None => {
                let shape = self.network.output_shape();
                let span = self
                    .network
                    .len()
                    .checked_sub(1)
                    .map_or(Some(self.plan.input()), |last| self.plan.output_of(last))
                    .ok_or_else(|| ModelError::invalid_layer(self.network.len() - 1, "last layer has no output"))?;
                (self.read_span(span, shape, qstate.current())?, shape)
            }
        };

        let output = InferenceOutput {
            data,
            shape,
            q_out: qstate.current(),
            timings,
            layer_q: qstate.layer_q().to_vec(),
            total: started.elapsed(),
        };
        info!(
            "Inference: {} layers, output {} at Q{}, device {:.1} ms, total {:.1} ms",
            self.network.len(),
            output.shape,
            output.q_out,
            output.device_time().as_secs_f64() * 1e3,
            output.total.as_secs_f64() * 1e3
        );
        Ok(output)
    }

    fn run_conv(
        &mut self,
        layer: &LayerDescriptor,
        ordinal: usize,
        placement: Placement,
        leaky: bool,
        batch_norm: bool,
        q: QValues,
    ) -> Result<ExecutionReport> {
        let elem = elem_size::<P>();
        let g = layer
            .tile_geometry()?
            .ok_or_else(|| ModelError::invalid_layer(layer.index, "conv has no tiling"))?;
        let (input, output) = io_spans(layer.index, placement)?;
        let offsets = self
            .weights
            .offsets(ordinal)
            .ok_or_else(|| ModelError::invalid_layer(layer.index, format!("no parameters for conv {ordinal}")))?;
        let (w_count, b_count) = layer
            .param_counts()
            .ok_or_else(|| ModelError::invalid_layer(layer.index, "conv has no parameters"))?;

        let addrs = BufferAddrs {
            input: self.arena.phys_at(input.offset * elem)?,
            output: self.arena.phys_at(output.offset * elem)?,
            weight: self.weight_buf.phys_at(offsets.weight * elem)?,
            bias: self.bias_buf.phys_at(offsets.bias * elem)?,
        };
        let job = ControlJob::conv(g, addrs, leaky, batch_norm, q);
        let (in_off, in_len) = input.bytes(elem);
        let (out_off, out_len) = output.bytes(elem);
        let report = self.dispatcher.dispatch(
            &job,
            &[
                BufferRange::new(&self.arena, in_off, in_len),
                BufferRange::new(&self.weight_buf, offsets.weight * elem, w_count * elem),
                BufferRange::new(&self.bias_buf, offsets.bias * elem, b_count * elem),
            ],
            BufferRange::new(&self.arena, out_off, out_len),
        )?;
        Ok(report)
    }

    fn run_pool(&mut self, layer: &LayerDescriptor, placement: Placement) -> Result<ExecutionReport> {
        let elem = elem_size::<P>();
        let g = layer
            .tile_geometry()?
            .ok_or_else(|| ModelError::invalid_layer(layer.index, "pool has no tiling"))?;
        let (input, output) = io_spans(layer.index, placement)?;
        let job = ControlJob::data_movement(
            g,
            self.arena.phys_at(input.offset * elem)?,
            self.arena.phys_at(output.offset * elem)?,
        );
        let (in_off, in_len) = input.bytes(elem);
        let (out_off, out_len) = output.bytes(elem);
        let report = self.dispatcher.dispatch(
            &job,
            &[BufferRange::new(&self.arena, in_off, in_len)],
            BufferRange::new(&self.arena, out_off, out_len),
        )?;
        Ok(report)
    }

    /// Host-side reorg, then bring both concat halves to one Q.
    fn run_reorg(
        &mut self,
        layer: &LayerDescriptor,
        stride: usize,
        placement: Placement,
        qstate: &mut QState,
    ) -> Result<()> {
        let (input, output) = io_spans(layer.index, placement)?;
        self.invalidate(input)?;
        let dense = strip_rows(&self.arena.typed::<P::Elem>()?[input.range()], layer.input)?;
        let mut reorged = space_to_depth(&dense, layer.input, stride)?;

        if let Some(a) = qstate.align_reorg(layer.index) {
            shift_q::<P>(&mut reorged, a.target + a.reorg_shift, a.target);
            if a.branch_shift > 0 {
                let branch = self
                    .branch_layer
                    .and_then(|b| self.plan.output_of(b))
                    .ok_or_else(|| ModelError::invalid_layer(layer.index, "branch layer has no output"))?;
                self.invalidate(branch)?;
                shift_q::<P>(
                    &mut self.arena.typed_mut::<P::Elem>()?[branch.range()],
                    a.target + a.branch_shift,
                    a.target,
                );
                self.flush(branch.offset, branch.len)?;
            }
            debug!(
                "Layer {}: concat aligned to Q{} (reorg >> {}, branch >> {})",
                layer.index, a.target, a.reorg_shift, a.branch_shift
            );
        }

        let padded = pad_rows(&reorged, layer.output)?;
        self.write_span(output, &padded)
    }

    /// Copy `data` to the start of `span` and flush it.
    fn write_span(&mut self, span: Span, data: &[P::Elem]) -> Result<()> {
        if data.len() > span.len {
            return Err(ModelError::shape_mismatch(format!("arena range {span}"), span.len, data.len()));
        }
        self.arena.typed_mut::<P::Elem>()?[span.offset..span.offset + data.len()].copy_from_slice(data);
        self.flush(span.offset, data.len())
    }

    /// Invalidate `span`, strip its row padding and dequantize at `q`.
    fn read_span(&self, span: Span, shape: Shape, q: i32) -> Result<Vec<f32>> {
        self.invalidate(span)?;
        let dense = strip_rows(&self.arena.typed::<P::Elem>()?[span.range()], shape)?;
        Ok(dequantize::<P>(&dense, q))
    }

    fn flush(&self, offset: usize, len: usize) -> Result<()> {
        let elem = elem_size::<P>();
        self.dispatcher
            .platform()
            .allocator
            .flush(&self.arena, offset * elem, len * elem)?;
        Ok(())
    }

    fn invalidate(&self, span: Span) -> Result<()> {
        let (offset, len) = span.bytes(elem_size::<P>());
        self.dispatcher.platform().allocator.invalidate(&self.arena, offset, len)?;
        Ok(())
    }
}

fn elem_size<P: Precision>() -> usize {
    std::mem::size_of::<P::Elem>()
}

fn io_spans(index: usize, placement: Placement) -> Result<(Span, Span)> {
    match (placement.input, placement.output) {
        (Some(input), Some(output)) => Ok((input, output)),
        _ => Err(ModelError::invalid_layer(index, "layer has no arena input or output")),
    }
}
