//! Activation arena planning
//!
//! All intermediate feature maps live in one element-addressed scratch
//! buffer. Layers ping-pong between its two ends:
//!
//! ```text
//!  0      top                                      floor        bottom
//!  │guard │ in/out ──▶          ◀── out/in          │ shelves...  │guard│
//! ```
//!
//! A layer reading from `top` writes its output flush against the working
//! floor; any other layer writes at `top`. Tensors consumed far from where
//! they are produced (route sources) go to shelves carved permanently out
//! of the bottom of the arena once their producer runs.
//!
//! The plan is checked while it is built: every output must stay inside
//! `[top, bottom)` and must not overlap a tensor that is still live or a
//! reserved shelf. Overflow is an error at planning time.

use crate::error::{ModelError, Result};
use crate::layer::{LayerKind, Network};
use std::ops::Range;

/// Guard elements on either side of the arena.
pub const DEFAULT_GUARD: usize = 512;

/// Usable arena elements: the largest adjacent pair in YOLOv2 at 416×416
/// (`32·416·416 + 32·208·208`).
pub const DEFAULT_CAPACITY: usize = 6_922_240;

/// Arena dimensions in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Guard elements before `top` and after `bottom`.
    pub guard: usize,
    /// Elements between `top` and `bottom`.
    pub capacity: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            guard: DEFAULT_GUARD,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// A reserved region for one far-consumed tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShelfSpec {
    /// Layer whose output lives on the shelf.
    pub producer: usize,
    /// Shelf size in elements.
    pub len: usize,
}

/// Element range inside the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// First element.
    pub offset: usize,
    /// Elements.
    pub len: usize,
}

impl Span {
    /// Create a span
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last element
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// As a slice range
    pub const fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// True if the spans share an element
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Byte offset and length for `elem`-byte elements
    pub const fn bytes(&self, elem: usize) -> (usize, usize) {
        (self.offset * elem, self.len * elem)
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&format!("[{}, {})", self.offset, self.end()))
    }
}

/// A tensor in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tensor {
    /// The network input.
    Input,
    /// Output of a layer.
    Layer(usize),
}

/// Where one layer reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    /// Input range (none for routes).
    pub input: Option<Span>,
    /// Output range (none for the region layer; aliased for routes).
    pub output: Option<Span>,
}

/// Address range and lifetime of one tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    /// Which tensor.
    pub tensor: Tensor,
    /// Where it lives.
    pub span: Span,
    /// Layer that writes it (0 for the network input).
    pub born: usize,
    /// Last layer that reads it.
    pub dies: usize,
}

impl LiveRange {
    /// True if both tensors exist during some layer.
    pub const fn coexists(&self, other: &Self) -> bool {
        self.born <= other.dies && other.born <= self.dies
    }
}

/// Planned arena layout for a network
#[derive(Debug, Clone)]
pub struct ArenaPlan {
    config: ArenaConfig,
    input: Span,
    placements: Vec<Placement>,
    shelves: Vec<(ShelfSpec, Span)>,
    live: Vec<LiveRange>,
}

impl ArenaPlan {
    /// Plan `network` into an arena.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ArenaOverflow`] if a tensor does not fit,
    /// [`ModelError::ShelfTooSmall`], [`ModelError::RouteNotContiguous`] or
    /// [`ModelError::UnshelvedRouteSource`] for an unusable shelf layout,
    /// and [`ModelError::InvalidLayer`] for shelves on layers without output.
    pub fn build(network: &Network, config: ArenaConfig, shelves: &[ShelfSpec]) -> Result<Self> {
        let top = config.guard;
        let bottom = config.guard + config.capacity;
        let shelves = carve_shelves(network, bottom, config.capacity, shelves)?;
        check_route_sources(network, &shelves)?;
        let dies = lifetimes(network);

        let mut planner = Planner {
            network,
            top,
            bottom,
            shelves: &shelves,
            live: Vec::with_capacity(network.len() + 1),
        };

        let input = Span::new(top, network.input().footprint());
        planner.admit(0, Tensor::Input, input, dies[0])?;

        let mut placements: Vec<Placement> = Vec::with_capacity(network.len());
        for layer in network.layers() {
            let index = layer.index;
            let previous = if index == 0 {
                Some(input)
            } else {
                placements[index - 1].output
            };

            let placement = match &layer.kind {
                LayerKind::Route { sources } => Placement {
                    input: None,
                    output: Some(concat(index, sources, &placements)?),
                },
                LayerKind::Region { .. } => Placement {
                    input: Some(previous.ok_or_else(|| ModelError::invalid_layer(index, "no input tensor"))?),
                    output: None,
                },
                LayerKind::Convolutional { .. } | LayerKind::MaxPool { .. } | LayerKind::Reorg { .. } => {
                    let input = previous.ok_or_else(|| ModelError::invalid_layer(index, "no input tensor"))?;
                    let output = planner.place_output(index, input)?;
                    planner.admit(index, Tensor::Layer(index), output, dies[index + 1])?;
                    Placement {
                        input: Some(input),
                        output: Some(output),
                    }
                }
            };
            tracing::trace!(
                "Layer {index:2} {:<6} in {:>20} out {:>20}",
                layer.kind,
                placement.input.map(|s| s.to_string()).unwrap_or_default(),
                placement.output.map(|s| s.to_string()).unwrap_or_default()
            );
            placements.push(placement);
        }

        let live = planner.live;
        tracing::debug!(
            "Arena plan: {} layers, {} shelves, {} elements",
            placements.len(),
            shelves.len(),
            config.capacity + 2 * config.guard
        );
        Ok(Self {
            config,
            input,
            placements,
            shelves,
            live,
        })
    }

    /// Elements to allocate, guards included.
    pub const fn total_elements(&self) -> usize {
        self.config.capacity + 2 * self.config.guard
    }

    /// Arena dimensions.
    pub const fn config(&self) -> ArenaConfig {
        self.config
    }

    /// First usable element.
    pub const fn top(&self) -> usize {
        self.config.guard
    }

    /// One past the last usable element.
    pub const fn bottom(&self) -> usize {
        self.config.guard + self.config.capacity
    }

    /// Where the network input goes.
    pub const fn input(&self) -> Span {
        self.input
    }

    /// Placement of layer `index`.
    pub fn placement(&self, index: usize) -> Option<&Placement> {
        self.placements.get(index)
    }

    /// All placements in layer order.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Output range of layer `index`.
    pub fn output_of(&self, index: usize) -> Option<Span> {
        self.placements.get(index).and_then(|p| p.output)
    }

    /// Shelf reserved for `producer`.
    pub fn shelf(&self, producer: usize) -> Option<Span> {
        self.shelves
            .iter()
            .find(|(s, _)| s.producer == producer)
            .map(|(_, span)| *span)
    }

    /// Every tensor with its lifetime, routes excluded (they alias).
    pub fn live_ranges(&self) -> &[LiveRange] {
        &self.live
    }

    /// First pair of coexisting tensors that overlap.
    pub fn find_conflict(&self) -> Option<(LiveRange, LiveRange)> {
        self.live.iter().enumerate().find_map(|(i, a)| {
            self.live[i + 1..]
                .iter()
                .find(|b| a.coexists(b) && a.span.overlaps(&b.span))
                .map(|b| (*a, *b))
        })
    }
}

struct Planner<'a> {
    network: &'a Network,
    top: usize,
    bottom: usize,
    shelves: &'a [(ShelfSpec, Span)],
    live: Vec<LiveRange>,
}

impl Planner<'_> {
    /// Lowest element not reserved by shelves of layers before `index`.
    fn floor(&self, index: usize) -> usize {
        self.bottom
            - self
                .shelves
                .iter()
                .filter(|(s, _)| s.producer < index)
                .map(|(s, _)| s.len)
                .sum::<usize>()
    }

    fn place_output(&self, index: usize, input: Span) -> Result<Span> {
        let footprint = self.network.layers()[index].output.footprint();

        if let Some((spec, shelf)) = self.shelves.iter().find(|(s, _)| s.producer == index) {
            if spec.len < footprint {
                return Err(ModelError::ShelfTooSmall {
                    layer: index,
                    len: spec.len,
                    needed: footprint,
                });
            }
            return Ok(Span::new(shelf.offset, footprint));
        }

        if input.offset == self.top {
            let floor = self.floor(index);
            let offset = floor
                .checked_sub(footprint)
                .filter(|&o| o >= self.top)
                .ok_or_else(|| {
                    ModelError::arena_overflow(
                        index,
                        format!("{footprint} elements do not fit below floor {floor}"),
                    )
                })?;
            Ok(Span::new(offset, footprint))
        } else {
            Ok(Span::new(self.top, footprint))
        }
    }

    /// Check `span` against the arena bounds, live tensors and reserved
    /// shelves, then record it.
    fn admit(&mut self, index: usize, tensor: Tensor, span: Span, dies: usize) -> Result<()> {
        if span.offset < self.top || span.end() > self.bottom {
            return Err(ModelError::arena_overflow(
                index,
                format!("{span} outside arena [{}, {})", self.top, self.bottom),
            ));
        }
        if let Some(other) = self.live.iter().find(|l| l.dies >= index && l.span.overlaps(&span)) {
            return Err(ModelError::arena_overflow(
                index,
                format!(
                    "{span} overlaps {:?} at {} (live until layer {})",
                    other.tensor, other.span, other.dies
                ),
            ));
        }
        if let Some((spec, shelf)) = self
            .shelves
            .iter()
            .find(|(s, shelf)| s.producer < index && shelf.overlaps(&span))
        {
            return Err(ModelError::arena_overflow(
                index,
                format!("{span} intrudes on the shelf of layer {} at {shelf}", spec.producer),
            ));
        }
        self.live.push(LiveRange {
            tensor,
            span,
            born: index,
            dies: dies.max(index),
        });
        Ok(())
    }
}

/// Stack shelves downward from `bottom` in producer order.
fn carve_shelves(
    network: &Network,
    bottom: usize,
    capacity: usize,
    specs: &[ShelfSpec],
) -> Result<Vec<(ShelfSpec, Span)>> {
    let mut cursor = bottom;
    let mut total = 0;
    let mut out = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let layer = network
            .layer(spec.producer)
            .ok_or_else(|| ModelError::invalid_layer(spec.producer, "shelf producer is not a layer"))?;
        if matches!(layer.kind, LayerKind::Route { .. } | LayerKind::Region { .. }) {
            return Err(ModelError::invalid_layer(
                spec.producer,
                format!("{} layer has no output to shelve", layer.kind),
            ));
        }
        if i > 0 && specs[i - 1].producer >= spec.producer {
            return Err(ModelError::invalid_layer(spec.producer, "shelves must be listed in producer order"));
        }
        total += spec.len;
        if total > capacity {
            return Err(ModelError::arena_overflow(
                spec.producer,
                format!("shelves need {total} elements, arena holds {capacity}"),
            ));
        }
        cursor -= spec.len;
        out.push((*spec, Span::new(cursor, spec.len)));
    }
    Ok(out)
}

/// Every route source other than the layer just before the route must be
/// shelved, since the ping-pong halves are overwritten in between.
fn check_route_sources(network: &Network, shelves: &[(ShelfSpec, Span)]) -> Result<()> {
    for layer in network.layers() {
        let LayerKind::Route { sources } = &layer.kind else {
            continue;
        };
        for &source in sources {
            if source + 1 != layer.index && !shelves.iter().any(|(s, _)| s.producer == source) {
                return Err(ModelError::UnshelvedRouteSource {
                    layer: layer.index,
                    source_layer: source,
                });
            }
        }
    }
    Ok(())
}

/// Tensors a layer output stands for (routes expand to their sources).
fn tensors_of(network: &Network, index: usize, out: &mut Vec<usize>) {
    match network.layers().get(index).map(|l| &l.kind) {
        Some(LayerKind::Route { sources }) => {
            for &s in sources {
                tensors_of(network, s, out);
            }
        }
        Some(_) => out.push(index),
        None => {}
    }
}

/// Last reader of every tensor: slot 0 is the network input, slot `i + 1`
/// layer `i`.
fn lifetimes(network: &Network) -> Vec<usize> {
    let mut dies: Vec<usize> = (0..=network.len()).map(|slot| slot.saturating_sub(1)).collect();
    let mut read = Vec::new();
    for layer in network.layers() {
        if matches!(layer.kind, LayerKind::Route { .. }) {
            continue;
        }
        if layer.index == 0 {
            dies[0] = 0;
            continue;
        }
        read.clear();
        tensors_of(network, layer.index - 1, &mut read);
        for &t in &read {
            dies[t + 1] = dies[t + 1].max(layer.index);
        }
    }
    dies
}

/// Aliased span of a route: its sources back to back, in order.
fn concat(index: usize, sources: &[usize], placements: &[Placement]) -> Result<Span> {
    let mut spans = sources.iter().map(|&s| placements.get(s).and_then(|p| p.output));
    let first = spans
        .next()
        .flatten()
        .ok_or_else(|| ModelError::invalid_layer(index, "route source has no output"))?;
    let mut joined = first;
    for span in spans {
        let span = span.ok_or_else(|| ModelError::invalid_layer(index, "route source has no output"))?;
        if span.offset != joined.end() {
            return Err(ModelError::RouteNotContiguous {
                layer: index,
                sources: sources.to_vec(),
            });
        }
        joined.len += span.len;
    }
    Ok(joined)
}
