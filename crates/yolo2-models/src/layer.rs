//! Network representation
//!
//! A [`Network`] is the ordered layer list produced by the cfg parser. It is
//! built once and read-only afterwards; every later stage (arena planning,
//! parameter offsets, the sequencer) works from these descriptors.

use crate::shapes::Shape;
use yolo2_chip::geometry::{conv_geometry, pool_geometry, reorg_geometry};
use yolo2_chip::{TileGeometry, Violation};

/// Convolution activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Identity
    Linear,
    /// Leaky rectifier (slope 0.1)
    Leaky,
}

/// Layer kind with its parameters
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    /// Convolution on the accelerator
    Convolutional {
        /// Output channels
        filters: usize,
        /// Square kernel size
        size: usize,
        /// Stride
        stride: usize,
        /// Zero padding in pixels
        pad: usize,
        /// Activation
        activation: Activation,
        /// Batch norm folded into the weights
        batch_norm: bool,
    },

    /// Max-pool on the accelerator
    MaxPool {
        /// Window size
        size: usize,
        /// Stride
        stride: usize,
    },

    /// Space-to-depth, run on the host
    Reorg {
        /// Block size
        stride: usize,
    },

    /// Channel concatenation of earlier outputs (absolute indices)
    Route {
        /// Source layers
        sources: Vec<usize>,
    },

    /// Terminal detection layer
    Region {
        /// Object classes
        classes: usize,
        /// Box coordinates per anchor
        coords: usize,
        /// Anchors per cell
        num: usize,
        /// Anchor width/height pairs
        anchors: Vec<f32>,
    },
}

impl LayerKind {
    /// Short darknet-style name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Convolutional { .. } => "conv",
            Self::MaxPool { .. } => "max",
            Self::Reorg { .. } => "reorg",
            Self::Route { .. } => "route",
            Self::Region { .. } => "region",
        }
    }

    /// True for convolutions
    pub const fn is_conv(&self) -> bool {
        matches!(self, Self::Convolutional { .. })
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// One layer with resolved shapes
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    /// Position in the network
    pub index: usize,
    /// Kind and parameters
    pub kind: LayerKind,
    /// Input shape
    pub input: Shape,
    /// Output shape
    pub output: Shape,
}

impl LayerDescriptor {
    /// Accelerator tiling of this layer, if it runs on the datapath.
    ///
    /// Reorg reports the datapath tiling for inspection even though the
    /// sequencer runs it on the host.
    ///
    /// # Errors
    ///
    /// Returns a [`Violation`] if the layer cannot be tiled.
    pub fn tile_geometry(&self) -> Result<Option<TileGeometry>, Violation> {
        let Shape { c, h, w } = self.input;
        match &self.kind {
            LayerKind::Convolutional {
                filters,
                size,
                stride,
                pad,
                ..
            } => conv_geometry(c, *filters, w, h, *size, *stride, *pad).map(Some),
            LayerKind::MaxPool { size, stride } => pool_geometry(c, w, h, *size, *stride).map(Some),
            LayerKind::Reorg { stride: 2 } => reorg_geometry(c, w, h).map(Some),
            LayerKind::Reorg { .. } | LayerKind::Route { .. } | LayerKind::Region { .. } => Ok(None),
        }
    }

    /// Weight and bias element counts of a convolution
    pub fn param_counts(&self) -> Option<(usize, usize)> {
        match self.kind {
            LayerKind::Convolutional { filters, size, .. } => {
                Some((self.input.c * filters * size * size, filters))
            }
            _ => None,
        }
    }
}

/// Ordered layer list
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    input: Shape,
    layers: Vec<LayerDescriptor>,
}

impl Network {
    /// Create a network from resolved layers
    pub fn new(input: Shape, layers: Vec<LayerDescriptor>) -> Self {
        Self { input, layers }
    }

    /// Network input shape
    pub const fn input(&self) -> Shape {
        self.input
    }

    /// All layers
    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    /// Layer by index
    pub fn layer(&self, index: usize) -> Option<&LayerDescriptor> {
        self.layers.get(index)
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True if there are no layers
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Number of convolutions (the length of every per-conv table)
    pub fn conv_count(&self) -> usize {
        self.layers.iter().filter(|l| l.kind.is_conv()).count()
    }

    /// Conv ordinal of layer `index`; non-conv layers have none.
    pub fn conv_ordinal(&self, index: usize) -> Option<usize> {
        let layer = self.layers.get(index)?;
        layer
            .kind
            .is_conv()
            .then(|| self.layers[..index].iter().filter(|l| l.kind.is_conv()).count())
    }

    /// Shape of the last layer's output
    pub fn output_shape(&self) -> Shape {
        self.layers.last().map_or(self.input, |l| l.output)
    }

    /// Layer whose Q the reorg output is aligned with: the other source of
    /// the multi-source route that consumes the reorg.
    pub fn reorg_branch(&self) -> Option<usize> {
        let reorg = self
            .layers
            .iter()
            .find(|l| matches!(l.kind, LayerKind::Reorg { .. }))?
            .index;
        self.layers.iter().find_map(|l| match &l.kind {
            LayerKind::Route { sources } if sources.len() > 1 && sources.contains(&reorg) => {
                sources.iter().copied().find(|&s| s != reorg)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(index: usize, input: Shape, filters: usize) -> LayerDescriptor {
        LayerDescriptor {
            index,
            kind: LayerKind::Convolutional {
                filters,
                size: 3,
                stride: 1,
                pad: 1,
                activation: Activation::Leaky,
                batch_norm: true,
            },
            input,
            output: Shape::new(filters, input.h, input.w),
        }
    }

    #[test]
    fn test_conv_ordinals_skip_other_layers() {
        let a = Shape::new(3, 8, 8);
        let layers = vec![
            conv(0, a, 4),
            LayerDescriptor {
                index: 1,
                kind: LayerKind::MaxPool { size: 2, stride: 2 },
                input: Shape::new(4, 8, 8),
                output: Shape::new(4, 4, 4),
            },
            conv(2, Shape::new(4, 4, 4), 8),
        ];
        let net = Network::new(a, layers);
        assert_eq!(net.conv_count(), 2);
        assert_eq!(net.conv_ordinal(0), Some(0));
        assert_eq!(net.conv_ordinal(1), None);
        assert_eq!(net.conv_ordinal(2), Some(1));
        assert_eq!(net.conv_ordinal(9), None);
        assert_eq!(net.output_shape(), Shape::new(8, 4, 4));
    }

    #[test]
    fn test_geometry_by_kind() {
        let layer = conv(0, Shape::new(3, 416, 416), 32);
        let g = layer.tile_geometry().unwrap().unwrap();
        assert_eq!((g.tm, g.tn, g.tr, g.tc), (32, 3, 26, 26));
        assert_eq!(layer.param_counts(), Some((864, 32)));

        let route = LayerDescriptor {
            index: 1,
            kind: LayerKind::Route { sources: vec![0] },
            input: Shape::default(),
            output: Shape::new(32, 416, 416),
        };
        assert_eq!(route.tile_geometry().unwrap(), None);
        assert_eq!(route.param_counts(), None);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(LayerKind::Reorg { stride: 2 }.to_string(), "reorg");
        assert_eq!(format!("{:<6}|", LayerKind::MaxPool { size: 2, stride: 2 }), "max   |");
    }
}
