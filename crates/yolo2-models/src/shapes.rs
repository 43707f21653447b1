//! Feature-map shapes
//!
//! Tensors are stored channel-major, `[C][H][W]`. In DDR every row is padded
//! to a multiple of 8 elements so the datapath reads whole 256-bit beats;
//! [`Shape::footprint`] is the padded size and [`Shape::elements`] the dense
//! one.

use yolo2_chip::limits::{align8, footprint};

/// Channel, height and width of a feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shape {
    /// Channels
    pub c: usize,
    /// Rows
    pub h: usize,
    /// Columns
    pub w: usize,
}

impl Shape {
    /// Create new shape
    pub const fn new(c: usize, h: usize, w: usize) -> Self {
        Self { c, h, w }
    }

    /// Dense element count
    #[must_use]
    pub const fn elements(&self) -> usize {
        self.c * self.h * self.w
    }

    /// Element count with rows padded to 8
    #[must_use]
    pub const fn footprint(&self) -> usize {
        footprint(self.c, self.h, self.w)
    }

    /// Padded row length
    #[must_use]
    pub const fn row_stride(&self) -> usize {
        align8(self.w)
    }

    /// True if any dimension is zero
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.c == 0 || self.h == 0 || self.w == 0
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&format!("{}x{}x{}", self.w, self.h, self.c))
    }
}
