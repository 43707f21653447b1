//! Silicon model of the YOLOv2 tiled convolution accelerator.
//!
//! This crate has **no hardware access**. It is a pure model of the
//! datapath contract: on-chip capacities, Q-format arithmetic, how a layer
//! is tiled and pipelined, what a control job contains, and where each
//! parameter lives in the register map.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`limits`] | Tile buffer maxima, DDR row alignment |
//! | [`fixed`] | Shift/round/saturate, the [`fixed::Precision`] selector |
//! | [`geometry`] | Tile sizes, loop bounds, pipeline enable flags |
//! | [`job`] | [`job::ControlJob`] and its validation |
//! | [`regs`] | Control-block register map, job encode/decode |
//! | [`window`] | Physical address windows |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fixed;
pub mod geometry;
pub mod job;
pub mod limits;
pub mod regs;
pub mod window;

pub use fixed::{Fixed16, Float32, Precision};
pub use geometry::{LayerType, LoopBounds, PipelineFlags, TileGeometry};
pub use job::{BufferAddrs, ControlJob, QValues, Violation};
