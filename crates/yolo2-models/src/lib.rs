#![deny(unsafe_code)]

//! YOLOv2 network description and layer sequencing
//!
//! This crate turns a darknet `.cfg` into a run on the accelerator: it
//! resolves layer shapes, plans where every feature map lives, loads the
//! packed parameters and Q tables, and walks the layers through a
//! [`yolo2_driver::JobDispatcher`].
//!
//! # Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`parser`] | `.cfg` text to [`Network`] |
//! | [`arena`] | Feature-map placement in one DMA buffer |
//! | [`weights`] | Packed weight stream and per-conv offsets |
//! | [`quant`] | Per-layer Q tables |
//! | [`qstate`] | Activation Q across routes and the reorg |
//! | [`host`] | CPU-side reorg, padding and (de)quantization |
//! | [`sequencer`] | The layer loop |
//! | [`zoo`] | Built-in YOLOv2 preset |
//!
//! # Example
//!
//! ```no_run
//! use yolo2_chip::Fixed16;
//! use yolo2_driver::prelude::*;
//! use yolo2_models::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let preset = Preset::Yolov2;
//! let config = DispatchConfig::from_env();
//! let platform = select_backend::<Fixed16>(BackendSelection::Auto, &config.handshake)?;
//! let dispatcher = JobDispatcher::new(platform, config);
//!
//! let mut sequencer = Sequencer::<Fixed16>::from_dir(
//!     preset.network()?,
//!     "params/",
//!     SequencerConfig::for_preset(preset),
//!     dispatcher,
//! )?;
//! let image = vec![0.5_f32; 3 * 416 * 416];
//! let output = sequencer.run(&image)?;
//! println!("{} values at Q{}", output.data.len(), output.q_out);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod arena;
mod error;
pub mod host;
mod layer;
pub mod parser;
pub mod qstate;
pub mod quant;
pub mod sequencer;
mod shapes;
pub mod weights;
pub mod zoo;

pub use arena::{ArenaConfig, ArenaPlan, ShelfSpec, Span};
pub use error::{ModelError, Result};
pub use layer::{Activation, LayerDescriptor, LayerKind, Network};
pub use parser::{parse_cfg, parse_cfg_file};
pub use qstate::QState;
pub use quant::QuantTables;
pub use sequencer::{InferenceOutput, LayerTiming, Sequencer, SequencerConfig};
pub use shapes::Shape;
pub use weights::{pack_conv_weights, ConvParams, WeightStore};
pub use zoo::Preset;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        parse_cfg, parse_cfg_file, ArenaPlan, InferenceOutput, ModelError, Network, Preset, QuantTables, Sequencer,
        SequencerConfig, Shape, WeightStore,
    };
}
