//! Built-in network presets
//!
//! ## Presets
//!
//! | Preset | Input | Convs | Output | Arena (elements) |
//! |--------|-------|-------|--------|------------------|
//! | `yolov2` | 416×416×3 | 23 | 13×13×425 (COCO, 5 anchors) | 6 922 240 + 2·512 |
//!
//! A preset bundles the darknet cfg with what the sequencer needs beyond
//! it: the shelves that keep the passthrough branch alive, the arena size,
//! and reference per-conv parameter sizes to check weight files against.
//!
//! ## Usage
//!
//! ```no_run
//! use yolo2_models::zoo::Preset;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let preset = Preset::Yolov2;
//! let network = preset.network()?;
//! println!("{}: {} layers", preset.name(), network.len());
//! # Ok(())
//! # }
//! ```

use crate::arena::{ArenaConfig, ShelfSpec};
use crate::error::Result;
use crate::layer::Network;
use crate::parser::parse_cfg;
use crate::quant::{ACT_Q_FILE, BIAS_Q_FILE, WEIGHT_Q_FILE};
use crate::shapes::Shape;
use crate::weights::param_files;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use yolo2_chip::Precision;

/// YOLOv2 (COCO, 416×416) in darknet cfg form
pub const YOLOV2_CFG: &str = "\
[net]
batch=1
subdivisions=1
width=416
height=416
channels=3

[convolutional]
batch_normalize=1
filters=32
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
batch_normalize=1
filters=64
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
batch_normalize=1
filters=128
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=64
size=1
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=128
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
batch_normalize=1
filters=256
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=128
size=1
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=256
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
batch_normalize=1
filters=512
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=256
size=1
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=512
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=256
size=1
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=512
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
batch_normalize=1
filters=1024
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=512
size=1
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=1024
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=512
size=1
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
filters=1024
size=3
stride=1
pad=1
activation=leaky

[convolutional]
batch_normalize=1
size=3
stride=1
pad=1
filters=1024
activation=leaky

[convolutional]
batch_normalize=1
size=3
stride=1
pad=1
filters=1024
activation=leaky

[route]
layers=-9

[convolutional]
batch_normalize=1
size=1
stride=1
pad=1
filters=64
activation=leaky

[reorg]
stride=2

[route]
layers=-1,-4

[convolutional]
batch_normalize=1
size=3
stride=1
pad=1
filters=1024
activation=leaky

[convolutional]
size=1
stride=1
pad=1
filters=425
activation=linear

[region]
anchors = 0.57273, 0.677385, 1.87446, 2.06253, 3.33843, 5.47434, 7.88282, 3.52778, 9.77052, 9.16828
bias_match=1
classes=80
coords=4
num=5
softmax=1
jitter=.3
rescore=1
";

/// Weight elements per conv of YOLOv2, in conv order
pub const YOLOV2_WEIGHT_COUNTS: [usize; 23] = [
    864, 18432, 73728, 8192, 73728, 294912, 32768, 294912, 1179648, 131072, 1179648, 131072, 1179648, 4718592,
    524288, 4718592, 524288, 4718592, 9437184, 9437184, 32768, 11796480, 435200,
];

/// Bias elements per conv of YOLOv2, in conv order
pub const YOLOV2_BIAS_COUNTS: [usize; 23] = [
    32, 64, 128, 64, 128, 256, 128, 256, 512, 256, 512, 256, 512, 1024, 512, 1024, 512, 1024, 1024, 1024, 64,
    1024, 425,
];

/// Built-in networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    /// YOLOv2 at 416×416 on COCO
    Yolov2,
}

impl Preset {
    /// All presets
    pub const fn all() -> &'static [Self] {
        &[Self::Yolov2]
    }

    /// Short name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Yolov2 => "yolov2",
        }
    }

    /// Look a preset up by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// One-line description
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Yolov2 => "YOLOv2 416x416 COCO detector (80 classes, 5 anchors)",
        }
    }

    /// Darknet cfg text
    pub const fn cfg(&self) -> &'static str {
        match self {
            Self::Yolov2 => YOLOV2_CFG,
        }
    }

    /// Parse the preset network.
    ///
    /// # Errors
    ///
    /// Never fails for a built-in cfg; the error path is kept for parity
    /// with [`parse_cfg`].
    pub fn network(&self) -> Result<Network> {
        parse_cfg(self.cfg())
    }

    /// Arena size
    pub const fn arena(&self) -> ArenaConfig {
        match self {
            Self::Yolov2 => ArenaConfig {
                guard: crate::arena::DEFAULT_GUARD,
                capacity: crate::arena::DEFAULT_CAPACITY,
            },
        }
    }

    /// Shelves for tensors consumed out of order.
    ///
    /// Layer 16 feeds the passthrough route at 25; layers 24 and 27 are
    /// concatenated at 28 and are stacked so 27 ends where 24 starts.
    pub fn shelves(&self) -> Vec<ShelfSpec> {
        match self {
            Self::Yolov2 => vec![
                ShelfSpec {
                    producer: 16,
                    len: Shape::new(512, 26, 26).footprint(),
                },
                ShelfSpec {
                    producer: 24,
                    len: Shape::new(1024, 13, 13).footprint(),
                },
                ShelfSpec {
                    producer: 27,
                    len: Shape::new(256, 13, 13).footprint(),
                },
            ],
        }
    }

    /// Reference weight and bias sizes per conv
    pub const fn reference_counts(&self) -> (&'static [usize], &'static [usize]) {
        match self {
            Self::Yolov2 => (&YOLOV2_WEIGHT_COUNTS, &YOLOV2_BIAS_COUNTS),
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// The YOLOv2 preset network
///
/// # Errors
///
/// See [`Preset::network`].
pub fn yolov2() -> Result<Network> {
    Preset::Yolov2.network()
}

/// One expected file in a parameter directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamFile {
    /// File name
    pub name: &'static str,
    /// Full path
    pub path: PathBuf,
    /// Size on disk, if present
    pub bytes: Option<u64>,
    /// Whether inference fails without it
    pub required: bool,
}

/// Check which parameter files for precision `P` exist in `dir`.
///
/// Q tables are listed for fixed point only; they are optional.
pub fn inventory<P: Precision>(dir: impl AsRef<Path>) -> Vec<ParamFile> {
    let dir = dir.as_ref();
    let (weights, bias) = param_files::<P>();
    let mut names = vec![(weights, true), (bias, true)];
    if P::IS_FIXED {
        names.extend([(WEIGHT_Q_FILE, false), (BIAS_Q_FILE, false), (ACT_Q_FILE, false)]);
    }

    let files: Vec<ParamFile> = names
        .into_iter()
        .map(|(name, required)| {
            let path = dir.join(name);
            let bytes = std::fs::metadata(&path).ok().map(|m| m.len());
            debug!("{name}: {bytes:?}");
            ParamFile {
                name,
                path,
                bytes,
                required,
            }
        })
        .collect();
    info!(
        "Found {}/{} parameter files in {}",
        files.iter().filter(|f| f.bytes.is_some()).count(),
        files.len(),
        dir.display()
    );
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaPlan;
    use crate::layer::LayerKind;
    use crate::weights::{check_counts, ParamLayout};
    use yolo2_chip::{Fixed16, Float32};

    #[test]
    fn test_yolov2_layer_list() {
        let net = yolov2().unwrap();
        assert_eq!(net.len(), 32);
        assert_eq!(net.conv_count(), 23);
        assert_eq!(net.input(), Shape::new(3, 416, 416));
        assert_eq!(net.layer(16).unwrap().output, Shape::new(512, 26, 26));
        assert_eq!(net.layer(25).unwrap().kind, LayerKind::Route { sources: vec![16] });
        assert_eq!(net.layer(27).unwrap().output, Shape::new(256, 13, 13));
        assert_eq!(net.layer(28).unwrap().kind, LayerKind::Route { sources: vec![27, 24] });
        assert_eq!(net.layer(28).unwrap().output, Shape::new(1280, 13, 13));
        assert_eq!(net.layer(30).unwrap().output, Shape::new(425, 13, 13));
        assert!(matches!(
            net.layer(31).unwrap().kind,
            LayerKind::Region {
                classes: 80,
                coords: 4,
                num: 5,
                ..
            }
        ));
        assert_eq!(net.reorg_branch(), Some(24));
    }

    #[test]
    fn test_yolov2_parameter_sizes_match_reference() {
        let net = yolov2().unwrap();
        let layout = ParamLayout::of(&net);
        let (w, b) = Preset::Yolov2.reference_counts();
        check_counts(&layout, w, b).unwrap();
        assert_eq!(layout.weight_total(), w.iter().sum::<usize>());
    }

    #[test]
    fn test_yolov2_fits_default_arena() {
        let preset = Preset::Yolov2;
        let net = preset.network().unwrap();
        let plan = ArenaPlan::build(&net, preset.arena(), &preset.shelves()).unwrap();
        assert_eq!(plan.find_conflict(), None);
        // the first two layers fill the arena exactly
        assert_eq!(plan.output_of(1).unwrap().end(), plan.output_of(0).unwrap().offset);
        assert_eq!(plan.output_of(0).unwrap().end(), plan.bottom());
        let joined = plan.output_of(28).unwrap();
        assert_eq!(joined.offset, plan.shelf(27).unwrap().offset);
        assert_eq!(joined.len, Shape::new(1280, 13, 13).footprint());
        assert_eq!(plan.placement(31).unwrap().output, None);
    }

    #[test]
    fn test_shelves_hold_their_producers() {
        let preset = Preset::Yolov2;
        let net = preset.network().unwrap();
        for shelf in preset.shelves() {
            assert_eq!(shelf.len, net.layer(shelf.producer).unwrap().output.footprint());
        }
    }

    #[test]
    fn test_preset_names() {
        assert_eq!(Preset::from_name("YOLOv2"), Some(Preset::Yolov2));
        assert_eq!(Preset::from_name("yolov3"), None);
        assert_eq!(Preset::Yolov2.to_string(), "yolov2");
    }

    #[test]
    fn test_inventory_lists_precision_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bias_int16.bin"), [0_u8; 6]).unwrap();
        let fixed = inventory::<Fixed16>(dir.path());
        assert_eq!(fixed.len(), 5);
        assert_eq!(fixed[1].bytes, Some(6));
        assert!(fixed[0].bytes.is_none() && fixed[0].required);
        assert!(!fixed[4].required);

        let float = inventory::<Float32>(dir.path());
        assert_eq!(float.len(), 2);
        assert!(float.iter().all(|f| f.bytes.is_none()));
    }
}
