//! End-to-end runs of a miniature passthrough network on the software
//! backend, checked against a dense floating-point reference.

use yolo2_chip::{Fixed16, Float32, Precision};
use yolo2_driver::{select_backend, BackendSelection, DispatchConfig, HandshakeConfig, JobDispatcher};
use yolo2_models::host::{quantize, space_to_depth};
use yolo2_models::{
    parse_cfg, ArenaConfig, ConvParams, LayerKind, ModelError, Network, Preset, QuantTables, Sequencer,
    SequencerConfig, Shape, ShelfSpec, WeightStore,
};

// conv, pool, shelved conv, pool, shelved branch conv, route back, conv,
// reorg, concat, conv, detector conv, region
const PASSTHROUGH: &str = "
[net]
width=8
height=8
channels=3
[convolutional]
filters=4
size=3
pad=1
activation=leaky
[maxpool]
size=2
stride=2
[convolutional]
filters=4
size=3
pad=1
activation=leaky
[maxpool]
size=2
stride=2
[convolutional]
filters=8
size=3
pad=1
activation=leaky
[route]
layers=-3
[convolutional]
filters=2
size=1
activation=leaky
[reorg]
stride=2
[route]
layers=-1,-4
[convolutional]
filters=8
size=3
pad=1
activation=leaky
[convolutional]
filters=12
size=1
activation=linear
[region]
classes=1
coords=4
num=2
anchors=1,1,2,2
";

fn pattern(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1 << 23) as f32 - 1.0
        })
        .collect()
}

fn network() -> Network {
    parse_cfg(PASSTHROUGH).unwrap()
}

fn config() -> SequencerConfig {
    SequencerConfig {
        arena: ArenaConfig {
            guard: 64,
            capacity: 2048,
        },
        shelves: vec![
            ShelfSpec {
                producer: 2,
                len: Shape::new(4, 4, 4).footprint(),
            },
            ShelfSpec {
                producer: 4,
                len: Shape::new(8, 2, 2).footprint(),
            },
            ShelfSpec {
                producer: 7,
                len: Shape::new(8, 2, 2).footprint(),
            },
        ],
        branch_layer: None,
        reference_counts: None,
    }
}

/// Canonical parameters scaled so activations stay around 1.
fn params(net: &Network) -> Vec<ConvParams<f32>> {
    net.layers()
        .iter()
        .filter_map(|l| match l.kind {
            LayerKind::Convolutional { filters, size, .. } => {
                let fan_in = l.input.c * size * size;
                let scale = 1.0 / (fan_in as f32).sqrt();
                let seed = u32::try_from(l.index).unwrap();
                Some(ConvParams {
                    weights: pattern(filters * fan_in, seed).iter().map(|w| w * scale).collect(),
                    bias: pattern(filters, seed + 100).iter().map(|b| b * 0.1).collect(),
                })
            }
            _ => None,
        })
        .collect()
}

fn image() -> Vec<f32> {
    pattern(3 * 8 * 8, 7)
}

/// Dense float interpretation of the network.
fn reference(net: &Network, params: &[ConvParams<f32>], image: &[f32]) -> Vec<f32> {
    let mut outputs: Vec<Vec<f32>> = Vec::new();
    let mut convs = params.iter();
    let mut result = Vec::new();
    for layer in net.layers() {
        let x: &[f32] = if layer.index == 0 { image } else { &outputs[layer.index - 1] };
        let s = layer.input;
        let o = layer.output;
        let out = match &layer.kind {
            LayerKind::Convolutional {
                filters,
                size: k,
                stride,
                pad,
                activation,
                ..
            } => {
                let p = convs.next().unwrap();
                let mut out = vec![0.0_f32; o.elements()];
                for f in 0..*filters {
                    for y in 0..o.h {
                        for xo in 0..o.w {
                            let mut acc = p.bias[f];
                            for i in 0..s.c {
                                for ky in 0..*k {
                                    for kx in 0..*k {
                                        let iy = (y * stride + ky).checked_sub(*pad).filter(|&v| v < s.h);
                                        let ix = (xo * stride + kx).checked_sub(*pad).filter(|&v| v < s.w);
                                        if let (Some(iy), Some(ix)) = (iy, ix) {
                                            acc += p.weights[((f * s.c + i) * k + ky) * k + kx]
                                                * x[(i * s.h + iy) * s.w + ix];
                                        }
                                    }
                                }
                            }
                            if *activation == yolo2_models::Activation::Leaky && acc < 0.0 {
                                acc *= 0.1;
                            }
                            out[(f * o.h + y) * o.w + xo] = acc;
                        }
                    }
                }
                out
            }
            LayerKind::MaxPool { size, stride } => {
                let mut out = vec![0.0_f32; o.elements()];
                for c in 0..o.c {
                    for y in 0..o.h {
                        for xo in 0..o.w {
                            let mut m = f32::MIN;
                            for dy in 0..*size {
                                for dx in 0..*size {
                                    m = m.max(x[(c * s.h + y * stride + dy) * s.w + xo * stride + dx]);
                                }
                            }
                            out[(c * o.h + y) * o.w + xo] = m;
                        }
                    }
                }
                out
            }
            LayerKind::Reorg { stride } => space_to_depth(x, s, *stride).unwrap(),
            LayerKind::Route { sources } => sources.iter().flat_map(|&src| outputs[src].clone()).collect(),
            LayerKind::Region { .. } => {
                result = x.to_vec();
                Vec::new()
            }
        };
        outputs.push(out);
    }
    result
}

fn dispatcher<P: Precision>() -> JobDispatcher {
    let platform = select_backend::<P>(BackendSelection::Software, &HandshakeConfig::default()).unwrap();
    JobDispatcher::new(platform, DispatchConfig::default())
}

fn max_error(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn fixed_sequencer(act: Vec<i32>) -> Sequencer<Fixed16> {
    let net = network();
    let canonical = params(&net);
    let quantized: Vec<ConvParams<i16>> = canonical
        .iter()
        .map(|p| ConvParams {
            weights: quantize::<Fixed16>(&p.weights, 14),
            bias: quantize::<Fixed16>(&p.bias, 12),
        })
        .collect();
    let store = WeightStore::from_layers::<Fixed16>(&net, &quantized).unwrap();
    let quant = QuantTables {
        weight: vec![14; 6],
        bias: vec![12; 6],
        act,
    };
    Sequencer::new(net, store, quant, config(), dispatcher::<Fixed16>()).unwrap()
}

#[test]
fn float_run_matches_reference() {
    let net = network();
    let canonical = params(&net);
    let expect = reference(&net, &canonical, &image());

    let store = WeightStore::from_layers::<Float32>(&net, &canonical).unwrap();
    let mut seq = Sequencer::<Float32>::new(net, store, QuantTables::zero(), config(), dispatcher::<Float32>()).unwrap();
    assert_eq!(seq.branch_layer(), Some(4));

    let out = seq.run(&image()).unwrap();
    assert_eq!(out.shape, Shape::new(12, 2, 2));
    assert_eq!(out.data.len(), 48);
    let err = max_error(&out.data, &expect);
    assert!(err < 1e-4, "float error {err}");

    assert_eq!(out.timings.len(), 12);
    for t in &out.timings {
        let on_device = matches!(t.kind, "conv" | "max");
        assert_eq!(t.device.is_some(), on_device, "layer {} ({})", t.index, t.kind);
    }
    // 6 convs and 2 pools went through the dispatcher
    assert_eq!(seq.dispatcher().dispatched(), 8);

    // a second image reuses the same buffers
    let again = seq.run(&image()).unwrap();
    assert_eq!(again.data, out.data);
}

#[test]
fn fixed_run_aligns_reorg_down_to_branch() {
    // conv outputs: L0 10, L2 12, L4 (branch) 9, L6 11, L9 10, L10 10
    let mut seq = fixed_sequencer(vec![10, 10, 12, 9, 11, 10, 10]);
    let net = network();
    let expect = reference(&net, &params(&net), &image());

    let out = seq.run(&image()).unwrap();
    assert_eq!(out.q_out, 10);
    assert_eq!(out.layer_q[4], Some(9));
    // the route back to layer 2 re-exposes Q12 for layer 6's input
    assert_eq!(out.layer_q[5], Some(12));
    assert_eq!(out.layer_q[6], Some(11));
    // reorg output shifted from Q11 down to the branch's Q9
    assert_eq!(out.layer_q[7], Some(9));
    assert_eq!(out.layer_q[8], Some(9));

    let err = max_error(&out.data, &expect);
    assert!(err < 0.03, "fixed error {err}");
}

#[test]
fn fixed_run_shifts_branch_when_reorg_is_lower() {
    // branch at Q12, reorg input at Q9: the shelved branch is shifted in place
    let mut seq = fixed_sequencer(vec![10, 10, 12, 12, 9, 10, 10]);
    let net = network();
    let expect = reference(&net, &params(&net), &image());

    let out = seq.run(&image()).unwrap();
    assert_eq!(out.layer_q[4], Some(12));
    assert_eq!(out.layer_q[7], Some(9));
    let err = max_error(&out.data, &expect);
    assert!(err < 0.03, "fixed error {err}");
}

#[test]
fn wrong_image_size_is_rejected() {
    let mut seq = fixed_sequencer(vec![10; 7]);
    let err = seq.run(&[0.0; 10]).unwrap_err();
    assert!(matches!(
        err,
        ModelError::ShapeMismatch {
            expected: 192,
            actual: 10,
            ..
        }
    ));
}

#[test]
fn parameters_must_match_precision() {
    let net = network();
    let store = WeightStore::from_layers::<Float32>(&net, &params(&net)).unwrap();
    let err = Sequencer::<Fixed16>::new(net, store, QuantTables::zero(), config(), dispatcher::<Fixed16>())
        .unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { expected: 2, actual: 4, .. }));
}

#[test]
fn parameters_must_match_reference_sizes() {
    let net = network();
    let store = WeightStore::from_layers::<Float32>(&net, &params(&net)).unwrap();
    let config = SequencerConfig {
        reference_counts: Some(Preset::Yolov2.reference_counts()),
        ..config()
    };
    let err = Sequencer::<Float32>::new(net, store, QuantTables::zero(), config, dispatcher::<Float32>()).unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { expected: 6, actual: 23, .. }));
}

#[test]
fn reference_sizes_accept_matching_parameters() {
    let net = network();
    let store = WeightStore::from_layers::<Float32>(&net, &params(&net)).unwrap();
    let counts = store.layout().counts.clone();
    let weights: &'static [usize] = counts.iter().map(|c| c.0).collect::<Vec<_>>().leak();
    let bias: &'static [usize] = counts.iter().map(|c| c.1).collect::<Vec<_>>().leak();
    let config = SequencerConfig {
        reference_counts: Some((weights, bias)),
        ..config()
    };
    assert!(Sequencer::<Float32>::new(net, store, QuantTables::zero(), config, dispatcher::<Float32>()).is_ok());
}

#[test]
#[ignore] // Requires hardware and exported parameters in $YOLO2_PARAMS
fn yolov2_on_device() {
    let dir = std::env::var("YOLO2_PARAMS").unwrap();
    let preset = Preset::Yolov2;
    let config = DispatchConfig::from_env();
    let platform = select_backend::<Fixed16>(BackendSelection::Register, &config.handshake).unwrap();
    let dispatcher = JobDispatcher::new(platform, config);
    let mut seq = Sequencer::<Fixed16>::from_dir(
        preset.network().unwrap(),
        dir,
        SequencerConfig::for_preset(preset),
        dispatcher,
    )
    .unwrap();

    let out = seq.run(&vec![0.5; 3 * 416 * 416]).unwrap();
    assert_eq!(out.shape, Shape::new(425, 13, 13));
    assert!(out.data.iter().all(|v| v.is_finite()));
}
