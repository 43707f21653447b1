//! Darknet `.cfg` parser
//!
//! Reads the section/option text format and resolves every layer's input
//! and output shape, the way darknet builds its layer list:
//!
//! - `[net]` supplies `width`, `height` and `channels`.
//! - `[convolutional]` padding is `size/2` when `pad=1`, else `padding`.
//! - `[maxpool]` ignores padding: `out = (in - size)/stride + 1`.
//! - `[route]` sources are relative (negative) or absolute; several sources
//!   concatenate channels and must agree spatially.
//! - `[region]` requires `c == num·(classes + coords + 1)`.

use crate::error::{ModelError, Result};
use crate::layer::{Activation, LayerDescriptor, LayerKind, Network};
use crate::shapes::Shape;
use std::path::Path;
use std::str::FromStr;

/// One `[section]` with its options
#[derive(Debug, Clone)]
struct Section {
    name: String,
    line: usize,
    options: Vec<(String, String, usize)>,
}

impl Section {
    fn find(&self, key: &str) -> Option<(&str, usize)> {
        self.options
            .iter()
            .rev()
            .find(|(k, _, _)| k == key)
            .map(|(_, v, line)| (v.as_str(), *line))
    }

    fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.find(key) {
            None => Ok(None),
            Some((raw, line)) => raw
                .parse()
                .map(Some)
                .map_err(|_| ModelError::parse(line, format!("[{}] {key}={raw} is not a valid value", self.name))),
        }
    }

    fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    fn require<T: FromStr>(&self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| ModelError::parse(self.line, format!("[{}] is missing `{key}`", self.name)))
    }

    fn list<T: FromStr>(&self, key: &str) -> Result<Vec<T>> {
        let Some((raw, line)) = self.find(key) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|_| ModelError::parse(line, format!("[{}] {key}: `{s}` is not a valid value", self.name)))
            })
            .collect()
    }
}

fn sections(text: &str) -> Result<Vec<Section>> {
    let mut out: Vec<Section> = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| ModelError::parse(line, format!("unterminated section header `{trimmed}`")))?;
            out.push(Section {
                name: name.trim().to_ascii_lowercase(),
                line,
                options: Vec::new(),
            });
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or_else(|| ModelError::parse(line, format!("expected key=value, got `{trimmed}`")))?;
        let section = out
            .last_mut()
            .ok_or_else(|| ModelError::parse(line, "option before any section"))?;
        section.options.push((key.trim().to_string(), value.trim().to_string(), line));
    }
    Ok(out)
}

/// Parse cfg text into a network.
///
/// # Errors
///
/// Returns [`ModelError::Parse`] for malformed text or missing required
/// options, and [`ModelError::InvalidLayer`] for geometry that does not
/// resolve.
pub fn parse_cfg(text: &str) -> Result<Network> {
    let mut sections = sections(text)?.into_iter();
    let net = sections
        .next()
        .filter(|s| s.name == "net" || s.name == "network")
        .ok_or_else(|| ModelError::parse(1, "cfg must start with [net]"))?;
    let input = Shape::new(net.require("channels")?, net.require("height")?, net.require("width")?);
    if input.is_empty() {
        return Err(ModelError::parse(net.line, format!("[net] input {input} is empty")));
    }
    tracing::debug!("Network input: {input}");

    let mut layers: Vec<LayerDescriptor> = Vec::new();
    let mut current = input;
    for section in sections {
        let index = layers.len();
        let layer = match section.name.as_str() {
            "convolutional" | "conv" => convolutional(&section, index, current)?,
            "maxpool" | "max" => maxpool(&section, index, current)?,
            "reorg" => reorg(&section, index, current)?,
            "route" => route(&section, index, &layers)?,
            "region" => region(&section, index, current)?,
            other => {
                return Err(ModelError::invalid_layer(index, format!("unsupported section [{other}]")));
            }
        };
        tracing::trace!(
            "Layer {index:2}: {:<6} {:>12} -> {:>12}",
            layer.kind,
            layer.input,
            layer.output
        );
        current = layer.output;
        layers.push(layer);
    }

    tracing::info!("Parsed {} layers, input {input}", layers.len());
    Ok(Network::new(input, layers))
}

/// Read and parse a cfg file.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed.
pub fn parse_cfg_file(path: impl AsRef<Path>) -> Result<Network> {
    let path = path.as_ref();
    tracing::info!("Loading network from: {}", path.display());
    parse_cfg(&std::fs::read_to_string(path)?)
}

fn convolutional(s: &Section, index: usize, input: Shape) -> Result<LayerDescriptor> {
    let filters: usize = s.require("filters")?;
    let size: usize = s.get_or("size", 1)?;
    let stride: usize = s.get_or("stride", 1)?;
    let pad = if s.get_or::<usize>("pad", 0)? == 1 {
        size / 2
    } else {
        s.get_or("padding", 0)?
    };
    let activation = match s.find("activation").map_or("logistic", |(v, _)| v) {
        "leaky" => Activation::Leaky,
        "linear" => Activation::Linear,
        other => {
            return Err(ModelError::invalid_layer(index, format!("unsupported activation `{other}`")));
        }
    };
    let batch_norm = s.get_or::<usize>("batch_normalize", 0)? != 0;

    if filters == 0 || size == 0 || stride == 0 {
        return Err(ModelError::invalid_layer(
            index,
            format!("filters {filters}, size {size}, stride {stride} must be non-zero"),
        ));
    }
    let out = |dim: usize| -> Result<usize> {
        (dim + 2 * pad)
            .checked_sub(size)
            .map(|span| span / stride + 1)
            .ok_or_else(|| ModelError::invalid_layer(index, format!("kernel {size} larger than padded input {input}")))
    };

    Ok(LayerDescriptor {
        index,
        kind: LayerKind::Convolutional {
            filters,
            size,
            stride,
            pad,
            activation,
            batch_norm,
        },
        input,
        output: Shape::new(filters, out(input.h)?, out(input.w)?),
    })
}

fn maxpool(s: &Section, index: usize, input: Shape) -> Result<LayerDescriptor> {
    let stride: usize = s.get_or("stride", 1)?;
    let size: usize = s.get_or("size", stride)?;
    if size == 0 || stride == 0 || size > input.w || size > input.h {
        return Err(ModelError::invalid_layer(
            index,
            format!("pool {size}/{stride} does not fit input {input}"),
        ));
    }
    Ok(LayerDescriptor {
        index,
        kind: LayerKind::MaxPool { size, stride },
        input,
        output: Shape::new(input.c, (input.h - size) / stride + 1, (input.w - size) / stride + 1),
    })
}

fn reorg(s: &Section, index: usize, input: Shape) -> Result<LayerDescriptor> {
    let stride: usize = s.get_or("stride", 1)?;
    if stride == 0 || input.w % stride != 0 || input.h % stride != 0 {
        return Err(ModelError::invalid_layer(
            index,
            format!("reorg stride {stride} does not divide input {input}"),
        ));
    }
    Ok(LayerDescriptor {
        index,
        kind: LayerKind::Reorg { stride },
        input,
        output: Shape::new(input.c * stride * stride, input.h / stride, input.w / stride),
    })
}

fn route(s: &Section, index: usize, layers: &[LayerDescriptor]) -> Result<LayerDescriptor> {
    let raw: Vec<i64> = s.list("layers")?;
    if raw.is_empty() {
        return Err(ModelError::parse(s.line, "[route] is missing `layers`"));
    }
    let sources = raw
        .iter()
        .map(|&r| {
            let absolute = if r < 0 {
                i64::try_from(index).ok().map(|i| i + r)
            } else {
                Some(r)
            };
            absolute
                .and_then(|a| usize::try_from(a).ok())
                .filter(|&a| a < index)
                .ok_or_else(|| ModelError::invalid_layer(index, format!("route source {r} out of range")))
        })
        .collect::<Result<Vec<usize>>>()?;

    let first = layers[sources[0]].output;
    let mut channels = 0;
    for &src in &sources {
        let shape = layers[src].output;
        if (shape.h, shape.w) != (first.h, first.w) {
            return Err(ModelError::invalid_layer(
                index,
                format!("route sources disagree: {first} vs {shape} (layer {src})"),
            ));
        }
        channels += shape.c;
    }

    Ok(LayerDescriptor {
        index,
        kind: LayerKind::Route { sources },
        input: first,
        output: Shape::new(channels, first.h, first.w),
    })
}

fn region(s: &Section, index: usize, input: Shape) -> Result<LayerDescriptor> {
    let classes: usize = s.get_or("classes", 20)?;
    let coords: usize = s.get_or("coords", 4)?;
    let num: usize = s.get_or("num", 1)?;
    let anchors: Vec<f32> = s.list("anchors")?;
    let expected = num * (classes + coords + 1);
    if input.c != expected {
        return Err(ModelError::invalid_layer(
            index,
            format!("region needs {expected} channels ({num} x ({classes} + {coords} + 1)), input has {}", input.c),
        ));
    }
    if anchors.len() != 2 * num {
        return Err(ModelError::invalid_layer(
            index,
            format!("region has {} anchor values, needs {}", anchors.len(), 2 * num),
        ));
    }
    Ok(LayerDescriptor {
        index,
        kind: LayerKind::Region {
            classes,
            coords,
            num,
            anchors,
        },
        input,
        output: input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = "
[net]
# comment
width=8
height=8
channels=3

[convolutional]
batch_normalize=1
filters=4
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
filters=2
size=1
stride=1
pad=1
activation=linear

[reorg]
stride=2

[route]
layers=-3

[route]
layers=-1,2
";

    #[test]
    fn test_parse_tiny_network() {
        let net = parse_cfg(TINY).unwrap();
        assert_eq!(net.input(), Shape::new(3, 8, 8));
        assert_eq!(net.len(), 6);

        let shapes: Vec<Shape> = net.layers().iter().map(|l| l.output).collect();
        assert_eq!(
            shapes,
            vec![
                Shape::new(4, 8, 8),
                Shape::new(4, 4, 4),
                Shape::new(2, 4, 4),
                Shape::new(8, 2, 2),
                Shape::new(4, 4, 4),
                Shape::new(6, 4, 4),
            ]
        );
        // size=1 with pad=1 means size/2 = 0
        match net.layers()[2].kind {
            LayerKind::Convolutional { pad, activation, .. } => {
                assert_eq!(pad, 0);
                assert_eq!(activation, Activation::Linear);
            }
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(net.layers()[4].kind, LayerKind::Route { sources: vec![1] });
        assert_eq!(net.layers()[5].kind, LayerKind::Route { sources: vec![4, 2] });
    }

    #[test]
    fn test_route_requires_matching_spatial_dims() {
        // the reorg (2x2) and the pool (4x4) cannot be concatenated
        let cfg = format!("{TINY}\n[route]\nlayers=3,1\n");
        let err = parse_cfg(&cfg).unwrap_err();
        assert!(matches!(err, ModelError::InvalidLayer { index: 6, .. }), "{err}");
    }

    #[test]
    fn test_route_source_must_precede() {
        let cfg = format!("{TINY}\n[route]\nlayers=-7\n");
        assert!(matches!(parse_cfg(&cfg), Err(ModelError::InvalidLayer { index: 6, .. })));
        let cfg = format!("{TINY}\n[route]\nlayers=6\n");
        assert!(matches!(parse_cfg(&cfg), Err(ModelError::InvalidLayer { index: 6, .. })));
    }

    #[test]
    fn test_missing_filters_reports_section_line() {
        let err = parse_cfg("[net]\nwidth=4\nheight=4\nchannels=1\n[convolutional]\nsize=3\n").unwrap_err();
        assert!(matches!(err, ModelError::Parse { line: 5, .. }), "{err}");
    }

    #[test]
    fn test_bad_value_reports_option_line() {
        let err = parse_cfg("[net]\nwidth=four\nheight=4\nchannels=1\n").unwrap_err();
        assert!(matches!(err, ModelError::Parse { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_maxpool_ignores_padding() {
        let net = parse_cfg("[net]\nwidth=13\nheight=13\nchannels=2\n[maxpool]\nsize=2\nstride=2\npadding=1\n").unwrap();
        assert_eq!(net.output_shape(), Shape::new(2, 6, 6));
    }

    #[test]
    fn test_region_checks_channels_and_anchors() {
        let head = "[net]\nwidth=2\nheight=2\nchannels=3\n[convolutional]\nfilters=14\nsize=1\nactivation=linear\n";
        let ok = format!("{head}[region]\nclasses=2\ncoords=4\nnum=2\nanchors=1,1, 2,2\n");
        let net = parse_cfg(&ok).unwrap();
        assert!(matches!(net.layers()[1].kind, LayerKind::Region { num: 2, classes: 2, .. }));

        let wrong_classes = format!("{head}[region]\nclasses=3\ncoords=4\nnum=2\nanchors=1,1,2,2\n");
        assert!(matches!(parse_cfg(&wrong_classes), Err(ModelError::InvalidLayer { index: 1, .. })));
        let short_anchors = format!("{head}[region]\nclasses=2\ncoords=4\nnum=2\nanchors=1,1\n");
        assert!(matches!(parse_cfg(&short_anchors), Err(ModelError::InvalidLayer { index: 1, .. })));
    }

    #[test]
    fn test_unsupported_section_and_activation() {
        let head = "[net]\nwidth=4\nheight=4\nchannels=1\n";
        assert!(matches!(
            parse_cfg(&format!("{head}[shortcut]\nfrom=-1\n")),
            Err(ModelError::InvalidLayer { index: 0, .. })
        ));
        assert!(matches!(
            parse_cfg(&format!("{head}[convolutional]\nfilters=1\nactivation=mish\n")),
            Err(ModelError::InvalidLayer { index: 0, .. })
        ));
        assert!(matches!(parse_cfg("[convolutional]\nfilters=1\n"), Err(ModelError::Parse { .. })));
    }

    #[test]
    fn test_parse_cfg_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.cfg");
        std::fs::write(&path, TINY).unwrap();
        assert_eq!(parse_cfg_file(&path).unwrap().len(), 6);
        assert!(matches!(parse_cfg_file(dir.path().join("absent.cfg")), Err(ModelError::Io { .. })));
    }
}
