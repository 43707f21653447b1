//! `yolo2`: command-line interface for the YOLOv2 accelerator.
//!
//! ```text
//! USAGE:
//!   yolo2 run --params <dir> --input <f32> --output <f32>   Run one image
//!   yolo2 plan                                              Print the arena plan
//!   yolo2 geometry [--layer N]                              Tiling and register programs
//!   yolo2 status                                            Read AP_CTRL on the FPGA
//!   yolo2 peek <offset>                                     Read a control register
//!   yolo2 poke <offset> <value>                             Write a control register
//! ```
//!
//! Verbosity: `RUST_LOG` wins, then `YOLO2_VERBOSE` (0 warn, 1 info,
//! 2 debug, 3 trace), then `-v` on the command line.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use yolo2_chip::regs::{self, gpio_program, register_program};
use yolo2_chip::{BufferAddrs, ControlJob, Fixed16, Float32, Precision, QValues};
use yolo2_driver::{
    hardware_present, select_backend, BackendSelection, DispatchConfig, ExecutionBackend, HandshakeConfig,
    JobDispatcher, RegisterBackend,
};
use yolo2_models::arena::Tensor;
use yolo2_models::zoo::inventory;
use yolo2_models::{
    parse_cfg_file, ArenaConfig, ArenaPlan, LayerKind, Network, Preset, QuantTables, Sequencer, SequencerConfig,
};

#[derive(Parser)]
#[command(name = "yolo2", about = "YOLOv2 FPGA accelerator CLI", version)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run one image through the network.
    Run(RunArgs),
    /// Print where every feature map lives in the arena.
    Plan {
        #[command(flatten)]
        net: NetArgs,
        /// Elements below the arena (default from the preset).
        #[arg(long)]
        guard: Option<usize>,
        /// Arena capacity in elements (default from the preset).
        #[arg(long)]
        capacity: Option<usize>,
    },
    /// Print per-layer tile geometry, or one layer's register program.
    Geometry {
        #[command(flatten)]
        net: NetArgs,
        /// Layer whose register program to print.
        #[arg(long)]
        layer: Option<usize>,
        /// Directory with Q tables for the GPIO words.
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Read the accelerator handshake register (requires root).
    Status,
    /// Read a control-block register (requires root).
    Peek {
        /// Byte offset, decimal or 0x-prefixed.
        #[arg(value_parser = parse_number)]
        offset: u64,
    },
    /// Write a control-block register (requires root).
    Poke {
        /// Byte offset, decimal or 0x-prefixed.
        #[arg(value_parser = parse_number)]
        offset: u64,
        /// Value, decimal or 0x-prefixed.
        #[arg(value_parser = parse_number)]
        value: u64,
    },
}

#[derive(Args)]
struct NetArgs {
    /// Built-in network; also supplies the arena layout.
    #[arg(long, default_value = "yolov2", value_parser = parse_preset)]
    preset: Preset,
    /// Darknet cfg to use instead of the preset's own.
    #[arg(long)]
    cfg: Option<PathBuf>,
}

impl NetArgs {
    fn network(&self) -> Result<Network> {
        match &self.cfg {
            Some(path) => parse_cfg_file(path).with_context(|| format!("parsing {}", path.display())),
            None => self.preset.network().context("building preset network"),
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    net: NetArgs,
    /// Directory with packed weights, bias and Q tables.
    #[arg(long)]
    params: PathBuf,
    /// Raw little-endian f32 image, [C][H][W].
    #[arg(long)]
    input: PathBuf,
    /// Where to write the raw f32 output.
    #[arg(long)]
    output: PathBuf,
    /// Use the 32-bit floating-point datapath (software only).
    #[arg(long)]
    float: bool,
    /// Backend to run on.
    #[arg(long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    /// FPGA when present, otherwise software.
    Auto,
    /// Software model of the datapath.
    Software,
    /// FPGA register backend.
    Fpga,
}

impl From<BackendArg> for BackendSelection {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => Self::Auto,
            BackendArg::Software => Self::Software,
            BackendArg::Fpga => Self::Register,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Cmd::Run(args) => {
            if args.float {
                cmd_run::<Float32>(&args)?;
            } else {
                cmd_run::<Fixed16>(&args)?;
            }
        }
        Cmd::Plan { net, guard, capacity } => cmd_plan(&net, guard, capacity)?,
        Cmd::Geometry { net, layer, params } => cmd_geometry(&net, layer, params.as_deref())?,
        Cmd::Status => cmd_status()?,
        Cmd::Peek { offset } => cmd_peek(offset)?,
        Cmd::Poke { offset, value } => cmd_poke(offset, value)?,
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("YOLO2_VERBOSE")
            .ok()
            .and_then(|v| v.trim().parse::<u8>().ok())
            .unwrap_or(verbose);
        EnvFilter::new(match level {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cmd_run<P: Precision>(args: &RunArgs) -> Result<()> {
    let network = args.net.network()?;

    let files = inventory::<P>(&args.params);
    for f in &files {
        tracing::debug!("{:<24} {:?} bytes (required: {})", f.name, f.bytes, f.required);
    }
    let missing: Vec<_> = files
        .iter()
        .filter(|f| f.required && f.bytes.is_none())
        .map(|f| f.name)
        .collect();
    if !missing.is_empty() {
        bail!("{} is missing {}", args.params.display(), missing.join(", "));
    }

    let image = read_f32(&args.input)?;
    let config = DispatchConfig::from_env();
    let platform = select_backend::<P>(args.backend.into(), &config.handshake).context("opening backend")?;
    println!("Backend   : {} ({})", platform.backend.backend_type(), P::NAME);
    println!("Allocator : {}", platform.allocator.name());

    let mut seq_config = SequencerConfig::for_preset(args.net.preset);
    if args.net.cfg.is_some() {
        // reference sizes describe the preset's own cfg only
        seq_config.reference_counts = None;
    }
    let dispatcher = JobDispatcher::new(platform, config);
    let mut sequencer = Sequencer::<P>::from_dir(network, &args.params, seq_config, dispatcher)
    .with_context(|| format!("loading parameters from {}", args.params.display()))?;

    let output = sequencer.run(&image).context("inference failed")?;
    write_f32(&args.output, &output.data)?;

    println!();
    println!("  #  kind      wall ms   device ms");
    for t in &output.timings {
        let device = t
            .device
            .map_or_else(|| "-".to_string(), |d| format!("{:.3}", d.as_secs_f64() * 1e3));
        println!(
            "{:>3}  {:<6} {:>10.3} {:>11}",
            t.index,
            t.kind,
            t.elapsed.as_secs_f64() * 1e3,
            device
        );
    }
    println!();
    println!(
        "Output {} at Q{} -> {} ({} values)",
        output.shape,
        output.q_out,
        args.output.display(),
        output.data.len()
    );
    println!(
        "Device {:.1} ms, total {:.1} ms",
        output.device_time().as_secs_f64() * 1e3,
        output.total.as_secs_f64() * 1e3
    );
    Ok(())
}

fn cmd_plan(net: &NetArgs, guard: Option<usize>, capacity: Option<usize>) -> Result<()> {
    let network = net.network()?;
    let defaults = net.preset.arena();
    let config = ArenaConfig {
        guard: guard.unwrap_or(defaults.guard),
        capacity: capacity.unwrap_or(defaults.capacity),
    };
    let shelves = net.preset.shelves();
    let plan = ArenaPlan::build(&network, config, &shelves).context("planning arena")?;

    println!("{}: {}", net.preset, net.preset.description());
    println!(
        "Arena     : {} elements ({} KiB at 16 bit), guard {}, usable [{}, {})",
        plan.total_elements(),
        plan.total_elements() * 2 / 1024,
        config.guard,
        plan.top(),
        plan.bottom()
    );
    println!("Input     : {}", plan.input());
    println!();
    println!("  #  kind   output          input                 output");
    for (layer, placement) in network.layers().iter().zip(plan.placements()) {
        let show = |s: Option<yolo2_models::Span>| s.map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:>3}  {:<6} {:<15} {:<21} {}",
            layer.index,
            layer.kind,
            layer.output.to_string(),
            show(placement.input),
            show(placement.output)
        );
    }
    println!();
    for shelf in &shelves {
        if let Some(span) = plan.shelf(shelf.producer) {
            println!("Shelf     : layer {:>2} {span}", shelf.producer);
        }
    }
    match plan.find_conflict() {
        None => println!("Conflicts : none"),
        Some((a, b)) => {
            let name = |t: Tensor| match t {
                Tensor::Input => "input".to_string(),
                Tensor::Layer(i) => format!("layer {i}"),
            };
            bail!(
                "{} {} overlaps {} {} while both are live",
                name(a.tensor),
                a.span,
                name(b.tensor),
                b.span
            );
        }
    }
    Ok(())
}

fn cmd_geometry(net: &NetArgs, layer: Option<usize>, params: Option<&Path>) -> Result<()> {
    let network = net.network()?;

    let Some(index) = layer else {
        println!("  #  kind   input           type    TM  TN  TR  TC  bound");
        for l in network.layers() {
            let geometry = l
                .tile_geometry()
                .with_context(|| format!("tiling layer {}", l.index))?;
            match geometry {
                Some(g) => println!(
                    "{:>3}  {:<6} {:<15} {:<6} {:>3} {:>3} {:>3} {:>3} {:>6}",
                    l.index,
                    l.kind,
                    l.input.to_string(),
                    g.kind,
                    g.tm,
                    g.tn,
                    g.tr,
                    g.tc,
                    g.bounds.ofm_bound
                ),
                None => println!("{:>3}  {:<6} {:<15} (host)", l.index, l.kind, l.input.to_string()),
            }
        }
        return Ok(());
    };

    let l = network
        .layer(index)
        .with_context(|| format!("network has {} layers", network.len()))?;
    let g = l
        .tile_geometry()
        .with_context(|| format!("tiling layer {index}"))?
        .with_context(|| format!("layer {index} ({}) runs on the host", l.kind))?;

    let job = match &l.kind {
        LayerKind::Convolutional {
            activation,
            batch_norm,
            ..
        } => {
            let q = match (params, network.conv_ordinal(index)) {
                (Some(dir), Some(ordinal)) => QuantTables::load(dir, network.conv_count())?.conv(ordinal),
                _ => QValues::default(),
            };
            ControlJob::conv(
                g,
                BufferAddrs::default(),
                *activation == yolo2_models::Activation::Leaky,
                *batch_norm,
                q,
            )
        }
        _ => ControlJob::data_movement(g, 0, 0),
    };
    job.validate().with_context(|| format!("layer {index} exceeds the datapath"))?;

    println!("Layer {index}: {} {} -> {}", l.kind, l.input, l.output);
    for (offset, value) in register_program(&job) {
        println!("  {offset:#06x}  {:<15} {value:#010x} ({value})", regs::name(offset).unwrap_or("?"));
    }
    match gpio_program(&job.q) {
        Some(words) => {
            for (name, word) in ["weight", "act_in", "act_out", "bias"].iter().zip(words) {
                println!("  gpio    Q {name:<9} {word:#010x}");
            }
        }
        None => println!("  gpio    untouched (all Q zero)"),
    }
    Ok(())
}

fn open_fpga() -> Result<RegisterBackend> {
    if !hardware_present() {
        bail!("no accelerator: /dev/mem or the u-dma-buf carve-out is missing");
    }
    RegisterBackend::open(HandshakeConfig::default()).context("mapping control registers (root required)")
}

fn cmd_status() -> Result<()> {
    let mut backend = open_fpga()?;
    let status = backend.status()?;
    println!("AP_CTRL : {status}");
    println!(
        "State   : {}",
        if status.is_busy() {
            "busy"
        } else if status.is_done() {
            "done"
        } else {
            "idle"
        }
    );
    Ok(())
}

fn register_offset(offset: u64) -> Result<usize> {
    let offset = usize::try_from(offset)?;
    if offset % 4 != 0 || offset >= regs::SPAN {
        bail!("offset {offset:#x} is not a register (aligned, below {:#x})", regs::SPAN);
    }
    Ok(offset)
}

fn cmd_peek(offset: u64) -> Result<()> {
    let offset = register_offset(offset)?;
    let mut backend = open_fpga()?;
    let value = backend.read_register(offset)?;
    println!("{offset:#06x} {:<15} = {value:#010x} ({value})", regs::name(offset).unwrap_or("?"));
    Ok(())
}

fn cmd_poke(offset: u64, value: u64) -> Result<()> {
    let offset = register_offset(offset)?;
    let value = u32::try_from(value).context("value does not fit 32 bits")?;
    let mut backend = open_fpga()?;
    backend.write_register(offset, value)?;
    println!("{offset:#06x} {:<15} <- {value:#010x}", regs::name(offset).unwrap_or("?"));
    Ok(())
}

fn read_f32(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() % 4 != 0 {
        bail!("{}: {} bytes is not a whole number of f32", path.display(), bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn write_f32(path: &Path, data: &[f32]) -> Result<()> {
    std::fs::write(path, bytemuck::cast_slice::<f32, u8>(data)).with_context(|| format!("writing {}", path.display()))
}

fn parse_preset(s: &str) -> Result<Preset, String> {
    Preset::from_name(s).ok_or_else(|| {
        let known: Vec<_> = Preset::all().iter().map(Preset::name).collect();
        format!("unknown preset '{s}' (known: {})", known.join(", "))
    })
}

fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{s}': {e}"))
}
