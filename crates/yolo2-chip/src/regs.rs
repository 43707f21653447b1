//! Control-block register map.
//!
//! The accelerator exposes one AXI-Lite control block (see
//! [`crate::window::control`]) laid out by the HLS interface synthesis:
//!
//! ```text
//! 0x00        AP_CTRL      start / done / idle / ready handshake
//! 0x10..0x3c  addresses    four 64-bit DDR addresses, lo/hi word pairs
//! 0x40..0xd0  scalars      one 32-bit word per parameter, 8-byte stride
//! ```
//!
//! The four Q values do not fit the control block and travel through four
//! single-channel AXI GPIO blocks instead (see [`crate::window::gpio`]).

use crate::geometry::{LayerType, LoopBounds, TileGeometry};
use crate::job::{BufferAddrs, ControlJob, QValues, Violation};

// ── Handshake ────────────────────────────────────────────────────────────────

/// Block-level handshake register. DONE and READY clear on read.
pub const AP_CTRL: usize = 0x00;

/// `AP_CTRL` bit definitions.
pub mod ap_ctrl {
    /// Start a run; self-clears when the block accepts it.
    pub const START: u32 = 1 << 0;
    /// Run finished (clear on read).
    pub const DONE: u32 = 1 << 1;
    /// Block idle.
    pub const IDLE: u32 = 1 << 2;
    /// Block ready for new inputs (clear on read).
    pub const READY: u32 = 1 << 3;
}

// ── Addresses ────────────────────────────────────────────────────────────────

/// Input feature map address, low word (high word at +4).
pub const INPUT_ADDR: usize = 0x10;
/// Output feature map address.
pub const OUTPUT_ADDR: usize = 0x1c;
/// Weight stream address.
pub const WEIGHT_ADDR: usize = 0x28;
/// Bias address.
pub const BETA_ADDR: usize = 0x34;

// ── Layer scalars ────────────────────────────────────────────────────────────

/// Input channel count.
pub const IFM_NUM: usize = 0x40;
/// Output channel count.
pub const OFM_NUM: usize = 0x48;
/// Kernel size.
pub const KSIZE: usize = 0x50;
/// Kernel stride.
pub const KSTRIDE: usize = 0x58;
/// Input width.
pub const INPUT_W: usize = 0x60;
/// Input height.
pub const INPUT_H: usize = 0x68;
/// Output width.
pub const OUTPUT_W: usize = 0x70;
/// Output height.
pub const OUTPUT_H: usize = 0x78;
/// Zero padding.
pub const PADDING: usize = 0x80;
/// Leaky activation enable.
pub const IS_NL: usize = 0x88;
/// Batch-norm enable.
pub const IS_BN: usize = 0x90;
/// Channel tile.
pub const TM: usize = 0x98;
/// Input channel tile.
pub const TN: usize = 0xa0;
/// Row tile.
pub const TR: usize = 0xa8;
/// Column tile.
pub const TC: usize = 0xb0;
/// Channel-loop bound.
pub const OFM_NUM_BOUND: usize = 0xb8;
/// `mLoops · TM`.
pub const MLOOPS_X_TM: usize = 0xc0;
/// `(mLoops + 1) · TM`.
pub const MLOOPS_A1_X_TM: usize = 0xc8;
/// Layer-kind tag.
pub const LAYER_TYPE: usize = 0xd0;

/// One past the last register used.
pub const SPAN: usize = LAYER_TYPE + 4;

/// Data register offset inside each Q GPIO block.
pub const GPIO_DATA: usize = 0x00;

/// Ordered `(offset, value)` control-block writes for a job, excluding
/// `AP_CTRL`.
#[must_use]
pub fn register_program(job: &ControlJob) -> Vec<(usize, u32)> {
    let g = &job.geometry;
    let mut writes = Vec::with_capacity(27);

    for (offset, addr) in [
        (INPUT_ADDR, job.addrs.input),
        (OUTPUT_ADDR, job.addrs.output),
        (WEIGHT_ADDR, job.addrs.weight),
        (BETA_ADDR, job.addrs.bias),
    ] {
        let (lo, hi) = split_addr(addr);
        writes.push((offset, lo));
        writes.push((offset + 4, hi));
    }

    for (offset, value) in [
        (IFM_NUM, g.in_channels),
        (OFM_NUM, g.out_channels),
        (KSIZE, g.ksize),
        (KSTRIDE, g.kstride),
        (INPUT_W, g.in_w),
        (INPUT_H, g.in_h),
        (OUTPUT_W, g.out_w),
        (OUTPUT_H, g.out_h),
        (PADDING, g.padding),
        (IS_NL, usize::from(job.leaky)),
        (IS_BN, usize::from(job.batch_norm)),
        (TM, g.tm),
        (TN, g.tn),
        (TR, g.tr),
        (TC, g.tc),
        (OFM_NUM_BOUND, g.bounds.ofm_bound),
        (MLOOPS_X_TM, g.bounds.mloops_x_tm),
        (MLOOPS_A1_X_TM, g.bounds.mloops_a1_x_tm),
    ] {
        writes.push((offset, word(value)));
    }
    writes.push((LAYER_TYPE, g.kind.tag()));

    writes
}

/// GPIO data words in block order (weight, act in, act out, bias), or
/// `None` when every Q is zero and the blocks are left untouched.
#[must_use]
pub fn gpio_program(q: &QValues) -> Option<[u32; 4]> {
    q.any_nonzero().then(|| {
        [q.weight, q.act_in, q.act_out, q.bias].map(|v| u32::from_ne_bytes(v.to_ne_bytes()))
    })
}

/// Register name at a control-block offset. High address words read as
/// `<NAME>_HI`.
#[must_use]
pub const fn name(offset: usize) -> Option<&'static str> {
    Some(match offset {
        AP_CTRL => "AP_CTRL",
        INPUT_ADDR => "INPUT_ADDR",
        0x14 => "INPUT_ADDR_HI",
        OUTPUT_ADDR => "OUTPUT_ADDR",
        0x20 => "OUTPUT_ADDR_HI",
        WEIGHT_ADDR => "WEIGHT_ADDR",
        0x2c => "WEIGHT_ADDR_HI",
        BETA_ADDR => "BETA_ADDR",
        0x38 => "BETA_ADDR_HI",
        IFM_NUM => "IFM_NUM",
        OFM_NUM => "OFM_NUM",
        KSIZE => "KSIZE",
        KSTRIDE => "KSTRIDE",
        INPUT_W => "INPUT_W",
        INPUT_H => "INPUT_H",
        OUTPUT_W => "OUTPUT_W",
        OUTPUT_H => "OUTPUT_H",
        PADDING => "PADDING",
        IS_NL => "IS_NL",
        IS_BN => "IS_BN",
        TM => "TM",
        TN => "TN",
        TR => "TR",
        TC => "TC",
        OFM_NUM_BOUND => "OFM_NUM_BOUND",
        MLOOPS_X_TM => "MLOOPS_X_TM",
        MLOOPS_A1_X_TM => "MLOOPS_A1_X_TM",
        LAYER_TYPE => "LAYER_TYPE",
        _ => return None,
    })
}

/// Rebuild a job from a control-block image and the four GPIO words.
///
/// `read` returns the word at a control-block offset.
///
/// # Errors
///
/// Returns a [`Violation`] if the layer-type tag is unknown.
pub fn decode_program(read: impl Fn(usize) -> u32, gpio: [u32; 4]) -> Result<ControlJob, Violation> {
    let addr = |offset: usize| u64::from(read(offset)) | (u64::from(read(offset + 4)) << 32);
    let val = |offset: usize| read(offset) as usize;

    let tag = read(LAYER_TYPE);
    let kind = LayerType::from_tag(tag)
        .ok_or_else(|| Violation::degenerate(format!("unknown layer type tag {tag}")))?;
    let [weight, act_in, act_out, bias] = gpio.map(|w| i32::from_ne_bytes(w.to_ne_bytes()));

    Ok(ControlJob {
        addrs: BufferAddrs {
            input: addr(INPUT_ADDR),
            output: addr(OUTPUT_ADDR),
            weight: addr(WEIGHT_ADDR),
            bias: addr(BETA_ADDR),
        },
        geometry: TileGeometry {
            kind,
            in_channels: val(IFM_NUM),
            out_channels: val(OFM_NUM),
            in_w: val(INPUT_W),
            in_h: val(INPUT_H),
            out_w: val(OUTPUT_W),
            out_h: val(OUTPUT_H),
            ksize: val(KSIZE),
            kstride: val(KSTRIDE),
            padding: val(PADDING),
            tm: val(TM),
            tn: val(TN),
            tr: val(TR),
            tc: val(TC),
            bounds: LoopBounds {
                ofm_bound: val(OFM_NUM_BOUND),
                mloops_x_tm: val(MLOOPS_X_TM),
                mloops_a1_x_tm: val(MLOOPS_A1_X_TM),
            },
        },
        leaky: read(IS_NL) != 0,
        batch_norm: read(IS_BN) != 0,
        q: QValues {
            weight,
            act_in,
            act_out,
            bias,
        },
    })
}

#[allow(clippy::cast_possible_truncation)]
const fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

// Validated jobs never exceed MAX_CHANNELS, so the narrowing is lossless.
#[allow(clippy::cast_possible_truncation)]
const fn word(value: usize) -> u32 {
    value as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::conv_geometry;

    #[test]
    fn offsets_match_interface_synthesis() {
        assert_eq!(INPUT_ADDR, 0x10);
        assert_eq!(OUTPUT_ADDR, 0x1c);
        assert_eq!(WEIGHT_ADDR, 0x28);
        assert_eq!(BETA_ADDR, 0x34);
        assert_eq!(IFM_NUM, 0x40);
        assert_eq!(LAYER_TYPE, 0xd0);
        assert_eq!(ap_ctrl::START | ap_ctrl::DONE | ap_ctrl::IDLE | ap_ctrl::READY, 0xf);
    }

    #[test]
    fn scalar_registers_use_eight_byte_stride() {
        let scalars = [
            IFM_NUM, OFM_NUM, KSIZE, KSTRIDE, INPUT_W, INPUT_H, OUTPUT_W, OUTPUT_H, PADDING,
            IS_NL, IS_BN, TM, TN, TR, TC, OFM_NUM_BOUND, MLOOPS_X_TM, MLOOPS_A1_X_TM, LAYER_TYPE,
        ];
        for pair in scalars.windows(2) {
            assert_eq!(pair[1] - pair[0], 8);
        }
    }

    #[test]
    fn program_splits_addresses() {
        let g = conv_geometry(3, 32, 416, 416, 3, 1, 1).unwrap();
        let addrs = BufferAddrs {
            input: 0x1_2345_6780,
            output: 0x10,
            weight: 0x20,
            bias: 0x30,
        };
        let job = ControlJob::conv(g, addrs, true, false, QValues::default());
        let program = register_program(&job);

        assert!(program.contains(&(INPUT_ADDR, 0x2345_6780)));
        assert!(program.contains(&(INPUT_ADDR + 4, 0x1)));
        assert!(program.contains(&(IS_NL, 1)));
        assert!(program.contains(&(IS_BN, 0)));
        assert!(program.contains(&(OFM_NUM_BOUND, 64)));
        assert_eq!(program.last(), Some(&(LAYER_TYPE, 0)));
    }

    #[test]
    fn every_programmed_register_has_a_name() {
        let g = conv_geometry(3, 32, 416, 416, 3, 1, 1).unwrap();
        let job = ControlJob::conv(g, BufferAddrs::default(), true, true, QValues::default());
        for (offset, _) in register_program(&job) {
            assert!(name(offset).is_some(), "offset {offset:#x}");
        }
        assert_eq!(name(0x14), Some("INPUT_ADDR_HI"));
        assert_eq!(name(0x0c), None);
    }

    #[test]
    fn gpio_skipped_when_all_q_zero() {
        assert_eq!(gpio_program(&QValues::default()), None);
        let words = gpio_program(&QValues {
            weight: 14,
            act_in: -2,
            act_out: 5,
            bias: 0,
        })
        .unwrap();
        assert_eq!(words[0], 14);
        assert_eq!(words[1], u32::MAX - 1);
    }

    #[test]
    fn decode_recovers_programmed_job() {
        let g = conv_geometry(64, 40, 13, 13, 1, 1, 0).unwrap();
        let q = QValues {
            weight: 12,
            act_in: -1,
            act_out: 4,
            bias: 9,
        };
        let job = ControlJob::conv(
            g,
            BufferAddrs {
                input: 0x4000_0000,
                output: 0x4010_0000,
                weight: 0x5000_0000,
                bias: 0x5100_0000,
            },
            true,
            true,
            q,
        );

        let mut image = vec![0_u32; SPAN / 4];
        for (offset, value) in register_program(&job) {
            image[offset / 4] = value;
        }
        let gpio = gpio_program(&q).unwrap();
        let decoded = decode_program(|off| image[off / 4], gpio).unwrap();
        assert_eq!(decoded, job);
    }
}
