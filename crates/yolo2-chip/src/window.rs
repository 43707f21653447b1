//! Physical address windows of the accelerator on the AXI interconnect.
//!
//! ```text
//! Block          Base          Size    Purpose
//! ────────────── ───────────── ─────── ───────────────────────────────
//! control        0xA000_0000   4 KB    AP_CTRL + layer registers
//! gpio (Qw)      0xA001_0000   4 KB    weight Q
//! gpio (Qa_in)   0xA002_0000   4 KB    input activation Q
//! gpio (Qa_out)  0xA003_0000   4 KB    output activation Q
//! gpio (Qb)      0xA004_0000   4 KB    bias Q
//! ```
//!
//! The bases are fixed by the block design; they are mapped from `/dev/mem`.

/// Control block (HLS `s_axi_CTRL_BUS`).
pub mod control {
    /// Physical base address.
    pub const BASE: u64 = 0xA000_0000;
    /// Mapped size in bytes.
    pub const SIZE: usize = 0x1000;
}

/// Q-value GPIO blocks, one data word each.
pub mod gpio {
    /// Weight Q block.
    pub const WEIGHT_Q_BASE: u64 = 0xA001_0000;
    /// Input activation Q block.
    pub const ACT_IN_Q_BASE: u64 = 0xA002_0000;
    /// Output activation Q block.
    pub const ACT_OUT_Q_BASE: u64 = 0xA003_0000;
    /// Bias Q block.
    pub const BIAS_Q_BASE: u64 = 0xA004_0000;
    /// Mapped size of each block.
    pub const SIZE: usize = 0x1000;

    /// Bases in the order of [`crate::regs::gpio_program`].
    pub const BASES: [u64; 4] = [WEIGHT_Q_BASE, ACT_IN_Q_BASE, ACT_OUT_Q_BASE, BIAS_Q_BASE];
}

/// Register windows for ergonomic mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// Control block.
    Control,
    /// Weight Q GPIO.
    WeightQ,
    /// Input activation Q GPIO.
    ActInQ,
    /// Output activation Q GPIO.
    ActOutQ,
    /// Bias Q GPIO.
    BiasQ,
}

impl Window {
    /// Every window, control first.
    pub const ALL: [Self; 5] = [Self::Control, Self::WeightQ, Self::ActInQ, Self::ActOutQ, Self::BiasQ];

    /// Physical base address.
    #[must_use]
    pub const fn base(&self) -> u64 {
        match self {
            Self::Control => control::BASE,
            Self::WeightQ => gpio::WEIGHT_Q_BASE,
            Self::ActInQ => gpio::ACT_IN_Q_BASE,
            Self::ActOutQ => gpio::ACT_OUT_Q_BASE,
            Self::BiasQ => gpio::BIAS_Q_BASE,
        }
    }

    /// Mapped size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Control => control::SIZE,
            Self::WeightQ | Self::ActInQ | Self::ActOutQ | Self::BiasQ => gpio::SIZE,
        }
    }

    /// Q GPIO window at index `i` of [`gpio::BASES`].
    #[must_use]
    pub const fn q_gpio(i: usize) -> Option<Self> {
        match i {
            0 => Some(Self::WeightQ),
            1 => Some(Self::ActInQ),
            2 => Some(Self::ActOutQ),
            3 => Some(Self::BiasQ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_do_not_overlap() {
        for (i, a) in Window::ALL.iter().enumerate() {
            for b in &Window::ALL[i + 1..] {
                let a_end = a.base() + a.size() as u64;
                let b_end = b.base() + b.size() as u64;
                assert!(a_end <= b.base() || b_end <= a.base(), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn gpio_order_matches_bases() {
        for (i, base) in gpio::BASES.iter().enumerate() {
            assert_eq!(Window::q_gpio(i).map(|w| w.base()), Some(*base));
        }
        assert_eq!(Window::q_gpio(4), None);
    }
}
