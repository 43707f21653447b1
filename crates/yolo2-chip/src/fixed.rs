//! Q-format arithmetic shared by every numeric path.
//!
//! A value stored at format `Q` represents `raw × 2^-Q`. Moving a value from
//! `Q_src` to `Q_dst` is a shift by `Q_src − Q_dst`: positive shifts move the
//! binary point down (round half up, arithmetic right shift), negative shifts
//! move it up (exact left shift). Shift magnitudes are clamped to
//! [`MAX_SHIFT`] so pathological tables stay total instead of overflowing.
//!
//! The datapath is written once against [`Precision`]. [`Fixed16`] models the
//! 16-bit silicon; [`Float32`] is the reference build where every scale,
//! round and saturate step disappears.

use bytemuck::Pod;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::ops::Add;

/// Largest shift applied in either direction.
pub const MAX_SHIFT: i32 = 30;

/// Most negative 16-bit activation; max-pool windows start here.
pub const FIXED_POOL_SENTINEL: i16 = i16::MIN;

/// Float max-pool window start value.
pub const FLOAT_POOL_SENTINEL: f32 = -1024.0 * 1024.0;

/// Rescale a wide accumulator by `shift` binary places.
///
/// `shift > 0` divides by `2^shift` rounding half up; `shift < 0` multiplies
/// by `2^-shift`. Never panics: the shift is clamped and both directions
/// saturate at the `i64` range.
#[must_use]
pub fn rescale(acc: i64, shift: i32) -> i64 {
    let shift = shift.clamp(-MAX_SHIFT, MAX_SHIFT);
    match shift.cmp(&0) {
        Ordering::Greater => acc.saturating_add(1_i64 << (shift - 1)) >> shift,
        Ordering::Less => acc.saturating_mul(1_i64 << -shift),
        Ordering::Equal => acc,
    }
}

/// Rescale from `from_q` to `to_q`.
#[must_use]
pub fn requantize(acc: i64, from_q: i32, to_q: i32) -> i64 {
    rescale(acc, from_q.saturating_sub(to_q))
}

/// Clamp to the 16-bit storage range.
#[must_use]
pub fn saturate_i16(v: i64) -> i16 {
    // Truncation is impossible after the clamp.
    #[allow(clippy::cast_possible_truncation)]
    let narrowed = v.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
    narrowed
}

/// Compile-time numeric precision of the datapath.
///
/// Kernels are generic over this trait so the fixed-point silicon and the
/// floating-point reference share one implementation.
pub trait Precision: Copy + Default + Debug + Send + Sync + 'static {
    /// Storage element in DDR and tile buffers.
    type Elem: Pod + PartialOrd + Default + Debug + Send + Sync;
    /// Accumulator element of the output tile.
    type Acc: Copy + PartialOrd + Default + Debug + Send + Sync + Add<Output = Self::Acc>;

    /// Short name for logs.
    const NAME: &'static str;
    /// True for Q-format builds.
    const IS_FIXED: bool;
    /// Initial value of a max-pool window.
    const POOL_SENTINEL: Self::Elem;
    /// Additive identity of the accumulator.
    const ZERO: Self::Acc;

    /// Full-precision product of a weight and an activation.
    fn mul(w: Self::Elem, x: Self::Elem) -> Self::Acc;

    /// Widen a stored element into the accumulator.
    fn widen(v: Self::Elem) -> Self::Acc;

    /// Move an accumulator from `from_q` to `to_q`. Identity in float.
    fn rescale(acc: Self::Acc, from_q: i32, to_q: i32) -> Self::Acc;

    /// Leaky rectifier with slope 0.1.
    fn leaky(acc: Self::Acc) -> Self::Acc;

    /// Narrow an accumulator back to storage, saturating in fixed point.
    fn narrow(acc: Self::Acc) -> Self::Elem;

    /// Move a stored element from `from_q` to `to_q`.
    fn shift_elem(v: Self::Elem, from_q: i32, to_q: i32) -> Self::Elem {
        Self::narrow(Self::rescale(Self::widen(v), from_q, to_q))
    }

    /// Quantize a real value at format `q`.
    fn from_f32(v: f32, q: i32) -> Self::Elem;

    /// Dequantize a stored element at format `q`.
    fn to_f32(v: Self::Elem, q: i32) -> f32;
}

/// 16-bit Q-format datapath with a 64-bit accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fixed16;

/// 32-bit floating-point reference datapath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Float32;

impl Precision for Fixed16 {
    type Elem = i16;
    type Acc = i64;

    const NAME: &'static str = "int16";
    const IS_FIXED: bool = true;
    const POOL_SENTINEL: i16 = FIXED_POOL_SENTINEL;
    const ZERO: i64 = 0;

    fn mul(w: i16, x: i16) -> i64 {
        i64::from(w) * i64::from(x)
    }

    fn widen(v: i16) -> i64 {
        i64::from(v)
    }

    fn rescale(acc: i64, from_q: i32, to_q: i32) -> i64 {
        requantize(acc, from_q, to_q)
    }

    fn leaky(acc: i64) -> i64 {
        // Integer division truncates toward zero, unlike the float slope.
        if acc < 0 {
            acc / 10
        } else {
            acc
        }
    }

    fn narrow(acc: i64) -> i16 {
        saturate_i16(acc)
    }

    fn from_f32(v: f32, q: i32) -> i16 {
        let scale = q_scale(q);
        let scaled = (f64::from(v) * scale).clamp(f64::from(i16::MIN), f64::from(i16::MAX));
        // round() is half-away-from-zero; the clamp above bounds the cast.
        #[allow(clippy::cast_possible_truncation)]
        let rounded = scaled.round() as i64;
        saturate_i16(rounded)
    }

    fn to_f32(v: i16, q: i32) -> f32 {
        #[allow(clippy::cast_possible_truncation)]
        let scale = (1.0 / q_scale(q)) as f32;
        f32::from(v) * scale
    }
}

impl Precision for Float32 {
    type Elem = f32;
    type Acc = f32;

    const NAME: &'static str = "float32";
    const IS_FIXED: bool = false;
    const POOL_SENTINEL: f32 = FLOAT_POOL_SENTINEL;
    const ZERO: f32 = 0.0;

    fn mul(w: f32, x: f32) -> f32 {
        w * x
    }

    fn widen(v: f32) -> f32 {
        v
    }

    fn rescale(acc: f32, _from_q: i32, _to_q: i32) -> f32 {
        acc
    }

    fn leaky(acc: f32) -> f32 {
        if acc < 0.0 {
            acc * 0.1
        } else {
            acc
        }
    }

    fn narrow(acc: f32) -> f32 {
        acc
    }

    fn from_f32(v: f32, _q: i32) -> f32 {
        v
    }

    fn to_f32(v: f32, _q: i32) -> f32 {
        v
    }
}

/// `2^q` for |q| ≤ 31, otherwise 1.
fn q_scale(q: i32) -> f64 {
    if (-31..=31).contains(&q) {
        2.0_f64.powi(q)
    } else {
        1.0
    }
}
