//! Host-side tensor work
//!
//! Everything the sequencer does to feature maps on the CPU: quantizing the
//! image, removing and restoring DDR row padding, the passthrough reorg,
//! Q shifts and the final dequantization.

use crate::error::{ModelError, Result};
use crate::shapes::Shape;
use yolo2_chip::Precision;

/// Darknet's reorg gather on a `w × h × c` tensor (`out[in] = x[out]`).
///
/// # Panics
///
/// Panics if `x` holds fewer than `w·h·c` elements or `c` is not a
/// multiple of `stride²`.
pub fn reorg_cpu<T: Copy + Default>(x: &[T], w: usize, h: usize, c: usize, stride: usize) -> Vec<T> {
    let out_c = c / (stride * stride);
    let mut out = vec![T::default(); w * h * c];
    for k in 0..c {
        let c2 = k % out_c;
        let offset = k / out_c;
        for j in 0..h {
            let h2 = j * stride + offset / stride;
            for i in 0..w {
                let w2 = i * stride + offset % stride;
                let in_index = i + w * (j + h * k);
                let out_index = w2 + w * stride * (h2 + h * stride * c2);
                out[in_index] = x[out_index];
            }
        }
    }
    out
}

/// Passthrough reorg of a dense `[C][H][W]` tensor into
/// `[C·s²][H/s][W/s]`.
///
/// The tensor is folded to `(w, h·c/s², s²)` before the gather, which is
/// the view the detector weights were trained against.
///
/// # Errors
///
/// Returns [`ModelError::ShapeMismatch`] if `dense` has the wrong length or
/// the shape does not fold evenly.
pub fn space_to_depth<T: Copy + Default>(dense: &[T], shape: Shape, stride: usize) -> Result<Vec<T>> {
    if dense.len() != shape.elements() {
        return Err(ModelError::shape_mismatch("reorg input", shape.elements(), dense.len()));
    }
    let block = stride * stride;
    if block == 0 || (shape.h * shape.c) % block != 0 {
        return Err(ModelError::shape_mismatch(
            format!("reorg fold of {shape} by {stride}"),
            (shape.h * shape.c) / block.max(1) * block,
            shape.h * shape.c,
        ));
    }
    Ok(reorg_cpu(dense, shape.w, shape.h * shape.c / block, block, stride))
}

/// Remove DDR row padding: `[C][H][align8(W)]` to `[C][H][W]`.
///
/// # Errors
///
/// Returns [`ModelError::ShapeMismatch`] if `padded` is shorter than the
/// padded footprint.
pub fn strip_rows<T: Copy>(padded: &[T], shape: Shape) -> Result<Vec<T>> {
    if padded.len() < shape.footprint() {
        return Err(ModelError::shape_mismatch("padded tensor", shape.footprint(), padded.len()));
    }
    let stride = shape.row_stride();
    Ok(padded[..shape.footprint()]
        .chunks_exact(stride.max(1))
        .flat_map(|row| &row[..shape.w])
        .copied()
        .collect())
}

/// Add DDR row padding with zeros: `[C][H][W]` to `[C][H][align8(W)]`.
///
/// # Errors
///
/// Returns [`ModelError::ShapeMismatch`] if `dense` has the wrong length.
pub fn pad_rows<T: Copy + Default>(dense: &[T], shape: Shape) -> Result<Vec<T>> {
    if dense.len() != shape.elements() {
        return Err(ModelError::shape_mismatch("dense tensor", shape.elements(), dense.len()));
    }
    let mut out = vec![T::default(); shape.footprint()];
    if shape.w > 0 {
        for (src, dst) in dense.chunks_exact(shape.w).zip(out.chunks_exact_mut(shape.row_stride())) {
            dst[..shape.w].copy_from_slice(src);
        }
    }
    Ok(out)
}

/// Move stored values from `from_q` to `to_q` in place, rounding.
pub fn shift_q<P: Precision>(values: &mut [P::Elem], from_q: i32, to_q: i32) {
    if from_q == to_q {
        return;
    }
    for v in values {
        *v = P::shift_elem(*v, from_q, to_q);
    }
}

/// Quantize real values at format `q`.
pub fn quantize<P: Precision>(values: &[f32], q: i32) -> Vec<P::Elem> {
    values.iter().map(|&v| P::from_f32(v, q)).collect()
}

/// Dequantize stored values at format `q`.
pub fn dequantize<P: Precision>(values: &[P::Elem], q: i32) -> Vec<f32> {
    values.iter().map(|&v| P::to_f32(v, q)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use yolo2_chip::{Fixed16, Float32};

    #[test]
    fn test_reorg_gather_order() {
        let x: Vec<u16> = (0..16).collect();
        let out = space_to_depth(&x, Shape::new(1, 4, 4), 2).unwrap();
        assert_eq!(out, vec![0, 2, 4, 6, 1, 3, 5, 7, 8, 10, 12, 14, 9, 11, 13, 15]);
    }

    #[test]
    fn test_reorg_is_a_permutation() {
        let shape = Shape::new(64, 26, 26);
        let x: Vec<u32> = (0..u32::try_from(shape.elements()).unwrap()).collect();
        let mut out = space_to_depth(&x, shape, 2).unwrap();
        assert_ne!(out, x);
        out.sort_unstable();
        assert_eq!(out, x);
    }

    #[test]
    fn test_reorg_rejects_bad_shapes() {
        assert!(space_to_depth(&[0_i16; 8], Shape::new(1, 3, 3), 2).is_err());
        assert!(space_to_depth(&[0_i16; 9], Shape::new(1, 3, 3), 2).is_err());
    }

    #[test]
    fn test_strip_and_pad_rows() {
        let shape = Shape::new(2, 2, 3);
        let dense: Vec<i16> = (1..=12).collect();
        let padded = pad_rows(&dense, shape).unwrap();
        assert_eq!(padded.len(), 2 * 2 * 8);
        assert_eq!(&padded[..8], &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(&padded[24..27], &[10, 11, 12]);
        assert_eq!(strip_rows(&padded, shape).unwrap(), dense);
        assert!(strip_rows(&padded[..31], shape).is_err());
    }

    #[test]
    fn test_shift_keeps_value_within_one_lsb() {
        let reals: Vec<f32> = (0..200).map(|i| (i as f32 - 100.0) * 0.0173).collect();
        let mut stored = quantize::<Fixed16>(&reals, 10);
        shift_q::<Fixed16>(&mut stored, 10, 7);
        let back = dequantize::<Fixed16>(&stored, 7);
        let lsb = 2.0_f32.powi(-7);
        for (r, b) in reals.iter().zip(&back) {
            assert!((r - b).abs() <= lsb, "{r} vs {b}");
        }
    }

    #[test]
    fn test_float_shift_is_identity() {
        let mut v = vec![0.25_f32, -3.5];
        shift_q::<Float32>(&mut v, 12, 4);
        assert_eq!(v, vec![0.25, -3.5]);
        assert_eq!(quantize::<Float32>(&v, 9), v);
    }
}
