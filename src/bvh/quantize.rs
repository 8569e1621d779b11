//! 12-bit child box quantization for 8-wide box nodes.
//!
//! A node stores an f32 origin (its minimum corner) and a power-of-two
//! extent per axis, kept as a biased f32 exponent. Child boxes are stored as
//! 12-bit offsets inside that frame:
//!
//! ```text
//! qmin = floor(4096 * (min - origin) / extent)
//! qmax = ceil(4096 * (max - origin) / extent) - 1
//! min' = origin + extent * qmin / 4096
//! max' = origin + extent * (qmax + 1) / 4096
//! ```
//!
//! A child that is flat on a grid line keeps one cell (`qmax = qmin`).
//! `extent * q / 4096` is exact in f32, so only the final add rounds.
//! [`quantize`] steps `q` outward whenever that rounding would shrink the
//! decoded box, which keeps every decoded box a superset of the input.

use crate::util::{f32_round_up, Aabb};

/// Quantization grid resolution per axis.
pub const QUANT_STEPS: u32 = 4096;
pub const QUANT_MAX: u32 = QUANT_STEPS - 1;

const MIN_EXPONENT: u32 = 1;
const MAX_EXPONENT: u32 = 254;

/// Origin and per-axis extents of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantFrame {
    pub origin: [f32; 3],
    /// Biased f32 exponents of the per-axis extents
    pub exponents: [u32; 3],
}

/// Quantized child box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuantBox {
    pub min: [u32; 3],
    pub max: [u32; 3],
}

impl QuantBox {
    /// Encoding of an empty child: min above max on every axis.
    pub const EMPTY: Self = Self {
        min: [QUANT_MAX; 3],
        max: [0; 3],
    };
}

/// Biased exponent of the smallest power of two >= `extent`.
fn extent_exponent(extent: f32) -> u32 {
    if !(extent > 0.0) {
        return MIN_EXPONENT;
    }
    if extent.is_infinite() {
        return MAX_EXPONENT;
    }
    let bits = extent.to_bits();
    let mut exponent = bits >> 23;
    let mantissa = bits & 0x7f_ffff;
    if exponent == 0 {
        // Denormal extents use the smallest normal power of two.
        return MIN_EXPONENT;
    }
    if mantissa != 0 {
        exponent += 1;
    }
    exponent.clamp(MIN_EXPONENT, MAX_EXPONENT)
}

/// Extent of a biased exponent.
#[inline]
pub fn exponent_extent(exponent: u32) -> f32 {
    f32::from_bits(exponent.clamp(MIN_EXPONENT, MAX_EXPONENT) << 23)
}

/// Frame enclosing `bounds`. Empty bounds yield a zero-origin frame.
pub fn compute_frame(bounds: &Aabb) -> QuantFrame {
    if bounds.is_empty() || bounds.has_nan() {
        return QuantFrame {
            origin: [0.0; 3],
            exponents: [MIN_EXPONENT; 3],
        };
    }
    let mut exponents = [MIN_EXPONENT; 3];
    for (axis, exponent) in exponents.iter_mut().enumerate() {
        let extent = f32_round_up(bounds.max[axis] as f64 - bounds.min[axis] as f64);
        *exponent = extent_exponent(extent);
    }
    QuantFrame {
        origin: bounds.min,
        exponents,
    }
}

#[inline]
fn decode_axis(origin: f32, extent: f32, q: u32) -> f32 {
    origin + extent * q as f32 / QUANT_STEPS as f32
}

/// Quantize `child` in `frame`. Empty or NaN boxes map to [`QuantBox::EMPTY`].
pub fn quantize(frame: &QuantFrame, child: &Aabb) -> QuantBox {
    if child.is_empty() || child.has_nan() {
        return QuantBox::EMPTY;
    }
    let mut out = QuantBox::default();
    for axis in 0..3 {
        let origin = frame.origin[axis];
        let extent = exponent_extent(frame.exponents[axis]);
        let scale = QUANT_STEPS as f64 / extent as f64;

        let lo = ((child.min[axis] as f64 - origin as f64) * scale).floor();
        let hi = ((child.max[axis] as f64 - origin as f64) * scale).ceil() - 1.0;
        let mut qmin = lo.clamp(0.0, QUANT_MAX as f64) as u32;
        // A flat child on a grid line gives hi = lo - 1.
        let mut qmax = (hi.clamp(0.0, QUANT_MAX as f64) as u32).max(qmin);

        while qmin > 0 && decode_axis(origin, extent, qmin) > child.min[axis] {
            qmin -= 1;
        }
        while qmax < QUANT_MAX && decode_axis(origin, extent, qmax + 1) < child.max[axis] {
            qmax += 1;
        }
        out.min[axis] = qmin;
        out.max[axis] = qmax;
    }
    out
}

/// Decode a quantized box. [`QuantBox::EMPTY`] decodes to [`Aabb::EMPTY`].
pub fn dequantize(frame: &QuantFrame, q: &QuantBox) -> Aabb {
    if (0..3).any(|axis| q.min[axis] > q.max[axis]) {
        return Aabb::EMPTY;
    }
    let mut out = Aabb::EMPTY;
    for axis in 0..3 {
        let origin = frame.origin[axis];
        let extent = exponent_extent(frame.exponents[axis]);
        out.min[axis] = decode_axis(origin, extent, q.min[axis]);
        out.max[axis] = decode_axis(origin, extent, q.max[axis] + 1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_extent_exponent() {
        assert_eq!(exponent_extent(extent_exponent(1.0)), 1.0);
        assert_eq!(exponent_extent(extent_exponent(1.5)), 2.0);
        assert_eq!(exponent_extent(extent_exponent(0.3)), 0.5);
        assert_eq!(extent_exponent(0.0), MIN_EXPONENT);
        assert_eq!(extent_exponent(f32::INFINITY), MAX_EXPONENT);
    }

    #[test]
    fn test_frame_of_node_bounds() {
        let node = Aabb::new([-1.0, 2.0, 0.5], [3.0, 2.5, 0.5]);
        let frame = compute_frame(&node);
        assert_eq!(frame.origin, node.min);
        assert_eq!(exponent_extent(frame.exponents[0]), 4.0);
        assert_eq!(exponent_extent(frame.exponents[1]), 0.5);

        // The node's own box quantizes to the full range on non-flat axes.
        let q = quantize(&frame, &node);
        assert_eq!(q.min, [0, 0, 0]);
        assert_eq!(q.max[0], QUANT_MAX);
        assert_eq!(q.max[1], QUANT_MAX);
    }

    #[test]
    fn test_empty_child() {
        let frame = compute_frame(&Aabb::new([0.0; 3], [1.0; 3]));
        assert_eq!(quantize(&frame, &Aabb::EMPTY), QuantBox::EMPTY);
        assert_eq!(quantize(&frame, &Aabb::NAN), QuantBox::EMPTY);
        assert!(dequantize(&frame, &QuantBox::EMPTY).is_empty());
    }

    #[test]
    fn test_flat_child_on_grid_line() {
        let node = Aabb::new([0.0; 3], [4.0; 3]);
        let frame = compute_frame(&node);
        for y in [0.0, 1.0, 2.5, 4.0] {
            let child = Aabb::new([0.0, y, 0.0], [4.0, y, 4.0]);
            let q = quantize(&frame, &child);
            assert!(q.min[1] <= q.max[1], "y = {y}: {q:?}");
            let decoded = dequantize(&frame, &q);
            assert!(!decoded.is_empty());
            assert!(decoded.contains(&child), "{decoded:?} does not contain {child:?}");
        }

        // A point child on interior grid lines of every axis.
        let point = Aabb::new([1.0, 2.0, 3.0], [1.0, 2.0, 3.0]);
        let q = quantize(&frame, &point);
        assert_eq!(q.min, [1024, 2048, 3072]);
        assert_eq!(q.max, q.min);
        assert!(dequantize(&frame, &q).contains(&point));
    }

    #[test]
    fn test_decoded_boxes_are_conservative() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            let scale = 10f32.powi(rng.random_range(-4..6));
            let offset = rng.random_range(-1000.0f32..1000.0);
            let mut node = Aabb::EMPTY;
            let mut children = Vec::new();
            for _ in 0..8 {
                let a = [0; 3].map(|_: i32| offset + rng.random_range(-1.0f32..1.0) * scale);
                let b = [0; 3].map(|_: i32| offset + rng.random_range(-1.0f32..1.0) * scale);
                let mut child = Aabb::EMPTY;
                child.grow_point(a);
                child.grow_point(b);
                node.grow(&child);
                children.push(child);
            }
            let frame = compute_frame(&node);
            for child in &children {
                let decoded = dequantize(&frame, &quantize(&frame, child));
                assert!(decoded.contains(child), "{decoded:?} does not contain {child:?}");
            }
        }
    }
}
