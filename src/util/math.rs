//! Math helpers shared by the leaf builder, encoders and update kernels.
//!
//! Bounding boxes use plain `[f32; 3]` arrays so they can be stored verbatim
//! in device memory (`vk_aabb` layout, 24 bytes). Vector math goes through
//! `glam`.

pub use glam::{Affine3A, Mat3A, Vec3, Vec3A};

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Axis-aligned bounding box with the device memory layout of `vk_aabb`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    /// Empty box (inverted, grows on first point).
    pub const EMPTY: Self = Self {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    /// Box used for unused legacy child slots.
    pub const NAN: Self = Self {
        min: [f32::NAN; 3],
        max: [f32::NAN; 3],
    };

    #[inline]
    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn from_vec3(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.to_array(),
            max: max.to_array(),
        }
    }

    #[inline]
    pub fn min_vec(&self) -> Vec3 {
        Vec3::from_array(self.min)
    }

    #[inline]
    pub fn max_vec(&self) -> Vec3 {
        Vec3::from_array(self.max)
    }

    /// Grow to include a point.
    #[inline]
    pub fn grow_point(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Grow to include another box. Empty boxes contribute nothing.
    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Union of two boxes.
    #[inline]
    pub fn union(&self, other: &Aabb) -> Aabb {
        let mut b = *self;
        b.grow(other);
        b
    }

    /// True if min > max on any axis (this includes [`Aabb::EMPTY`]).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1] || self.min[2] > self.max[2]
    }

    /// True if any component is NaN.
    #[inline]
    pub fn has_nan(&self) -> bool {
        self.min.iter().chain(self.max.iter()).any(|c| c.is_nan())
    }

    /// True if every component is finite and min <= max on every axis.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.iter().chain(self.max.iter()).all(|c| c.is_finite()) && !self.is_empty()
    }

    /// True if `other` lies fully inside this box.
    #[inline]
    pub fn contains(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.min[i] <= other.min[i] && self.max[i] >= other.max[i])
    }

    /// Surface area (collapse heuristic and SAH cost).
    #[inline]
    pub fn area(&self) -> f32 {
        let dx = self.max[0] - self.min[0];
        let dy = self.max[1] - self.min[1];
        let dz = self.max[2] - self.min[2];
        2.0 * (dx * dy + dy * dz + dz * dx)
    }

    /// Longest axis (0=x, 1=y, 2=z).
    #[inline]
    pub fn longest_axis(&self) -> usize {
        let dx = self.max[0] - self.min[0];
        let dy = self.max[1] - self.min[1];
        let dz = self.max[2] - self.min[2];
        if dx >= dy && dx >= dz {
            0
        } else if dy >= dz {
            1
        } else {
            2
        }
    }

    /// Centroid of the box.
    #[inline]
    pub fn centroid(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    /// Replace infinite components with the largest finite value of the same sign.
    #[inline]
    pub fn clamp_infinities(&self) -> Aabb {
        let clamp = |c: f32| c.clamp(-f32::MAX, f32::MAX);
        Aabb {
            min: self.min.map(clamp),
            max: self.max.map(clamp),
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aabb({:?} - {:?})", self.min, self.max)
    }
}

/// Row-major 3x4 affine matrix (`VkTransformMatrixKHR` layout).
pub type Mat3x4 = [f32; 12];

/// Identity 3x4 matrix.
pub const MAT3X4_IDENTITY: Mat3x4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

/// Convert a row-major 3x4 matrix to a glam affine transform.
pub fn affine_from_mat3x4(m: &Mat3x4) -> Affine3A {
    Affine3A {
        matrix3: Mat3A::from_cols(
            Vec3A::new(m[0], m[4], m[8]),
            Vec3A::new(m[1], m[5], m[9]),
            Vec3A::new(m[2], m[6], m[10]),
        ),
        translation: Vec3A::new(m[3], m[7], m[11]),
    }
}

/// Convert a glam affine transform back to row-major 3x4.
pub fn mat3x4_from_affine(a: &Affine3A) -> Mat3x4 {
    let c0 = a.matrix3.x_axis;
    let c1 = a.matrix3.y_axis;
    let c2 = a.matrix3.z_axis;
    let t = a.translation;
    [
        c0.x, c1.x, c2.x, t.x, //
        c0.y, c1.y, c2.y, t.y, //
        c0.z, c1.z, c2.z, t.z,
    ]
}

/// Apply a row-major 3x4 transform to a point.
#[inline]
pub fn transform_point(m: &Mat3x4, p: [f32; 3]) -> [f32; 3] {
    let mut out = [0.0f32; 3];
    for (r, o) in out.iter_mut().enumerate() {
        *o = m[r * 4] * p[0] + m[r * 4 + 1] * p[1] + m[r * 4 + 2] * p[2] + m[r * 4 + 3];
    }
    out
}

/// Transform a box and return the box around its eight transformed corners.
pub fn transform_aabb(m: &Mat3x4, b: &Aabb) -> Aabb {
    let mut out = Aabb::EMPTY;
    for corner in 0..8 {
        let p = [
            if corner & 1 != 0 { b.max[0] } else { b.min[0] },
            if corner & 2 != 0 { b.max[1] } else { b.min[1] },
            if corner & 4 != 0 { b.max[2] } else { b.min[2] },
        ];
        out.grow_point(transform_point(m, p));
    }
    out
}

/// Largest f32 that is <= `v`.
#[inline]
pub fn f32_round_down(v: f64) -> f32 {
    let f = v as f32;
    if (f as f64) > v {
        f32_step_down(f)
    } else {
        f
    }
}

/// Smallest f32 that is >= `v`.
#[inline]
pub fn f32_round_up(v: f64) -> f32 {
    let f = v as f32;
    if (f as f64) < v {
        f32_step_up(f)
    } else {
        f
    }
}

/// Next representable f32 towards negative infinity.
pub fn f32_step_down(f: f32) -> f32 {
    if f.is_nan() || f == f32::NEG_INFINITY {
        return f;
    }
    if f == 0.0 {
        return -f32::from_bits(1);
    }
    let bits = f.to_bits();
    if f > 0.0 {
        f32::from_bits(bits - 1)
    } else {
        f32::from_bits(bits + 1)
    }
}

/// Next representable f32 towards positive infinity.
pub fn f32_step_up(f: f32) -> f32 {
    -f32_step_down(-f)
}
