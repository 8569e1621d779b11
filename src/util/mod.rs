//! Utility types and functions.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Aabb`] and 3x4 matrix helpers, glam re-exports
//! - [`BitWriter`] / [`BitReader`] - dword bit streams for packed nodes

mod bits;
mod error;
mod math;

pub use bits::*;
pub use error::*;
pub use math::*;

/// Round `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_u64(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Round `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_u32(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Integer division rounding up.
#[inline]
pub const fn div_round_up(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}
