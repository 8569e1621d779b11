//! BVH formats and the GPU kernels that produce and maintain them.
//!
//! - [`format`] - header, node ids, legacy 4-wide nodes, build flags
//! - [`gfx12`] / [`quantize`] - 8-wide nodes with 12-bit child boxes
//! - [`ir`] - intermediate binary tree written by the build stages
//! - [`geometry`] / [`leaf`] - primitive fetch and leaf construction
//! - [`args`] - push-constant blocks
//! - kernels: [`leaf_kernel`], [`ir_builder`], [`encode`], [`encode_gfx12`],
//!   [`header`], [`update`], [`update_gfx12`], [`copy`]
//! - [`inspect`] - host-side decoding, validation and statistics

pub mod args;
pub mod copy;
pub mod encode;
pub mod encode_gfx12;
pub mod format;
pub mod geometry;
pub mod gfx12;
pub mod header;
pub mod inspect;
pub mod ir;
pub mod ir_builder;
pub mod leaf;
pub mod leaf_kernel;
pub mod quantize;
pub mod update;
pub mod update_gfx12;

pub use format::{AccelStructHeader, BuildFlags, GeometryData};

use format::{
    legacy_leaf_size, BOX32_NODE_SIZE, GEOMETRY_TYPE_INSTANCES, LEGACY_NODE_SIZE_GCD,
};
use gfx12::{GFX12_INSTANCE_LEAF_SIZE, GFX12_NODE_SIZE};

use crate::config::DeviceConfig;

/// Node layout family, fixed per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BvhVariant {
    /// 4-wide box32 nodes, 64-byte node granularity (GFX10.3, GFX11)
    Legacy,
    /// 8-wide quantized nodes, 128-byte granularity (GFX12)
    Gfx12,
}

impl BvhVariant {
    /// Variant used by a device.
    pub fn for_config(config: &DeviceConfig) -> Self {
        if config.gfx_level.uses_bvh8() {
            Self::Gfx12
        } else {
            Self::Legacy
        }
    }

    pub fn from_flags(flags: BuildFlags) -> Self {
        if flags.contains(BuildFlags::BVH8) {
            Self::Gfx12
        } else {
            Self::Legacy
        }
    }

    #[inline]
    pub const fn node_size_gcd(self) -> u32 {
        match self {
            Self::Legacy => LEGACY_NODE_SIZE_GCD,
            Self::Gfx12 => GFX12_NODE_SIZE,
        }
    }

    #[inline]
    pub const fn internal_node_size(self) -> u32 {
        match self {
            Self::Legacy => BOX32_NODE_SIZE,
            Self::Gfx12 => GFX12_NODE_SIZE,
        }
    }

    /// Leaf node footprint for a geometry type.
    #[inline]
    pub const fn leaf_node_size(self, geometry_type: u32) -> u32 {
        match self {
            Self::Legacy => legacy_leaf_size(geometry_type),
            Self::Gfx12 => {
                if geometry_type == GEOMETRY_TYPE_INSTANCES {
                    GFX12_INSTANCE_LEAF_SIZE
                } else {
                    GFX12_NODE_SIZE
                }
            }
        }
    }

    /// Maximum children per box node.
    #[inline]
    pub const fn max_children(self) -> u32 {
        match self {
            Self::Legacy => 4,
            Self::Gfx12 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Legacy => "bvh4",
            Self::Gfx12 => "bvh8",
        }
    }
}
