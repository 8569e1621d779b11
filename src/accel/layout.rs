//! Buffer layouts of acceleration structures and their scratch memory.
//!
//! ```text
//! header | geometry info[] | base indices[] | leaf node offsets[] | parent links
//!        | pad to 64 | root | leaves | internal nodes
//! ```
//!
//! The optional tables only exist when the matching device feature is
//! enabled. Parent links sit directly below `bvh_offset` and are indexed
//! downwards from there.

use crate::bvh::format::{GeometryData, GeometryInfo, GEOMETRY_TYPE_TRIANGLES, HEADER_SIZE};
use crate::bvh::ir::IrLayout;
use crate::bvh::BvhVariant;
use crate::config::DeviceConfig;
use crate::util::{align_u64, Aabb};

/// Internal nodes a tree over `leaf_count` leaves can need.
#[inline]
pub fn internal_node_count(leaf_count: u32) -> u32 {
    leaf_count.max(2) - 1
}

/// Offsets inside an acceleration structure buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelStructLayout {
    /// 0 when the table is absent
    pub geometry_info_offset: u32,
    /// 0 when the table is absent
    pub primitive_base_indices_offset: u32,
    pub leaf_node_offsets_offset: u32,
    pub bvh_offset: u32,
    pub leaf_nodes_offset: u32,
    pub internal_nodes_offset: u32,
    pub size: u64,
}

impl AccelStructLayout {
    pub fn new(config: &DeviceConfig, geometry_type: u32, geometry_count: u32, leaf_count: u32) -> Self {
        let variant = BvhVariant::for_config(config);
        let internal_count = internal_node_count(leaf_count) as u64;
        let leaf_size = variant.leaf_node_size(geometry_type) as u64;
        let internal_size = variant.internal_node_size() as u64;
        let bvh_size = leaf_size * leaf_count as u64 + internal_size * internal_count;

        let mut layout = Self::default();
        let mut offset = HEADER_SIZE as u64;

        if config.rra_trace {
            layout.geometry_info_offset = offset as u32;
            offset += std::mem::size_of::<GeometryInfo>() as u64 * geometry_count as u64;
        }
        if config.position_fetch && geometry_type == GEOMETRY_TYPE_TRIANGLES {
            layout.primitive_base_indices_offset = offset as u32;
            offset += 4 * geometry_count as u64;
        }

        layout.leaf_node_offsets_offset = offset as u32;
        if variant == BvhVariant::Gfx12 {
            offset += 4 * leaf_count as u64;
        }

        offset += bvh_size / variant.node_size_gcd() as u64 * 4;
        offset = align_u64(offset, 64);
        layout.bvh_offset = offset as u32;

        offset += internal_size;
        layout.leaf_nodes_offset = offset as u32;
        offset += leaf_size * leaf_count as u64;
        layout.internal_nodes_offset = offset as u32;
        offset += internal_size * (internal_count - 1);

        layout.size = offset;
        layout
    }

    /// Body-relative offset of the first non-root internal node.
    #[inline]
    pub fn internal_rel(&self) -> u32 {
        self.internal_nodes_offset - self.bvh_offset
    }

    /// Body-relative offset of the first leaf.
    #[inline]
    pub fn leaf_rel(&self) -> u32 {
        self.leaf_nodes_offset - self.bvh_offset
    }
}

/// Offsets inside update scratch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateScratchLayout {
    /// 8-wide only
    pub geometry_data_offset: u64,
    /// Per-leaf bounds (legacy) or per-internal-node bounds (8-wide)
    pub bounds_offset: u64,
    pub internal_ready_count_offset: u64,
    pub size: u64,
}

impl UpdateScratchLayout {
    pub fn new(config: &DeviceConfig, geometry_count: u32, leaf_count: u32) -> Self {
        let internal_count = internal_node_count(leaf_count) as u64;
        let aabb_size = std::mem::size_of::<Aabb>() as u64;

        let mut layout = Self::default();
        let mut offset = 0u64;
        if BvhVariant::for_config(config) == BvhVariant::Gfx12 {
            layout.geometry_data_offset = offset;
            offset += std::mem::size_of::<GeometryData>() as u64 * geometry_count as u64;
            layout.bounds_offset = offset;
            offset += aabb_size * internal_count;
        } else {
            layout.bounds_offset = offset;
            offset += aabb_size * leaf_count as u64;
        }
        layout.internal_ready_count_offset = offset;
        offset += 4 * internal_count;
        layout.size = offset;
        layout
    }
}

/// Build scratch holds the intermediate tree.
#[inline]
pub fn build_scratch_layout(geometry_type: u32, leaf_count: u32) -> IrLayout {
    IrLayout::new(leaf_count, geometry_type)
}
