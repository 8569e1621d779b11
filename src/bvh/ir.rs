//! Intermediate representation written by the build stages.
//!
//! The IR is a binary tree in build scratch memory, independent of the
//! final node format:
//!
//! ```text
//! IrHeader | leaves[leaf_count] | internal[max(leaf_count, 2) - 1]
//! ```
//!
//! Leaves live at their global primitive index. Internal nodes are stored
//! in post-order with the root last, so the encoders can walk parents
//! before children by visiting indices from the top down.

use bytemuck::{Pod, Zeroable};

use super::format::{GEOMETRY_OPAQUE, GEOMETRY_TYPE_AABBS, GEOMETRY_TYPE_INSTANCES, INSTANCE_FORCE_NO_OPAQUE, INSTANCE_FORCE_OPAQUE};
use crate::util::{align_u64, Aabb, Mat3x4};

/// IR node type tags (low 2 bits of an IR id).
pub const IR_NODE_TRIANGLE: u32 = 0;
pub const IR_NODE_INTERNAL: u32 = 1;
pub const IR_NODE_INSTANCE: u32 = 2;
pub const IR_NODE_AABB: u32 = 3;

/// Empty IR child slot.
pub const IR_INVALID: u32 = 0xffff_ffff;

/// `bvh_offset` not yet assigned by the parent's encoder.
pub const IR_OFFSET_UNKNOWN: u32 = 0xffff_ffff;
/// Node was collapsed into its parent and gets no output node.
pub const IR_OFFSET_NULL: u32 = 0xffff_fffe;

/// Every primitive below is opaque.
pub const IR_FLAG_ONLY_OPAQUE: u32 = 1 << 0;
/// No primitive below is opaque.
pub const IR_FLAG_NO_OPAQUE: u32 = 1 << 1;
pub const IR_FLAG_CULL_MASK: u32 = IR_FLAG_ONLY_OPAQUE | IR_FLAG_NO_OPAQUE;
/// Instance mask union lives in bits 8..16.
pub const IR_FLAG_MASK_SHIFT: u32 = 8;

/// Builder phase recorded in `sync_data[0]`.
pub const IR_PHASE_LEAVES: u32 = 0;
pub const IR_PHASE_BUILT: u32 = 1;

#[inline]
pub const fn ir_id(offset: u32, node_type: u32) -> u32 {
    offset | node_type
}

#[inline]
pub const fn ir_offset(id: u32) -> u32 {
    id & !3
}

#[inline]
pub const fn ir_type(id: u32) -> u32 {
    id & 3
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrHeader {
    pub aabb: Aabb,
    pub active_leaf_count: u32,
    /// Next free internal node offset (body-relative)
    pub dst_node_offset: u32,
    /// Next free leaf node offset (body-relative, 8-wide only)
    pub dst_leaf_node_offset: u32,
    pub ir_internal_node_count: u32,
    pub sync_data: [u32; 4],
}

/// IR leaf/internal node shared prefix.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrNode {
    pub aabb: Aabb,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrTriangleNode {
    pub base: IrNode,
    pub coords: [[f32; 3]; 3],
    pub triangle_id: u32,
    pub id: u32,
    pub geometry_id_and_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrAabbNode {
    pub base: IrNode,
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrInstanceNode {
    pub base: IrNode,
    /// Application BLAS reference
    pub base_ptr: u64,
    pub custom_instance_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub instance_id: u32,
    pub otw_matrix: Mat3x4,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrBoxNode {
    pub base: IrNode,
    pub children: [u32; 2],
    /// Output node offset, or one of the `IR_OFFSET_*` sentinels
    pub bvh_offset: u32,
    pub flags: u32,
}

pub const IR_HEADER_SIZE: u32 = std::mem::size_of::<IrHeader>() as u32;
pub const IR_BOX_NODE_SIZE: u32 = std::mem::size_of::<IrBoxNode>() as u32;
pub const IR_TRIANGLE_NODE_SIZE: u32 = std::mem::size_of::<IrTriangleNode>() as u32;
pub const IR_AABB_NODE_SIZE: u32 = std::mem::size_of::<IrAabbNode>() as u32;
pub const IR_INSTANCE_NODE_SIZE: u32 = std::mem::size_of::<IrInstanceNode>() as u32;

pub const IR_HEADER_DST_NODE_OFFSET: u32 = std::mem::offset_of!(IrHeader, dst_node_offset) as u32;
pub const IR_HEADER_DST_LEAF_NODE_OFFSET: u32 = std::mem::offset_of!(IrHeader, dst_leaf_node_offset) as u32;
pub const IR_HEADER_ACTIVE_LEAF_COUNT: u32 = std::mem::offset_of!(IrHeader, active_leaf_count) as u32;
pub const IR_BOX_BVH_OFFSET: u32 = std::mem::offset_of!(IrBoxNode, bvh_offset) as u32;

/// IR leaf size for a geometry type.
pub const fn ir_leaf_size(geometry_type: u32) -> u32 {
    match geometry_type {
        GEOMETRY_TYPE_AABBS => IR_AABB_NODE_SIZE,
        GEOMETRY_TYPE_INSTANCES => IR_INSTANCE_NODE_SIZE,
        _ => IR_TRIANGLE_NODE_SIZE,
    }
}

/// IR leaf type tag for a geometry type.
pub const fn ir_leaf_type(geometry_type: u32) -> u32 {
    match geometry_type {
        GEOMETRY_TYPE_AABBS => IR_NODE_AABB,
        GEOMETRY_TYPE_INSTANCES => IR_NODE_INSTANCE,
        _ => IR_NODE_TRIANGLE,
    }
}

/// Cull flags and mask of a triangle or AABB leaf.
#[inline]
pub fn geometry_leaf_flags(geometry_id_and_flags: u32) -> u32 {
    let cull = if geometry_id_and_flags & GEOMETRY_OPAQUE != 0 {
        IR_FLAG_ONLY_OPAQUE
    } else {
        IR_FLAG_NO_OPAQUE
    };
    cull | (0xff << IR_FLAG_MASK_SHIFT)
}

/// Cull flags and mask of an instance leaf.
#[inline]
pub fn instance_leaf_flags(custom_instance_and_mask: u32, sbt_offset_and_flags: u32) -> u32 {
    let instance_flags = sbt_offset_and_flags >> 24;
    let cull = if instance_flags & INSTANCE_FORCE_OPAQUE != 0 {
        IR_FLAG_ONLY_OPAQUE
    } else if instance_flags & INSTANCE_FORCE_NO_OPAQUE != 0 {
        IR_FLAG_NO_OPAQUE
    } else {
        0
    };
    cull | ((custom_instance_and_mask >> 24) << IR_FLAG_MASK_SHIFT)
}

/// Combine child flags into a parent's: cull bits hold only if they hold
/// for every child, mask bits if they are set in any.
#[inline]
pub fn merge_flags(a: u32, b: u32) -> u32 {
    ((a & b) & IR_FLAG_CULL_MASK) | ((a | b) & (0xff << IR_FLAG_MASK_SHIFT))
}

#[inline]
pub fn flags_cull(flags: u32) -> u32 {
    flags & IR_FLAG_CULL_MASK
}

#[inline]
pub fn flags_mask(flags: u32) -> u32 {
    (flags >> IR_FLAG_MASK_SHIFT) & 0xff
}

/// Placement of the IR inside build scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrLayout {
    pub header_offset: u64,
    /// Base of all IR ids
    pub bvh_offset: u64,
    pub internal_offset: u64,
    pub size: u64,
}

impl IrLayout {
    pub fn new(leaf_count: u32, geometry_type: u32) -> Self {
        let internal_count = leaf_count.max(2) as u64 - 1;
        let bvh_offset = align_u64(IR_HEADER_SIZE as u64, 64);
        let internal_offset = bvh_offset + leaf_count as u64 * ir_leaf_size(geometry_type) as u64;
        let size = internal_offset + internal_count * IR_BOX_NODE_SIZE as u64;
        Self {
            header_offset: 0,
            bvh_offset,
            internal_offset,
            size,
        }
    }

    /// IR-relative offset of internal node `index`.
    #[inline]
    pub fn internal_node_offset(&self, index: u32) -> u32 {
        (self.internal_offset - self.bvh_offset) as u32 + index * IR_BOX_NODE_SIZE
    }
}
