//! Acceleration structure format shared by both node layouts, plus the
//! legacy (GFX10.3/GFX11) 4-wide node structs.
//!
//! All structs are `#[repr(C)]` POD with the exact device layout. Packed
//! fields are read and written through the `const fn` helpers below, never
//! through struct bit-fields.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use std::mem::offset_of;

use crate::util::{Aabb, Mat3x4};

// ============================================================================
// Node ids
// ============================================================================

/// Node type tags (low 3 bits of a node id).
pub const NODE_TYPE_TRIANGLE: u32 = 0;
pub const NODE_TYPE_BOX16: u32 = 4;
pub const NODE_TYPE_BOX32: u32 = 5;
pub const NODE_TYPE_INSTANCE: u32 = 6;
pub const NODE_TYPE_AABB: u32 = 7;

/// Id of the root node: a box32 at body offset 0.
pub const ROOT_NODE: u32 = NODE_TYPE_BOX32;
/// Empty child slot / no parent.
pub const INVALID_NODE: u32 = 0xffff_ffff;

/// Build a node id from a body-relative byte offset (8-byte aligned).
#[inline]
pub const fn node_id(offset: u32, node_type: u32) -> u32 {
    (offset >> 3) | node_type
}

/// Body-relative byte offset of a node id.
#[inline]
pub const fn node_offset(id: u32) -> u32 {
    (id & !7) << 3
}

#[inline]
pub const fn node_type(id: u32) -> u32 {
    id & 7
}

#[inline]
pub const fn is_internal_type(node_type: u32) -> bool {
    node_type == NODE_TYPE_BOX16 || node_type == NODE_TYPE_BOX32
}

/// Mask of the 45 address bits kept in a node pointer.
pub const NODE_PTR_MASK: u64 = (1 << 45) - 1;

/// Pack a device address into a node pointer.
#[inline]
pub const fn addr_to_node(va: u64) -> u64 {
    (va >> 3) & NODE_PTR_MASK
}

/// Unpack a node pointer, sign-extending to a canonical address.
#[inline]
pub const fn node_to_addr(node: u64) -> u64 {
    (((node & NODE_PTR_MASK) << 19) as i64 >> 16) as u64
}

/// Instance flags live above the address in an instance's BLAS pointer.
pub const INSTANCE_PTR_FLAGS_SHIFT: u32 = 54;

/// `VkGeometryInstanceFlagBitsKHR`
pub const INSTANCE_TRIANGLE_FACING_CULL_DISABLE: u32 = 1 << 0;
pub const INSTANCE_TRIANGLE_FLIP_FACING: u32 = 1 << 1;
pub const INSTANCE_FORCE_OPAQUE: u32 = 1 << 2;
pub const INSTANCE_FORCE_NO_OPAQUE: u32 = 1 << 3;

/// Opaque bit of `geometry_id_and_flags`.
pub const GEOMETRY_OPAQUE: u32 = 1 << 31;
/// Geometry index bits of `geometry_id_and_flags`.
pub const GEOMETRY_ID_MASK: u32 = 0x0fff_ffff;

/// Parent link slot granularity.
pub const LEGACY_NODE_SIZE_GCD: u32 = 64;

/// Address of the parent link for the node at `offset` (body-relative).
#[inline]
pub const fn parent_link_va(bvh_va: u64, offset: u32, node_size_gcd: u32) -> u64 {
    bvh_va - 4 - 4 * (offset / node_size_gcd) as u64
}

// ============================================================================
// Build flags / geometry description
// ============================================================================

bitflags! {
    /// Kernel specialization flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        /// Allocate internal nodes densely and report the compacted size
        const COMPACT = 1 << 0;
        /// GFX12 8-wide node layout
        const BVH8 = 1 << 1;
        /// Update source and destination are the same structure
        const UPDATE_IN_PLACE = 1 << 2;
        /// Replace infinite bounds with the largest finite float
        const NO_INFS = 1 << 3;
        /// Maintain the per-primitive leaf offset table
        const WRITE_LEAF_NODE_OFFSETS = 1 << 4;
        /// GFX12 update reads geometry from push constants only
        const UPDATE_SINGLE_GEOMETRY = 1 << 5;
        /// Store opaque/no-opaque cull flags in box children
        const PROPAGATE_CULL_FLAGS = 1 << 6;
    }
}

/// `VkGeometryTypeKHR`
pub const GEOMETRY_TYPE_TRIANGLES: u32 = 0;
pub const GEOMETRY_TYPE_AABBS: u32 = 1;
pub const GEOMETRY_TYPE_INSTANCES: u32 = 2;

/// `VkIndexType`
pub const INDEX_TYPE_UINT16: u32 = 0;
pub const INDEX_TYPE_UINT32: u32 = 1;
pub const INDEX_TYPE_NONE: u32 = 1_000_165_000;
pub const INDEX_TYPE_UINT8: u32 = 1_000_265_000;

/// `VkFormat` values accepted as vertex formats.
pub const FORMAT_R8G8_UNORM: u32 = 16;
pub const FORMAT_R8G8_SNORM: u32 = 17;
pub const FORMAT_R8G8B8A8_UNORM: u32 = 37;
pub const FORMAT_R8G8B8A8_SNORM: u32 = 38;
pub const FORMAT_A2B10G10R10_UNORM_PACK32: u32 = 64;
pub const FORMAT_R16G16_UNORM: u32 = 77;
pub const FORMAT_R16G16_SNORM: u32 = 78;
pub const FORMAT_R16G16_SFLOAT: u32 = 83;
pub const FORMAT_R16G16B16A16_UNORM: u32 = 91;
pub const FORMAT_R16G16B16A16_SNORM: u32 = 92;
pub const FORMAT_R16G16B16A16_SFLOAT: u32 = 97;
pub const FORMAT_R32G32_SFLOAT: u32 = 103;
pub const FORMAT_R32G32B32_SFLOAT: u32 = 106;

/// Normalized description of one geometry (`vk_bvh_geometry_data`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryData {
    /// Vertices, AABBs or instances (already offset to the first primitive)
    pub data: u64,
    pub indices: u64,
    /// 3x4 transform, 0 for none
    pub transform: u64,
    /// Geometry index with [`GEOMETRY_OPAQUE`]
    pub geometry_id: u32,
    pub geometry_type: u32,
    /// Global index of the geometry's first primitive
    pub first_id: u32,
    pub stride: u32,
    pub vertex_format: u32,
    pub index_format: u32,
}

/// `VkAccelerationStructureInstanceKHR` as read from the application.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceInput {
    pub transform: Mat3x4,
    /// custom index (24) | mask (8)
    pub custom_instance_and_mask: u32,
    /// SBT offset (24) | flags (8)
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

pub const INSTANCE_INPUT_SIZE: u32 = 64;

// ============================================================================
// Header
// ============================================================================

/// Acceleration structure header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AccelStructHeader {
    pub bvh_offset: u32,
    pub root_flags: u32,
    pub aabb: Aabb,

    // Everything from here is written by the header stage.
    pub compacted_size: u64,
    pub serialization_size: u64,
    pub copy_dispatch_size: [u32; 3],
    pub update_dispatch_size: [u32; 3],
    pub size: u64,

    // Host-known fields, written with a CP write after encoding.
    pub geometry_type: u32,
    pub geometry_count: u32,
    pub instance_offset: u64,
    pub instance_count: u64,
    pub leaf_node_offsets_offset: u32,
    pub build_flags: u32,
    pub primitive_base_indices_offset: u32,
    pub internal_nodes_offset: u32,
}

pub const HEADER_SIZE: u32 = std::mem::size_of::<AccelStructHeader>() as u32;
pub const HEADER_AABB_OFFSET: u32 = offset_of!(AccelStructHeader, aabb) as u32;
pub const HEADER_ROOT_FLAGS_OFFSET: u32 = offset_of!(AccelStructHeader, root_flags) as u32;
pub const HEADER_COMPACTED_SIZE_OFFSET: u32 = offset_of!(AccelStructHeader, compacted_size) as u32;
pub const HEADER_COPY_DISPATCH_OFFSET: u32 = offset_of!(AccelStructHeader, copy_dispatch_size) as u32;
pub const HEADER_UPDATE_DISPATCH_OFFSET: u32 = offset_of!(AccelStructHeader, update_dispatch_size) as u32;
pub const HEADER_GEOMETRY_TYPE_OFFSET: u32 = offset_of!(AccelStructHeader, geometry_type) as u32;

/// Optional per-geometry table (RRA traces).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryInfo {
    pub geometry_type: u32,
    pub flags: u32,
    pub primitive_count: u32,
}

/// Serialized blob header: `driver_uuid | cache_uuid | sizes | instances[]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SerializationHeader {
    pub driver_uuid: [u8; 16],
    pub accel_struct_compat: [u8; 16],
    pub serialization_size: u64,
    pub compacted_size: u64,
    pub instance_count: u64,
}

pub const SERIALIZATION_HEADER_SIZE: u64 = std::mem::size_of::<SerializationHeader>() as u64;

/// Offset of the structure copy inside a serialized blob.
#[inline]
pub const fn serialized_data_offset(instance_count: u64) -> u64 {
    crate::util::align_u64(SERIALIZATION_HEADER_SIZE + 8 * instance_count, 128)
}

// ============================================================================
// Legacy nodes
// ============================================================================

/// 4-wide box node with full-precision child boxes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Box32Node {
    pub children: [u32; 4],
    pub coords: [Aabb; 4],
    pub reserved: [u32; 4],
}

impl Box32Node {
    /// Node with every slot empty.
    pub fn empty() -> Self {
        Self {
            children: [INVALID_NODE; 4],
            coords: [Aabb::NAN; 4],
            reserved: [0; 4],
        }
    }

    pub fn valid_child_count(&self) -> u32 {
        self.children.iter().filter(|&&c| c != INVALID_NODE).count() as u32
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TriangleNode {
    pub coords: [[f32; 3]; 3],
    pub reserved: [u32; 3],
    pub triangle_id: u32,
    pub geometry_id_and_flags: u32,
    pub reserved2: u32,
    pub id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AabbNode {
    pub aabb: Aabb,
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceNode {
    /// Node pointer to the BLAS root, instance flags above bit 54
    pub bvh_ptr: u64,
    pub custom_instance_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub wto_matrix: Mat3x4,
    pub instance_id: u32,
    /// `bvh_offset` of the referenced BLAS
    pub bvh_offset: u32,
    pub reserved: [u32; 2],
    pub otw_matrix: Mat3x4,
}

pub const BOX32_NODE_SIZE: u32 = std::mem::size_of::<Box32Node>() as u32;
pub const TRIANGLE_NODE_SIZE: u32 = std::mem::size_of::<TriangleNode>() as u32;
pub const AABB_NODE_SIZE: u32 = std::mem::size_of::<AabbNode>() as u32;
pub const INSTANCE_NODE_SIZE: u32 = std::mem::size_of::<InstanceNode>() as u32;

/// Legacy leaf node size for a geometry type.
pub const fn legacy_leaf_size(geometry_type: u32) -> u32 {
    match geometry_type {
        GEOMETRY_TYPE_TRIANGLES => TRIANGLE_NODE_SIZE,
        GEOMETRY_TYPE_AABBS => AABB_NODE_SIZE,
        _ => INSTANCE_NODE_SIZE,
    }
}

/// Legacy leaf node type tag for a geometry type.
pub const fn legacy_leaf_type(geometry_type: u32) -> u32 {
    match geometry_type {
        GEOMETRY_TYPE_TRIANGLES => NODE_TYPE_TRIANGLE,
        GEOMETRY_TYPE_AABBS => NODE_TYPE_AABB,
        _ => NODE_TYPE_INSTANCE,
    }
}
