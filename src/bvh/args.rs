//! Push-constant blocks of every kernel. Layouts are `#[repr(C)]` with
//! explicit padding so they can be passed as raw bytes.

use bytemuck::{Pod, Zeroable};

use super::format::GeometryData;

/// Leaf stage: one dispatch per geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LeafArgs {
    /// Base of IR ids
    pub ir: u64,
    pub header: u64,
    pub geom_data: GeometryData,
}

/// IR tree build over all leaves.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct IrBuildArgs {
    pub ir: u64,
    pub header: u64,
    pub leaf_count: u32,
    pub geometry_type: u32,
}

/// Legacy encode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct EncodeArgs {
    pub intermediate_bvh: u64,
    /// VA of the output root (`dst + bvh_offset`)
    pub output_bvh: u64,
    pub header: u64,
    pub output_bvh_offset: u32,
    pub leaf_node_count: u32,
    pub geometry_type: u32,
    pub reserved: u32,
}

/// 8-wide encode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct EncodeGfx12Args {
    pub intermediate_bvh: u64,
    pub output_base: u64,
    pub header: u64,
    pub output_bvh_offset: u32,
    pub leaf_node_offsets_offset: u32,
    pub leaf_node_count: u32,
    pub geometry_type: u32,
}

/// Header kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct HeaderArgs {
    /// IR header
    pub src: u64,
    /// Acceleration structure header
    pub dst: u64,
    pub bvh_offset: u32,
    pub instance_count: u32,
    pub internal_nodes_offset: u32,
    pub leaf_node_count: u32,
}

/// Legacy update: one dispatch per geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct UpdateArgs {
    pub src: u64,
    pub dst: u64,
    pub leaf_bounds: u64,
    pub internal_ready_count: u64,
    pub leaf_node_count: u32,
    pub reserved: u32,
    pub geom_data: GeometryData,
}

/// 8-wide update: one dispatch for all geometries.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct UpdateGfx12Args {
    pub src: u64,
    pub dst: u64,
    /// Array of per-geometry records
    pub geom_data: u64,
    pub bounds: u64,
    pub internal_ready_count: u64,
    pub leaf_node_count: u32,
    pub reserved: u32,
    /// Geometry 0, used by the single-geometry variant
    pub geom_data0: GeometryData,
}

pub const COPY_MODE_COPY: u32 = 0;
pub const COPY_MODE_SERIALIZE: u32 = 1;
pub const COPY_MODE_DESERIALIZE: u32 = 2;

/// Copy, serialize and deserialize.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CopyArgs {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub mode: u32,
    pub reserved: u32,
}
