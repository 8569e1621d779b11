//! Host side of acceleration structures.
//!
//! Mirrors the driver entry points: size queries, creation, build and
//! update recording, copies and (de)serialization. Everything that runs on
//! the device is recorded into a [`CommandBuffer`](crate::device::CommandBuffer);
//! nothing executes until the buffer is submitted.
//!
//! - [`layout`] - structure and scratch layouts
//! - [`build`] - build and update orchestration
//! - [`copy`] - copy, compaction, serialization

pub mod build;
pub mod copy;
pub mod layout;

pub use build::{cmd_build_acceleration_structures, fill_geometry_data};
pub use copy::{
    cmd_copy_acceleration_structure, cmd_copy_acceleration_structure_to_memory,
    cmd_copy_memory_to_acceleration_structure,
};
pub use layout::{AccelStructLayout, UpdateScratchLayout};

use bitflags::bitflags;
use std::sync::Arc;

use crate::bvh::format::*;
use crate::bvh::gfx12::Gfx12BoxNode;
use crate::bvh::BvhVariant;
use crate::config::DeviceConfig;
use crate::device::{Buffer, Device, Kernel, Pipeline, PipelineKey};
use crate::util::{align_u64, Error, Result};

bitflags! {
    /// `VkBuildAccelerationStructureFlagsKHR`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildAccelFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const LOW_MEMORY = 1 << 4;
    }
}

bitflags! {
    /// `VkGeometryFlagsKHR`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANY_HIT_INVOCATION = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelStructType {
    TopLevel,
    BottomLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    Build,
    Update,
}

/// Vertex formats accepted for triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    R32G32B32Sfloat,
    R32G32Sfloat,
    R16G16B16A16Sfloat,
    R16G16Sfloat,
    R16G16B16A16Snorm,
    R16G16Snorm,
    R16G16B16A16Unorm,
    R16G16Unorm,
    R8G8B8A8Snorm,
    R8G8Snorm,
    R8G8B8A8Unorm,
    R8G8Unorm,
    A2B10G10R10UnormPack32,
}

impl VertexFormat {
    /// `VkFormat` value.
    pub fn raw(self) -> u32 {
        match self {
            Self::R32G32B32Sfloat => FORMAT_R32G32B32_SFLOAT,
            Self::R32G32Sfloat => FORMAT_R32G32_SFLOAT,
            Self::R16G16B16A16Sfloat => FORMAT_R16G16B16A16_SFLOAT,
            Self::R16G16Sfloat => FORMAT_R16G16_SFLOAT,
            Self::R16G16B16A16Snorm => FORMAT_R16G16B16A16_SNORM,
            Self::R16G16Snorm => FORMAT_R16G16_SNORM,
            Self::R16G16B16A16Unorm => FORMAT_R16G16B16A16_UNORM,
            Self::R16G16Unorm => FORMAT_R16G16_UNORM,
            Self::R8G8B8A8Snorm => FORMAT_R8G8B8A8_SNORM,
            Self::R8G8Snorm => FORMAT_R8G8_SNORM,
            Self::R8G8B8A8Unorm => FORMAT_R8G8B8A8_UNORM,
            Self::R8G8Unorm => FORMAT_R8G8_UNORM,
            Self::A2B10G10R10UnormPack32 => FORMAT_A2B10G10R10_UNORM_PACK32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IndexType {
    #[default]
    None,
    Uint8,
    Uint16,
    Uint32,
}

impl IndexType {
    /// `VkIndexType` value.
    pub fn raw(self) -> u32 {
        match self {
            Self::None => INDEX_TYPE_NONE,
            Self::Uint8 => INDEX_TYPE_UINT8,
            Self::Uint16 => INDEX_TYPE_UINT16,
            Self::Uint32 => INDEX_TYPE_UINT32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrianglesData {
    pub vertex_format: VertexFormat,
    pub vertex_data: u64,
    pub vertex_stride: u64,
    pub max_vertex: u32,
    pub index_type: IndexType,
    pub index_data: u64,
    /// 3x4 row-major transform, 0 for none
    pub transform_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AabbsData {
    pub data: u64,
    pub stride: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancesData {
    /// `data` holds instance addresses rather than instances
    pub array_of_pointers: bool,
    pub data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeometryKind {
    Triangles(TrianglesData),
    Aabbs(AabbsData),
    Instances(InstancesData),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub kind: GeometryKind,
    pub flags: GeometryFlags,
}

impl Geometry {
    pub fn geometry_type(&self) -> u32 {
        match self.kind {
            GeometryKind::Triangles(_) => GEOMETRY_TYPE_TRIANGLES,
            GeometryKind::Aabbs(_) => GEOMETRY_TYPE_AABBS,
            GeometryKind::Instances(_) => GEOMETRY_TYPE_INSTANCES,
        }
    }
}

/// `VkAccelerationStructureBuildRangeInfoKHR`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildRangeInfo {
    pub primitive_count: u32,
    /// Byte offset into index (or vertex, AABB, instance) data
    pub primitive_offset: u32,
    pub first_vertex: u32,
    pub transform_offset: u32,
}

/// `VkAccelerationStructureBuildGeometryInfoKHR`, addresses already
/// resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildGeometryInfo {
    pub ty: AccelStructType,
    pub flags: BuildAccelFlags,
    pub mode: BuildMode,
    /// Source structure of an update, 0 for builds
    pub src: u64,
    pub dst: u64,
    pub geometries: Vec<Geometry>,
    pub scratch: u64,
}

impl BuildGeometryInfo {
    /// Geometry type of the whole build; empty builds count as triangles.
    pub fn geometry_type(&self) -> u32 {
        match self.ty {
            AccelStructType::TopLevel => GEOMETRY_TYPE_INSTANCES,
            AccelStructType::BottomLevel => self
                .geometries
                .first()
                .map_or(GEOMETRY_TYPE_TRIANGLES, Geometry::geometry_type),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let geometry_type = self.geometry_type();
        if self.ty == AccelStructType::TopLevel && self.geometries.len() != 1 {
            return Err(Error::build(format!(
                "top-level builds take exactly one instance geometry, got {}",
                self.geometries.len()
            )));
        }
        if let Some(g) = self.geometries.iter().find(|g| g.geometry_type() != geometry_type) {
            return Err(Error::geometry(format!(
                "geometry type {} mixed into a build of type {geometry_type}",
                g.geometry_type()
            )));
        }
        if self.ty == AccelStructType::BottomLevel && geometry_type == GEOMETRY_TYPE_INSTANCES {
            return Err(Error::geometry("instances in a bottom-level build"));
        }
        if self.mode == BuildMode::Update && self.src == 0 {
            return Err(Error::build("update without a source structure"));
        }
        Ok(())
    }
}

/// `VkAccelerationStructureBuildSizesInfoKHR`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub accel_struct_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Copy modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyMode {
    Clone,
    Compact,
    Serialize,
    Deserialize,
}

/// An acceleration structure bound to its own device buffer.
#[derive(Debug, Clone)]
pub struct AccelerationStructure {
    buffer: Arc<Buffer>,
    ty: AccelStructType,
}

impl AccelerationStructure {
    #[inline]
    pub fn va(&self) -> u64 {
        self.buffer.va()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    #[inline]
    pub fn ty(&self) -> AccelStructType {
        self.ty
    }

    /// Release the backing buffer.
    pub fn destroy(self, device: &Device) -> Result<()> {
        device.destroy_buffer(self.buffer.va())
    }
}

/// Kernel flags every pipeline of this device is specialized with.
pub fn device_build_flags(config: &DeviceConfig) -> BuildFlags {
    let mut flags = BuildFlags::empty();
    if config.gfx_level.uses_bvh8() {
        flags |= BuildFlags::BVH8 | BuildFlags::WRITE_LEAF_NODE_OFFSETS;
    }
    if config.gfx_level.needs_no_infs() {
        flags |= BuildFlags::NO_INFS;
    }
    if config.gfx_level.propagates_cull_flags() {
        flags |= BuildFlags::PROPAGATE_CULL_FLAGS;
    }
    flags
}

/// Encode flags for one build: 8-wide structures are always compacted.
pub fn encode_flags(config: &DeviceConfig, build_flags: BuildAccelFlags) -> BuildFlags {
    let mut flags = device_build_flags(config);
    if config.gfx_level.uses_bvh8() || build_flags.contains(BuildAccelFlags::ALLOW_COMPACTION) {
        flags |= BuildFlags::COMPACT;
    }
    flags
}

/// Cached pipeline for a kernel specialized with `flags`.
pub(crate) fn pipeline<K: Kernel + 'static>(
    device: &Device,
    name: &'static str,
    flags: BuildFlags,
    create: impl FnOnce() -> K,
) -> Pipeline {
    device.pipelines().get_or_create(PipelineKey { name, flags: flags.bits() }, || Arc::new(create()))
}

/// Fail with [`Error::BufferTooSmall`] unless `required` bytes are mapped at `va`.
pub(crate) fn check_buffer(device: &Device, va: u64, required: u64) -> Result<()> {
    let (buffer, offset) = device.memory().resolve_checked(va, 1)?;
    let actual = buffer.size() - offset;
    if actual < required {
        return Err(Error::BufferTooSmall { required, actual });
    }
    Ok(())
}

/// Sizes a build with at most `max_primitive_counts[i]` primitives in
/// geometry `i` needs.
#[tracing::instrument(skip_all, fields(geometries = geometries.len()))]
pub fn get_build_sizes(
    device: &Device,
    ty: AccelStructType,
    geometries: &[Geometry],
    max_primitive_counts: &[u32],
) -> Result<BuildSizes> {
    if geometries.len() != max_primitive_counts.len() {
        return Err(Error::build(format!(
            "{} geometries but {} primitive counts",
            geometries.len(),
            max_primitive_counts.len()
        )));
    }
    let geometry_type = match ty {
        AccelStructType::TopLevel => GEOMETRY_TYPE_INSTANCES,
        AccelStructType::BottomLevel => geometries.first().map_or(GEOMETRY_TYPE_TRIANGLES, Geometry::geometry_type),
    };
    let leaf_count = max_primitive_counts
        .iter()
        .try_fold(0u32, |acc, &n| acc.checked_add(n))
        .ok_or_else(|| Error::build("primitive count overflows"))?;
    let geometry_count = geometries.len() as u32;
    let config = device.config();

    let sizes = BuildSizes {
        accel_struct_size: AccelStructLayout::new(config, geometry_type, geometry_count, leaf_count).size,
        build_scratch_size: layout::build_scratch_layout(geometry_type, leaf_count).size,
        update_scratch_size: UpdateScratchLayout::new(config, geometry_count, leaf_count).size,
    };
    tracing::debug!(leaf_count, ?sizes, "build sizes");
    Ok(sizes)
}

/// Allocate a zeroed structure of `size` bytes.
pub fn create_acceleration_structure(device: &Device, ty: AccelStructType, size: u64) -> Result<AccelerationStructure> {
    let buffer = device.create_buffer(size)?;
    Ok(AccelerationStructure { buffer, ty })
}

/// Read a structure header.
pub fn read_header(device: &Device, va: u64) -> Result<AccelStructHeader> {
    device.memory().host_read::<AccelStructHeader>(va)
}

/// Whether a serialized blob with this `driver_uuid | cache_uuid` prefix
/// can be deserialized on `device`.
pub fn device_compatibility(device: &Device, version_data: &[u8; 32]) -> bool {
    device.config().version_data() == *version_data
}

/// The structure traced when an instance references nothing: a header and
/// a root without children.
pub fn init_null_accel_struct(device: &Device) -> Result<AccelerationStructure> {
    let variant = BvhVariant::for_config(device.config());
    let bvh_offset = align_u64(HEADER_SIZE as u64, 64);
    let size = bvh_offset + variant.internal_node_size() as u64;

    let accel = create_acceleration_structure(device, AccelStructType::TopLevel, size)?;
    let memory = device.memory();
    let header = AccelStructHeader {
        bvh_offset: bvh_offset as u32,
        ..Default::default()
    };
    memory.upload(accel.va(), bytemuck::bytes_of(&header))?;
    match variant {
        BvhVariant::Gfx12 => memory.upload(accel.va() + bvh_offset, bytemuck::bytes_of(&Gfx12BoxNode::empty()))?,
        BvhVariant::Legacy => memory.upload(accel.va() + bvh_offset, bytemuck::bytes_of(&Box32Node::empty()))?,
    }
    tracing::debug!(variant = variant.name(), size, "null acceleration structure");
    Ok(accel)
}
