//! Build and update recording.
//!
//! A build runs five stages separated by barriers:
//!
//! 1. scratch init: IR header, leaf offset table and parent links
//! 2. one leaf dispatch per geometry into the IR
//! 3. the IR tree build
//! 4. encode into the destination's node format
//! 5. header: sizes from the encoder (compacting builds) plus the
//!    host-known fields and optional tables
//!
//! Updates refit an existing structure in place or into a new destination
//! with the same layout, leaving the topology untouched.

use bytemuck::bytes_of;

use super::layout::{build_scratch_layout, internal_node_count, AccelStructLayout, UpdateScratchLayout};
use super::{
    check_buffer, device_build_flags, encode_flags, pipeline, AccelStructType, BuildGeometryInfo, BuildMode,
    BuildRangeInfo, Geometry, GeometryFlags, GeometryKind, IndexType,
};
use crate::bvh::args::{EncodeArgs, EncodeGfx12Args, HeaderArgs, IrBuildArgs, LeafArgs, UpdateArgs, UpdateGfx12Args};
use crate::bvh::format::*;
use crate::bvh::header::{HeaderKernel, HeaderSizes};
use crate::bvh::ir::IrHeader;
use crate::bvh::{encode, encode_gfx12, header, ir_builder, leaf_kernel, update, update_gfx12, BvhVariant};
use crate::device::{CommandBuffer, DispatchInfo, WORKGROUP_SIZE};
use crate::util::{div_round_up, Aabb, Error, Result};

/// Describe one geometry to the kernels. `first_id` is the number of
/// primitives in the geometries before it.
pub fn fill_geometry_data(first_id: u32, index: u32, geometry: &Geometry, range: &BuildRangeInfo) -> GeometryData {
    let mut data = GeometryData {
        geometry_id: index,
        geometry_type: geometry.geometry_type(),
        first_id,
        ..Default::default()
    };
    if geometry.flags.contains(GeometryFlags::OPAQUE) {
        data.geometry_id |= GEOMETRY_OPAQUE;
    }

    let offset = range.primitive_offset as u64;
    match geometry.kind {
        GeometryKind::Triangles(t) => {
            data.data = t.vertex_data + range.first_vertex as u64 * t.vertex_stride;
            data.stride = t.vertex_stride as u32;
            data.vertex_format = t.vertex_format.raw();
            data.index_format = t.index_type.raw();
            if t.index_type == IndexType::None {
                data.data += offset;
            } else {
                data.indices = t.index_data + offset;
            }
            if t.transform_data != 0 {
                data.transform = t.transform_data + range.transform_offset as u64;
            }
        }
        GeometryKind::Aabbs(a) => {
            data.data = a.data + offset;
            data.stride = a.stride as u32;
        }
        GeometryKind::Instances(i) => {
            data.data = i.data + offset;
            data.stride = if i.array_of_pointers { 8 } else { INSTANCE_INPUT_SIZE };
        }
    }
    data
}

/// Everything the stages of one build or update share.
struct BuildState<'a> {
    info: &'a BuildGeometryInfo,
    ranges: &'a [BuildRangeInfo],
    geometry_data: Vec<GeometryData>,
    geometry_type: u32,
    leaf_count: u32,
    layout: AccelStructLayout,
}

impl<'a> BuildState<'a> {
    fn new(cmd: &CommandBuffer, info: &'a BuildGeometryInfo, ranges: &'a [BuildRangeInfo]) -> Result<Self> {
        info.validate()?;
        if ranges.len() != info.geometries.len() {
            return Err(Error::build(format!(
                "{} geometries but {} build ranges",
                info.geometries.len(),
                ranges.len()
            )));
        }

        let mut first_id = 0u32;
        let mut geometry_data = Vec::with_capacity(ranges.len());
        for (i, (geometry, range)) in info.geometries.iter().zip(ranges).enumerate() {
            geometry_data.push(fill_geometry_data(first_id, i as u32, geometry, range));
            first_id = first_id
                .checked_add(range.primitive_count)
                .ok_or_else(|| Error::build("primitive count overflows"))?;
        }

        let geometry_type = info.geometry_type();
        let layout = AccelStructLayout::new(cmd.device().config(), geometry_type, ranges.len() as u32, first_id);
        Ok(Self {
            info,
            ranges,
            geometry_data,
            geometry_type,
            leaf_count: first_id,
            layout,
        })
    }

    #[inline]
    fn geometry_count(&self) -> u32 {
        self.ranges.len() as u32
    }

    fn instance_count(&self) -> u32 {
        match self.info.ty {
            AccelStructType::TopLevel => self.leaf_count,
            AccelStructType::BottomLevel => 0,
        }
    }
}

/// Record builds and updates. Every request is validated before anything
/// is recorded.
#[tracing::instrument(skip_all, fields(count = infos.len()))]
pub fn cmd_build_acceleration_structures(
    cmd: &mut CommandBuffer,
    infos: &[BuildGeometryInfo],
    ranges: &[&[BuildRangeInfo]],
) -> Result<()> {
    if infos.len() != ranges.len() {
        return Err(Error::build(format!("{} builds but {} range arrays", infos.len(), ranges.len())));
    }
    let states = infos
        .iter()
        .zip(ranges)
        .map(|(info, ranges)| BuildState::new(cmd, info, ranges))
        .collect::<Result<Vec<_>>>()?;

    for state in &states {
        match state.info.mode {
            BuildMode::Build => record_build(cmd, state)?,
            BuildMode::Update => record_update(cmd, state)?,
        }
    }
    Ok(())
}

fn record_build(cmd: &mut CommandBuffer, state: &BuildState<'_>) -> Result<()> {
    let device = cmd.device().clone();
    let config = device.config();
    let flags = encode_flags(config, state.info.flags);
    let variant = BvhVariant::from_flags(flags);
    let layout = &state.layout;
    let ir = build_scratch_layout(state.geometry_type, state.leaf_count);
    let dst = state.info.dst;

    check_buffer(&device, dst, layout.size)?;
    check_buffer(&device, state.info.scratch, ir.size)?;
    tracing::debug!(
        variant = variant.name(),
        leaf_count = state.leaf_count,
        size = layout.size,
        bvh_offset = layout.bvh_offset,
        "recording build"
    );

    let ir_header_va = state.info.scratch + ir.header_offset;
    let ir_va = state.info.scratch + ir.bvh_offset;

    // 1. scratch init
    let ir_header = IrHeader {
        aabb: Aabb::EMPTY,
        dst_node_offset: layout.internal_rel(),
        dst_leaf_node_offset: layout.leaf_rel(),
        ..Default::default()
    };
    cmd.update_memory(ir_header_va, bytes_of(&ir_header))?;
    cmd.fill(
        dst + layout.leaf_node_offsets_offset as u64,
        (layout.bvh_offset - layout.leaf_node_offsets_offset) as u64,
        INVALID_NODE,
    )?;
    cmd.barrier("build scratch init");

    // 2. leaves
    cmd.bind_pipeline(pipeline(&device, leaf_kernel::NAME, BuildFlags::empty(), || leaf_kernel::LeafKernel));
    for (geom_data, range) in state.geometry_data.iter().zip(state.ranges) {
        if range.primitive_count == 0 {
            continue;
        }
        cmd.push_constants(&LeafArgs {
            ir: ir_va,
            header: ir_header_va,
            geom_data: *geom_data,
        })?;
        cmd.dispatch(DispatchInfo::unaligned(range.primitive_count))?;
    }
    cmd.barrier("leaves");

    // 3. IR tree
    cmd.bind_pipeline(pipeline(&device, ir_builder::NAME, BuildFlags::empty(), || ir_builder::IrBuildKernel));
    cmd.push_constants(&IrBuildArgs {
        ir: ir_va,
        header: ir_header_va,
        leaf_count: state.leaf_count,
        geometry_type: state.geometry_type,
    })?;
    cmd.dispatch(DispatchInfo::unaligned(1))?;
    cmd.barrier("ir build");

    // 4. encode
    match variant {
        BvhVariant::Legacy => {
            cmd.bind_pipeline(pipeline(&device, encode::NAME, flags, || encode::EncodeKernel { flags }));
            cmd.push_constants(&EncodeArgs {
                intermediate_bvh: ir_va,
                output_bvh: dst + layout.bvh_offset as u64,
                header: ir_header_va,
                output_bvh_offset: layout.bvh_offset,
                leaf_node_count: state.leaf_count,
                geometry_type: state.geometry_type,
                reserved: 0,
            })?;
            cmd.dispatch(DispatchInfo::unaligned(state.leaf_count.max(1)).ordered())?;
        }
        BvhVariant::Gfx12 => {
            cmd.bind_pipeline(pipeline(&device, encode_gfx12::NAME, flags, || {
                encode_gfx12::EncodeGfx12Kernel { flags }
            }));
            cmd.push_constants(&EncodeGfx12Args {
                intermediate_bvh: ir_va,
                output_base: dst,
                header: ir_header_va,
                output_bvh_offset: layout.bvh_offset,
                leaf_node_offsets_offset: layout.leaf_node_offsets_offset,
                leaf_node_count: state.leaf_count,
                geometry_type: state.geometry_type,
            })?;
            let lanes = internal_node_count(state.leaf_count) as u64 * encode_gfx12::CLUSTER_SIZE as u64;
            cmd.dispatch(DispatchInfo::groups(div_round_up(lanes, WORKGROUP_SIZE as u64) as u32).ordered())?;
        }
    }
    cmd.barrier("encode");

    // 5. header
    if flags.contains(BuildFlags::COMPACT) {
        cmd.bind_pipeline(pipeline(&device, header::NAME, flags, || HeaderKernel { flags }));
        cmd.push_constants(&HeaderArgs {
            src: ir_header_va,
            dst,
            bvh_offset: layout.bvh_offset,
            instance_count: state.instance_count(),
            internal_nodes_offset: layout.internal_nodes_offset,
            leaf_node_count: state.leaf_count,
        })?;
        cmd.dispatch(DispatchInfo::unaligned(1))?;
    }
    write_host_header(cmd, state, flags)?;
    Ok(())
}

/// Header fields the host knows up front, plus the optional tables.
fn write_host_header(cmd: &mut CommandBuffer, state: &BuildState<'_>, flags: BuildFlags) -> Result<()> {
    let layout = &state.layout;
    let dst = state.info.dst;

    let mut header = AccelStructHeader::default();
    HeaderSizes::new(layout.size, state.instance_count() as u64).apply(&mut header);
    header.update_dispatch_size = [state.leaf_count, 1, 1];
    header.geometry_type = state.geometry_type;
    header.geometry_count = state.geometry_count();
    header.instance_offset = layout.bvh_offset as u64 + BOX32_NODE_SIZE as u64;
    header.instance_count = state.instance_count() as u64;
    header.leaf_node_offsets_offset = layout.leaf_node_offsets_offset;
    header.build_flags = state.info.flags.bits();
    header.primitive_base_indices_offset = layout.primitive_base_indices_offset;
    header.internal_nodes_offset = layout.internal_nodes_offset;

    // The header kernel owns the size fields of compacting builds.
    let base = if flags.contains(BuildFlags::COMPACT) {
        HEADER_GEOMETRY_TYPE_OFFSET
    } else {
        HEADER_COMPACTED_SIZE_OFFSET
    } as usize;
    cmd.update_memory(dst + base as u64, &bytes_of(&header)[base..])?;

    let config = cmd.device().config().clone();
    if config.rra_trace {
        let infos: Vec<GeometryInfo> = state
            .info
            .geometries
            .iter()
            .zip(state.ranges)
            .map(|(g, r)| GeometryInfo {
                geometry_type: g.geometry_type(),
                flags: g.flags.bits(),
                primitive_count: r.primitive_count,
            })
            .collect();
        cmd.update_memory(dst + layout.geometry_info_offset as u64, bytemuck::cast_slice(&infos))?;
    }
    if layout.primitive_base_indices_offset != 0 {
        let base_indices: Vec<u32> = state.geometry_data.iter().map(|g| g.first_id).collect();
        cmd.update_memory(
            dst + layout.primitive_base_indices_offset as u64,
            bytemuck::cast_slice(&base_indices),
        )?;
    }
    Ok(())
}

fn record_update(cmd: &mut CommandBuffer, state: &BuildState<'_>) -> Result<()> {
    let device = cmd.device().clone();
    let config = device.config();
    let info = state.info;
    let layout = &state.layout;
    let scratch = UpdateScratchLayout::new(config, state.geometry_count(), state.leaf_count);
    let variant = BvhVariant::for_config(config);
    let in_place = info.src == info.dst;

    let mut flags = device_build_flags(config);
    if in_place {
        flags |= BuildFlags::UPDATE_IN_PLACE;
    }
    if variant == BvhVariant::Gfx12 && state.geometry_count() == 1 && config.single_geometry_fast_path {
        flags |= BuildFlags::UPDATE_SINGLE_GEOMETRY;
    }

    check_buffer(&device, info.src, layout.size)?;
    check_buffer(&device, info.dst, layout.size)?;
    check_buffer(&device, info.scratch, scratch.size)?;
    tracing::debug!(
        variant = variant.name(),
        leaf_count = state.leaf_count,
        in_place,
        "recording update"
    );

    if !in_place {
        cmd.copy(info.src, info.dst, layout.bvh_offset as u64)?;
    }
    cmd.fill(
        info.scratch + scratch.internal_ready_count_offset,
        scratch.size - scratch.internal_ready_count_offset,
        0,
    )?;

    match variant {
        BvhVariant::Legacy => {
            cmd.barrier("update scratch init");
            cmd.bind_pipeline(pipeline(&device, update::NAME, flags, || update::UpdateKernel { flags }));
            for (geom_data, range) in state.geometry_data.iter().zip(state.ranges) {
                if range.primitive_count == 0 {
                    continue;
                }
                cmd.push_constants(&UpdateArgs {
                    src: info.src,
                    dst: info.dst,
                    leaf_bounds: info.scratch + scratch.bounds_offset,
                    internal_ready_count: info.scratch + scratch.internal_ready_count_offset,
                    leaf_node_count: state.leaf_count,
                    reserved: 0,
                    geom_data: *geom_data,
                })?;
                cmd.dispatch(DispatchInfo::unaligned(range.primitive_count))?;
            }
        }
        BvhVariant::Gfx12 => {
            cmd.update_memory(
                info.scratch + scratch.geometry_data_offset,
                bytemuck::cast_slice(&state.geometry_data),
            )?;
            cmd.barrier("update scratch init");
            cmd.bind_pipeline(pipeline(&device, update_gfx12::NAME, flags, || update_gfx12::UpdateGfx12Kernel {
                flags,
            }));
            cmd.push_constants(&UpdateGfx12Args {
                src: info.src,
                dst: info.dst,
                geom_data: info.scratch + scratch.geometry_data_offset,
                bounds: info.scratch + scratch.bounds_offset,
                internal_ready_count: info.scratch + scratch.internal_ready_count_offset,
                leaf_node_count: state.leaf_count,
                reserved: 0,
                geom_data0: state.geometry_data.first().copied().unwrap_or_default(),
            })?;
            cmd.dispatch(
                DispatchInfo::indirect(info.src + HEADER_UPDATE_DISPATCH_OFFSET as u64)
                    .with_unaligned()
                    .ordered(),
            )?;
        }
    }
    Ok(())
}
