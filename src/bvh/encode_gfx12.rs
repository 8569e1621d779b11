//! 8-wide encoder: IR binary tree to GFX12 quantized box nodes.
//!
//! One cluster of eight invocations per IR internal node, clusters visited
//! from the root down. Each lane owns one child slot. Internal children are
//! allocated contiguously from `dst_node_offset` and leaf children from
//! `dst_leaf_node_offset`, so the node only stores the two base ids and the
//! hardware derives every child address from the slot order.

use super::args::EncodeGfx12Args;
use super::encode::{collapse_children, wait_for_offset};
use super::format::*;
use super::gfx12::{BoxChild, Gfx12BoxNode, GFX12_INSTANCE_LEAF_SIZE, GFX12_NODE_SIZE};
use super::ir::*;
use super::leaf::{ir_leaf_flags, read_ir_leaf, write_gfx12_leaf};
use super::quantize::{compute_frame, quantize};
use crate::device::cluster::{clustered_max, clustered_min, exclusive_prefix_count, read_invocation};
use crate::device::{ClusterLanes, Device, Invocation, Kernel};
use crate::util::Aabb;

pub const NAME: &str = "encode_gfx12";

/// Lanes per node.
pub const CLUSTER_SIZE: usize = 8;

/// Hardware node type of a leaf for a geometry type.
#[inline]
pub const fn gfx12_leaf_type(geometry_type: u32) -> u32 {
    if geometry_type == GEOMETRY_TYPE_INSTANCES {
        NODE_TYPE_INSTANCE
    } else {
        NODE_TYPE_TRIANGLE
    }
}

/// Leaf footprint for a geometry type.
#[inline]
pub const fn gfx12_leaf_size(geometry_type: u32) -> u32 {
    if geometry_type == GEOMETRY_TYPE_INSTANCES {
        GFX12_INSTANCE_LEAF_SIZE
    } else {
        GFX12_NODE_SIZE
    }
}

/// Cull flags stored in a box child for IR `flags`.
#[inline]
pub fn child_cull_flags(flags: u32, build_flags: BuildFlags) -> u32 {
    if build_flags.contains(BuildFlags::PROPAGATE_CULL_FLAGS) {
        flags_cull(flags)
    } else {
        0
    }
}

/// Union of per-lane boxes through clustered reductions.
pub fn cluster_bounds(lane_bounds: &[Aabb; CLUSTER_SIZE]) -> Aabb {
    let mut bounds = Aabb::EMPTY;
    for axis in 0..3 {
        bounds.min[axis] = clustered_min(&std::array::from_fn::<f32, CLUSTER_SIZE, _>(|i| lane_bounds[i].min[axis]));
        bounds.max[axis] = clustered_max(&std::array::from_fn::<f32, CLUSTER_SIZE, _>(|i| lane_bounds[i].max[axis]));
    }
    bounds
}

#[derive(Debug)]
pub struct EncodeGfx12Kernel {
    pub flags: BuildFlags,
}

impl Kernel for EncodeGfx12Kernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn cluster_size(&self) -> u32 {
        CLUSTER_SIZE as u32
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<EncodeGfx12Args>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: EncodeGfx12Args = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();
        let ir = args.intermediate_bvh;
        let body = args.output_base + args.output_bvh_offset as u64;

        let count = memory.read::<IrHeader>(args.header).ir_internal_node_count;
        let cluster = invocation.global_id / CLUSTER_SIZE as u32;
        if cluster >= count {
            return;
        }
        let ir_index = count - 1 - cluster;
        let is_root = ir_index == count - 1;

        let ir_leaf_bytes = ir_leaf_size(args.geometry_type);
        let internal_base = args.leaf_node_count * ir_leaf_bytes;
        let node_va = ir + (internal_base + ir_index * IR_BOX_NODE_SIZE) as u64;

        let offset = wait_for_offset(memory, node_va);
        if offset == IR_OFFSET_NULL {
            return;
        }

        let node = memory.read::<IrBoxNode>(node_va);
        let children = collapse_children(memory, ir, &node, CLUSTER_SIZE);
        let lanes = ClusterLanes::<CLUSTER_SIZE>::new(invocation.global_id);
        let child = |lane: usize| children.get(lane).copied();

        let is_internal: [bool; CLUSTER_SIZE] =
            std::array::from_fn(|i| child(i).is_some_and(|c| ir_type(c) == IR_NODE_INTERNAL));
        let is_leaf: [bool; CLUSTER_SIZE] =
            std::array::from_fn(|i| child(i).is_some_and(|c| ir_type(c) != IR_NODE_INTERNAL));
        let internal_mask = lanes.ballot(&is_internal);
        let leaf_mask = lanes.ballot(&is_leaf);

        // Lane 0 allocates for the whole cluster and broadcasts the bases.
        let leaf_size = gfx12_leaf_size(args.geometry_type);
        let mut internal_base = [0u32; CLUSTER_SIZE];
        let mut leaf_base = [0u32; CLUSTER_SIZE];
        let n = internal_mask.count_ones();
        if n > 0 {
            internal_base[0] = memory.atomic_add_u32(args.header + IR_HEADER_DST_NODE_OFFSET as u64, n * GFX12_NODE_SIZE);
        }
        let n = leaf_mask.count_ones();
        if n > 0 {
            leaf_base[0] = memory.atomic_add_u32(args.header + IR_HEADER_DST_LEAF_NODE_OFFSET as u64, n * leaf_size);
        }
        let internal_base_offset = read_invocation(&internal_base, 0);
        let leaf_base_offset = read_invocation(&leaf_base, 0);

        let lane_bounds: [Aabb; CLUSTER_SIZE] = std::array::from_fn(|i| match child(i) {
            Some(c) => memory.read::<IrNode>(ir + ir_offset(c) as u64).aabb,
            None => Aabb::EMPTY,
        });
        let bounds = cluster_bounds(&lane_bounds);
        let frame = compute_frame(&bounds);

        let mut out = Gfx12BoxNode::empty();
        out.internal_base_id = internal_base_offset >> 3;
        out.primitive_base_id = leaf_base_offset >> 3;
        out.set_frame(&frame, children.len() as u32);

        for lane in 0..children.len() {
            let c = children[lane];
            let child_va = ir + ir_offset(c) as u64;
            let q = quantize(&frame, &lane_bounds[lane]);

            let child_offset = if is_internal[lane] {
                let flags = memory.read::<IrBoxNode>(child_va).flags;
                let dst = internal_base_offset + exclusive_prefix_count(internal_mask, lane as u32) * GFX12_NODE_SIZE;
                out.children[lane] = BoxChild::new(
                    &q,
                    child_cull_flags(flags, self.flags),
                    flags_mask(flags),
                    NODE_TYPE_BOX32,
                    1,
                );
                memory.store_release_u32(child_va + IR_BOX_BVH_OFFSET as u64, dst);
                dst
            } else {
                let flags = ir_leaf_flags(memory, child_va, ir_type(c));
                let dst = leaf_base_offset + exclusive_prefix_count(leaf_mask, lane as u32) * leaf_size;
                out.children[lane] = BoxChild::new(
                    &q,
                    child_cull_flags(flags, self.flags),
                    flags_mask(flags),
                    gfx12_leaf_type(args.geometry_type),
                    leaf_size / GFX12_NODE_SIZE,
                );
                if let Some(leaf) = read_ir_leaf(memory, child_va, ir_type(c)) {
                    write_gfx12_leaf(memory, body + dst as u64, &leaf);
                }
                if self.flags.contains(BuildFlags::WRITE_LEAF_NODE_OFFSETS) {
                    let prim_index = ir_offset(c) / ir_leaf_bytes;
                    memory.write_u32(
                        args.output_base + args.leaf_node_offsets_offset as u64 + prim_index as u64 * 4,
                        dst,
                    );
                }
                dst
            };

            memory.write_u32(
                parent_link_va(body, child_offset, GFX12_NODE_SIZE),
                node_id(offset, NODE_TYPE_BOX32),
            );
        }

        memory.write(body + offset as u64, &out);

        if is_root {
            memory.write(args.output_base + HEADER_AABB_OFFSET as u64, &bounds);
            memory.write_u32(args.output_base, args.output_bvh_offset);
            memory.write_u32(args.output_base + HEADER_ROOT_FLAGS_OFFSET as u64, node.flags);
        }
    }
}
