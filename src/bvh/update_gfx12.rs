//! 8-wide bottom-up refit.
//!
//! One cluster of eight invocations per internal node. Clusters are mapped
//! to nodes in reverse allocation order and dispatched in order, so every
//! child node is picked up before its parent. Leaf lanes rebuild their
//! primitive from the application geometry; internal lanes wait for the
//! child node's ready flag. The cluster then reduces the child boxes,
//! derives a new quantization frame and rewrites the node. Child type,
//! size, cull flags and mask are kept from the source node.

use std::sync::atomic::{fence, Ordering};

use super::args::UpdateGfx12Args;
use super::encode_gfx12::{cluster_bounds, CLUSTER_SIZE};
use super::format::*;
use super::gfx12::{Gfx12BoxNode, Gfx12InstanceUserData, Gfx12PrimitiveNode, GFX12_NODE_SIZE};
use super::leaf::build_leaf;
use super::quantize::{compute_frame, quantize, QuantBox};
use crate::device::{Backoff, ClusterLanes, Device, DeviceMemory, Invocation, Kernel};
use crate::util::Aabb;

pub const NAME: &str = "update_gfx12";

const AABB_SIZE: u64 = std::mem::size_of::<Aabb>() as u64;
const GEOMETRY_DATA_SIZE: u64 = std::mem::size_of::<GeometryData>() as u64;

/// Index of the internal node at `offset` (root is 0).
#[inline]
pub fn gfx12_node_index(offset: u32, internal_rel: u32) -> u32 {
    if offset == 0 {
        0
    } else {
        (offset - internal_rel) / GFX12_NODE_SIZE + 1
    }
}

/// Offset of internal node `index`.
#[inline]
pub fn gfx12_node_offset(index: u32, internal_rel: u32) -> u32 {
    if index == 0 {
        0
    } else {
        internal_rel + (index - 1) * GFX12_NODE_SIZE
    }
}

#[derive(Debug)]
pub struct UpdateGfx12Kernel {
    pub flags: BuildFlags,
}

impl UpdateGfx12Kernel {
    /// Geometry and primitive index recorded in a leaf.
    fn leaf_ids(memory: &DeviceMemory, leaf_va: u64, child_type: u32) -> (u32, u32) {
        if child_type == NODE_TYPE_INSTANCE {
            let user = memory.read::<Gfx12InstanceUserData>(leaf_va + GFX12_NODE_SIZE as u64);
            (0, user.instance_index)
        } else {
            let node = memory.read::<Gfx12PrimitiveNode>(leaf_va);
            (node.geometry_id(), node.primitive_id())
        }
    }

    fn geometry(&self, memory: &DeviceMemory, args: &UpdateGfx12Args, geometry_id: u32) -> GeometryData {
        if self.flags.contains(BuildFlags::UPDATE_SINGLE_GEOMETRY) {
            args.geom_data0
        } else {
            memory.read::<GeometryData>(args.geom_data + geometry_id as u64 * GEOMETRY_DATA_SIZE)
        }
    }
}

impl Kernel for UpdateGfx12Kernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn cluster_size(&self) -> u32 {
        CLUSTER_SIZE as u32
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<UpdateGfx12Args>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: UpdateGfx12Args = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();

        let internal_count = invocation.count / CLUSTER_SIZE as u32;
        let cluster = invocation.global_id / CLUSTER_SIZE as u32;
        if cluster >= internal_count {
            return;
        }
        let index = internal_count - 1 - cluster;

        let header = memory.read::<AccelStructHeader>(args.src);
        let src_body = args.src + header.bvh_offset as u64;
        let dst_body = args.dst + header.bvh_offset as u64;
        let internal_rel = header.internal_nodes_offset - header.bvh_offset;
        let offset = gfx12_node_offset(index, internal_rel);

        let mut node = memory.read::<Gfx12BoxNode>(src_body + offset as u64);
        let ids = node.child_ids();
        let lanes = ClusterLanes::<CLUSTER_SIZE>::new(invocation.global_id);

        let child_index: [Option<u32>; CLUSTER_SIZE] = std::array::from_fn(|i| {
            ids[i]
                .filter(|&id| node_type(id) == NODE_TYPE_BOX32)
                .map(|id| gfx12_node_index(node_offset(id), internal_rel))
        });

        // Leaf lanes
        let mut lane_bounds = [Aabb::EMPTY; CLUSTER_SIZE];
        for lane in 0..CLUSTER_SIZE {
            let Some(id) = ids[lane] else { continue };
            if child_index[lane].is_some() {
                continue;
            }
            let leaf_offset = node_offset(id) as u64;
            let (geometry_id, primitive_id) = Self::leaf_ids(memory, src_body + leaf_offset, node_type(id));
            let geom = self.geometry(memory, &args, geometry_id);
            let active = build_leaf(memory, &mut lane_bounds[lane], dst_body + leaf_offset, &geom, primitive_id, true);
            if !active && !self.flags.contains(BuildFlags::UPDATE_IN_PLACE) {
                let size = node.children[lane].node_size() as u64 * GFX12_NODE_SIZE as u64;
                memory.copy(src_body + leaf_offset, dst_body + leaf_offset, size);
            }
        }

        // Internal lanes
        let ready_va = |i: u32| args.internal_ready_count + i as u64 * 4;
        let mut backoff = Backoff::new();
        loop {
            let ready: [bool; CLUSTER_SIZE] = std::array::from_fn(|i| match child_index[i] {
                Some(idx) => memory.load_acquire_u32(ready_va(idx)) != 0,
                None => true,
            });
            if lanes.ballot(&ready) == ClusterLanes::<CLUSTER_SIZE>::full_mask() {
                break;
            }
            backoff.snooze();
        }
        for lane in 0..CLUSTER_SIZE {
            if let Some(idx) = child_index[lane] {
                lane_bounds[lane] = memory.read::<Aabb>(args.bounds + idx as u64 * AABB_SIZE);
            }
        }

        let bounds = cluster_bounds(&lane_bounds);
        let frame = compute_frame(&bounds);
        let valid = node.valid_child_count();
        node.set_frame(&frame, valid);
        for lane in 0..CLUSTER_SIZE {
            if ids[lane].is_none() {
                continue;
            }
            let q = if lane_bounds[lane].is_empty() || lane_bounds[lane].has_nan() {
                QuantBox::EMPTY
            } else {
                quantize(&frame, &lane_bounds[lane])
            };
            node.children[lane].set_bounds(&q);
        }
        memory.write(dst_body + offset as u64, &node);

        if index == 0 {
            memory.write(args.dst + HEADER_AABB_OFFSET as u64, &bounds);
        } else {
            memory.write(args.bounds + index as u64 * AABB_SIZE, &bounds);
            fence(Ordering::Release);
            memory.store_release_u32(ready_va(index), 1);
        }
    }
}
