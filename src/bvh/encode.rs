//! Legacy encoder: IR binary tree to 4-wide box32 nodes.
//!
//! One invocation per IR internal node, visited from the root down
//! (invocation `i` handles internal node `count - 1 - i`). An invocation
//! waits until its parent has published the node's output offset, collapses
//! the binary subtree below it into at most four children, allocates and
//! announces the internal children, then writes its own node, its leaf
//! children and the parent links. Nodes absorbed into a parent are marked
//! [`IR_OFFSET_NULL`] and their invocations exit without output.

use smallvec::SmallVec;

use super::args::EncodeArgs;
use super::format::*;
use super::ir::*;
use super::leaf::{read_ir_leaf, write_legacy_leaf};
use crate::device::{Backoff, Device, DeviceMemory, Invocation, Kernel};
use crate::util::Aabb;

pub const NAME: &str = "encode";

/// Children of an IR node after collapsing.
pub type CollapsedChildren = SmallVec<[u32; 8]>;

/// Collapse the binary subtree below an IR node into at most `max`
/// children by repeatedly expanding the internal child with the largest
/// surface area. Expanded nodes are marked [`IR_OFFSET_NULL`].
pub fn collapse_children(memory: &DeviceMemory, ir: u64, node: &IrBoxNode, max: usize) -> CollapsedChildren {
    let mut children: CollapsedChildren = node.children.iter().copied().filter(|&c| c != IR_INVALID).collect();

    while children.len() < max {
        let mut best: Option<(usize, f32)> = None;
        for (i, &child) in children.iter().enumerate() {
            if ir_type(child) != IR_NODE_INTERNAL {
                continue;
            }
            let area = memory.read::<IrNode>(ir + ir_offset(child) as u64).aabb.area();
            if best.is_none_or(|(_, best_area)| area > best_area) {
                best = Some((i, area));
            }
        }
        let Some((i, _)) = best else { break };

        let va = ir + ir_offset(children[i]) as u64;
        let collapsed = memory.read::<IrBoxNode>(va);
        memory.store_release_u32(va + IR_BOX_BVH_OFFSET as u64, IR_OFFSET_NULL);

        let mut grandchildren = collapsed.children.iter().copied().filter(|&c| c != IR_INVALID);
        match (grandchildren.next(), grandchildren.next()) {
            (Some(a), Some(b)) => {
                children[i] = a;
                children.push(b);
            }
            (Some(a), None) => children[i] = a,
            _ => {
                children.remove(i);
            }
        }
    }
    children
}

/// Wait until the parent encoder publishes this node's output offset.
pub fn wait_for_offset(memory: &DeviceMemory, node_va: u64) -> u32 {
    let mut backoff = Backoff::new();
    loop {
        let offset = memory.load_acquire_u32(node_va + IR_BOX_BVH_OFFSET as u64);
        if offset != IR_OFFSET_UNKNOWN {
            return offset;
        }
        backoff.snooze();
    }
}

#[derive(Debug)]
pub struct EncodeKernel {
    pub flags: BuildFlags,
}

impl Kernel for EncodeKernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<EncodeArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: EncodeArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();
        let ir = args.intermediate_bvh;

        let ir_header = memory.read::<IrHeader>(args.header);
        let count = ir_header.ir_internal_node_count;
        if invocation.global_id >= count {
            return;
        }
        let ir_index = count - 1 - invocation.global_id;
        let is_root = ir_index == count - 1;

        let ir_leaf_bytes = ir_leaf_size(args.geometry_type);
        let internal_base = args.leaf_node_count * ir_leaf_bytes;
        let node_va = ir + (internal_base + ir_index * IR_BOX_NODE_SIZE) as u64;

        let offset = wait_for_offset(memory, node_va);
        if offset == IR_OFFSET_NULL {
            return;
        }

        let node = memory.read::<IrBoxNode>(node_va);
        let children = collapse_children(memory, ir, &node, 4);

        let leaf_size = legacy_leaf_size(args.geometry_type);
        let leaf_type = legacy_leaf_type(args.geometry_type);
        let internal_count = children.iter().filter(|&&c| ir_type(c) == IR_NODE_INTERNAL).count() as u32;

        let mut next_internal = if self.flags.contains(BuildFlags::COMPACT) && internal_count > 0 {
            memory.atomic_add_u32(
                args.header + IR_HEADER_DST_NODE_OFFSET as u64,
                internal_count * BOX32_NODE_SIZE,
            )
        } else {
            0
        };

        let mut out = Box32Node::empty();
        let mut bounds = Aabb::EMPTY;
        for (slot, &child) in children.iter().enumerate() {
            let child_va = ir + ir_offset(child) as u64;
            let mut aabb = memory.read::<IrNode>(child_va).aabb;
            if self.flags.contains(BuildFlags::NO_INFS) {
                aabb = aabb.clamp_infinities();
            }

            let child_offset = if ir_type(child) == IR_NODE_INTERNAL {
                let dst = if self.flags.contains(BuildFlags::COMPACT) {
                    let dst = next_internal;
                    next_internal += BOX32_NODE_SIZE;
                    dst
                } else {
                    let child_index = (ir_offset(child) - internal_base) / IR_BOX_NODE_SIZE;
                    ir_header.dst_node_offset + child_index * BOX32_NODE_SIZE
                };
                memory.store_release_u32(child_va + IR_BOX_BVH_OFFSET as u64, dst);
                out.children[slot] = node_id(dst, NODE_TYPE_BOX32);
                dst
            } else {
                let prim_index = ir_offset(child) / ir_leaf_bytes;
                let dst = BOX32_NODE_SIZE + prim_index * leaf_size;
                if let Some(leaf) = read_ir_leaf(memory, child_va, ir_type(child)) {
                    write_legacy_leaf(memory, args.output_bvh + dst as u64, &leaf);
                }
                out.children[slot] = node_id(dst, leaf_type);
                dst
            };

            out.coords[slot] = aabb;
            bounds.grow(&aabb);
            memory.write_u32(
                parent_link_va(args.output_bvh, child_offset, LEGACY_NODE_SIZE_GCD),
                node_id(offset, NODE_TYPE_BOX32),
            );
        }

        memory.write(args.output_bvh + offset as u64, &out);

        if is_root {
            let header_va = args.output_bvh - args.output_bvh_offset as u64;
            memory.write(header_va + HEADER_AABB_OFFSET as u64, &bounds);
            memory.write_u32(header_va, args.output_bvh_offset);
            memory.write_u32(header_va + HEADER_ROOT_FLAGS_OFFSET as u64, node.flags);
        }
    }
}
