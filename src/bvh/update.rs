//! Legacy bottom-up refit of 4-wide structures.
//!
//! One invocation per primitive of one geometry. Each invocation rebuilds
//! its leaf, publishes the leaf bounds in update scratch and climbs the
//! parent links. At every parent it bumps the node's ready counter; only
//! the invocation that completes the count (sees `valid_children - 1`)
//! recomputes the node and keeps climbing, the others stop. The invocation
//! that finishes the root also writes the header bounds.
//!
//! Leaves whose parent link is invalid were inactive at build time and
//! take no part. A leaf that turned inactive since the build contributes
//! empty bounds and keeps its previous node contents.

use std::sync::atomic::{fence, Ordering};

use super::args::UpdateArgs;
use super::format::*;
use super::leaf::build_leaf;
use crate::device::{Device, DeviceMemory, Invocation, Kernel};
use crate::util::Aabb;

pub const NAME: &str = "update";

const AABB_SIZE: u64 = std::mem::size_of::<Aabb>() as u64;

/// Index of an internal node in the ready-counter array.
#[inline]
pub fn ready_index(node_offset: u32, internal_rel: u32) -> u32 {
    if node_offset == 0 {
        0
    } else {
        (node_offset - internal_rel) / BOX32_NODE_SIZE + 1
    }
}

/// Union of a box node's populated child boxes.
pub fn box32_bounds(node: &Box32Node) -> Aabb {
    let mut bounds = Aabb::EMPTY;
    for (child, coords) in node.children.iter().zip(&node.coords) {
        if *child != INVALID_NODE && !coords.has_nan() {
            bounds.grow(coords);
        }
    }
    bounds
}

/// Box stored for a child with bounds `bounds`.
#[inline]
fn child_coords(bounds: &Aabb, no_infs: bool) -> Aabb {
    if bounds.is_empty() || bounds.has_nan() {
        Aabb::NAN
    } else if no_infs {
        bounds.clamp_infinities()
    } else {
        *bounds
    }
}

#[derive(Debug)]
pub struct UpdateKernel {
    pub flags: BuildFlags,
}

impl UpdateKernel {
    /// Recompute the box node at `offset` from its children's fresh bounds.
    fn refit_node(&self, memory: &DeviceMemory, args: &UpdateArgs, bodies: (u64, u64), offset: u32) -> Aabb {
        let (src_body, dst_body) = bodies;
        let geometry_type = args.geom_data.geometry_type;
        let leaf_size = legacy_leaf_size(geometry_type);
        let no_infs = self.flags.contains(BuildFlags::NO_INFS);

        let mut node = memory.read::<Box32Node>(src_body + offset as u64);
        let mut bounds = Aabb::EMPTY;
        for (child, coords) in node.children.iter().zip(node.coords.iter_mut()) {
            if *child == INVALID_NODE {
                continue;
            }
            let child_offset = node_offset(*child);
            let child_bounds = if node_type(*child) == NODE_TYPE_BOX32 {
                box32_bounds(&memory.read::<Box32Node>(dst_body + child_offset as u64))
            } else {
                let leaf_index = (child_offset - BOX32_NODE_SIZE) / leaf_size;
                memory.read::<Aabb>(args.leaf_bounds + leaf_index as u64 * AABB_SIZE)
            };
            *coords = child_coords(&child_bounds, no_infs);
            if !coords.has_nan() {
                bounds.grow(coords);
            }
        }
        memory.write(dst_body + offset as u64, &node);
        bounds
    }
}

impl Kernel for UpdateKernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<UpdateArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: UpdateArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();
        let geom = &args.geom_data;

        let header = memory.read::<AccelStructHeader>(args.src);
        let src_body = args.src + header.bvh_offset as u64;
        let dst_body = args.dst + header.bvh_offset as u64;
        let internal_rel = header.internal_nodes_offset - header.bvh_offset;

        let leaf_size = legacy_leaf_size(geom.geometry_type);
        let global = geom.first_id + invocation.global_id;
        let leaf_offset = BOX32_NODE_SIZE + global * leaf_size;

        let mut parent = memory.read_u32(parent_link_va(src_body, leaf_offset, LEGACY_NODE_SIZE_GCD));
        if parent == INVALID_NODE {
            return;
        }

        let mut bounds = Aabb::EMPTY;
        let active = build_leaf(memory, &mut bounds, dst_body + leaf_offset as u64, geom, invocation.global_id, false);
        if !active && !self.flags.contains(BuildFlags::UPDATE_IN_PLACE) {
            memory.copy(src_body + leaf_offset as u64, dst_body + leaf_offset as u64, leaf_size as u64);
        }
        memory.write(args.leaf_bounds + global as u64 * AABB_SIZE, &bounds);
        fence(Ordering::Release);

        loop {
            let offset = node_offset(parent);
            let valid = memory.read::<Box32Node>(src_body + offset as u64).valid_child_count();
            let ready_va = args.internal_ready_count + ready_index(offset, internal_rel) as u64 * 4;
            if memory.atomic_add_u32(ready_va, 1) != valid - 1 {
                return;
            }

            let node_bounds = self.refit_node(memory, &args, (src_body, dst_body), offset);
            if offset == 0 {
                memory.write(args.dst + HEADER_AABB_OFFSET as u64, &node_bounds);
                return;
            }
            parent = memory.read_u32(parent_link_va(src_body, offset, LEGACY_NODE_SIZE_GCD));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_index() {
        assert_eq!(ready_index(0, 1152), 0);
        assert_eq!(ready_index(1152, 1152), 1);
        assert_eq!(ready_index(1152 + 3 * 128, 1152), 4);
    }

    #[test]
    fn test_box32_bounds_skips_empty_slots() {
        let mut node = Box32Node::empty();
        assert!(box32_bounds(&node).is_empty());

        node.children[0] = node_id(128, NODE_TYPE_TRIANGLE);
        node.coords[0] = Aabb::new([0.0; 3], [1.0; 3]);
        // Populated slot whose leaf went inactive.
        node.children[2] = node_id(192, NODE_TYPE_TRIANGLE);
        node.children[3] = node_id(256, NODE_TYPE_TRIANGLE);
        node.coords[3] = Aabb::new([-1.0; 3], [0.5; 3]);
        assert_eq!(box32_bounds(&node), Aabb::new([-1.0; 3], [1.0; 3]));
    }

    #[test]
    fn test_child_coords() {
        assert!(child_coords(&Aabb::EMPTY, false).has_nan());
        let inf = Aabb::new([f32::NEG_INFINITY, 0.0, 0.0], [1.0; 3]);
        assert_eq!(child_coords(&inf, false), inf);
        assert_eq!(child_coords(&inf, true).min[0], -f32::MAX);
    }
}
