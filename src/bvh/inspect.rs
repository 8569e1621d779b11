//! Host-side structure inspection.
//!
//! Decodes both node formats from device memory, walks the tree from the
//! root and checks the structural invariants the kernels rely on:
//!
//! - every child's parent link names the node that references it
//! - child offsets stay inside the structure and on the node grid
//! - every stored child box contains the child's actual contents, and is
//!   only empty for slots the kernels marked inactive
//! - the header box contains the root's children
//! - no node is reachable twice

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::format::*;
use super::gfx12::{Gfx12BoxNode, Gfx12InstanceNode, Gfx12InstanceUserData, Gfx12PrimitiveNode, GFX12_NODE_SIZE};
use super::quantize::{dequantize, QuantBox};
use super::BvhVariant;
use crate::device::DeviceMemory;
use crate::util::{transform_aabb, Aabb, Mat3x4, Result};

/// A broken invariant found while walking a structure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Issue {
    #[error("node {child:#x}: parent link {found:#x}, expected {expected:#x}")]
    ParentLink { child: u32, expected: u32, found: u32 },

    #[error("node {offset:#x} outside the structure or off the node grid")]
    BadOffset { offset: u32 },

    #[error("child {child:#x} of node {parent:#x} escapes its box")]
    NotContained { parent: u32, child: u32 },

    #[error("child {child:#x} of node {parent:#x} has contents but an empty box")]
    EmptyBox { parent: u32, child: u32 },

    #[error("node {offset:#x} reached twice")]
    Revisited { offset: u32 },

    #[error("header bounds do not contain the root")]
    HeaderBounds,
}

/// One decoded child slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildRef {
    pub id: u32,
    /// Box stored in the parent (dequantized for 8-wide nodes)
    pub bounds: Aabb,
    /// Slot carries the inactive encoding (NaN box, or the empty quantized box)
    pub inactive: bool,
}

impl ChildRef {
    #[inline]
    pub fn offset(&self) -> u32 {
        node_offset(self.id)
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        node_type(self.id) == NODE_TYPE_BOX32
    }
}

/// A decoded leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafInfo {
    pub offset: u32,
    pub node_type: u32,
    pub geometry_id: u32,
    pub primitive_id: u32,
    /// Primitive bounds, `None` for instances whose BLAS is not readable
    pub bounds: Option<Aabb>,
    /// Triangle vertices as stored
    pub vertices: Option<[[f32; 3]; 3]>,
}

/// Tree statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BvhStats {
    pub variant: &'static str,
    pub internal_nodes: u32,
    pub leaf_nodes: u32,
    pub max_depth: u32,
    /// Histogram of children per internal node, index = child count
    pub child_histogram: Vec<u32>,
    /// Surface area heuristic cost relative to the root box
    pub sah_cost: f32,
    pub compacted_size: u64,
    pub serialization_size: u64,
    pub root_bounds: [f32; 6],
}

/// Read-only view of an acceleration structure in device memory.
pub struct Inspector<'a> {
    memory: &'a DeviceMemory,
    base: u64,
    header: AccelStructHeader,
    flags: BuildFlags,
    variant: BvhVariant,
}

impl<'a> Inspector<'a> {
    /// `flags` are the device's kernel flags; they select the node format.
    pub fn new(memory: &'a DeviceMemory, base: u64, flags: BuildFlags) -> Result<Self> {
        let header = memory.host_read::<AccelStructHeader>(base)?;
        Ok(Self {
            memory,
            base,
            header,
            flags,
            variant: BvhVariant::from_flags(flags),
        })
    }

    #[inline]
    pub fn header(&self) -> &AccelStructHeader {
        &self.header
    }

    #[inline]
    pub fn variant(&self) -> BvhVariant {
        self.variant
    }

    #[inline]
    fn body(&self) -> u64 {
        self.base + self.header.bvh_offset as u64
    }

    /// Parent link stored for the node at `offset`.
    pub fn parent_link(&self, offset: u32) -> u32 {
        self.memory
            .read_u32(parent_link_va(self.body(), offset, self.variant.node_size_gcd()))
    }

    /// Children of the internal node at `offset`.
    pub fn children(&self, offset: u32) -> Vec<ChildRef> {
        let va = self.body() + offset as u64;
        match self.variant {
            BvhVariant::Legacy => {
                let node = self.memory.read::<Box32Node>(va);
                node.children
                    .iter()
                    .zip(&node.coords)
                    .filter(|(&id, _)| id != INVALID_NODE)
                    .map(|(&id, &bounds)| ChildRef {
                        id,
                        bounds,
                        inactive: bounds.has_nan(),
                    })
                    .collect()
            }
            BvhVariant::Gfx12 => {
                let node = self.memory.read::<Gfx12BoxNode>(va);
                let frame = node.frame();
                node.child_ids()
                    .iter()
                    .zip(&node.children)
                    .filter_map(|(id, child)| {
                        id.map(|id| {
                            let q = child.bounds();
                            ChildRef {
                                id,
                                bounds: dequantize(&frame, &q),
                                inactive: q == QuantBox::EMPTY,
                            }
                        })
                    })
                    .collect()
            }
        }
    }

    fn blas_bounds(&self, bvh_ptr: u64, blas_bvh_offset: u32, otw: &Mat3x4) -> Option<Aabb> {
        let blas = node_to_addr(bvh_ptr).wrapping_sub(blas_bvh_offset as u64);
        let header = self.memory.try_read::<AccelStructHeader>(blas)?;
        Some(transform_aabb(otw, &header.aabb))
    }

    /// Decode the leaf referenced by `id`.
    pub fn leaf(&self, id: u32) -> LeafInfo {
        let offset = node_offset(id);
        let va = self.body() + offset as u64;
        let ty = node_type(id);
        let mut vertices = None;
        let (geometry_id, primitive_id, bounds) = match (self.variant, ty) {
            (BvhVariant::Legacy, NODE_TYPE_TRIANGLE) => {
                let node = self.memory.read::<TriangleNode>(va);
                let mut b = Aabb::EMPTY;
                node.coords.iter().for_each(|v| b.grow_point(*v));
                vertices = Some(node.coords);
                (node.geometry_id_and_flags & GEOMETRY_ID_MASK, node.triangle_id, Some(b))
            }
            (BvhVariant::Legacy, NODE_TYPE_AABB) => {
                let node = self.memory.read::<AabbNode>(va);
                (node.geometry_id_and_flags & GEOMETRY_ID_MASK, node.primitive_id, Some(node.aabb))
            }
            (BvhVariant::Legacy, _) => {
                let node = self.memory.read::<InstanceNode>(va);
                let bounds = self.blas_bounds(node.bvh_ptr, node.bvh_offset, &node.otw_matrix);
                (0, node.instance_id, bounds)
            }
            (BvhVariant::Gfx12, NODE_TYPE_INSTANCE) => {
                let node = self.memory.read::<Gfx12InstanceNode>(va);
                let user = self.memory.read::<Gfx12InstanceUserData>(va + GFX12_NODE_SIZE as u64);
                let bounds = self.blas_bounds(node.pointer_flags_bvh_addr, user.bvh_offset, &user.otw_matrix);
                (0, user.instance_index, bounds)
            }
            (BvhVariant::Gfx12, _) => {
                let info = self.memory.read::<Gfx12PrimitiveNode>(va).decode();
                if !info.procedural {
                    vertices = Some(info.vertices);
                }
                (info.geometry_id, info.primitive_id, Some(info.bounds()))
            }
        };
        LeafInfo {
            offset,
            node_type: ty,
            geometry_id,
            primitive_id,
            bounds,
            vertices,
        }
    }

    /// Every reachable leaf, in depth-first order.
    pub fn leaves(&self) -> Vec<LeafInfo> {
        let mut out = Vec::new();
        let mut stack = vec![0u32];
        let mut seen = HashSet::new();
        while let Some(offset) = stack.pop() {
            if !seen.insert(offset) {
                continue;
            }
            for child in self.children(offset) {
                if child.is_internal() {
                    stack.push(child.offset());
                } else {
                    out.push(self.leaf(child.id));
                }
            }
        }
        out
    }

    fn offset_ok(&self, offset: u32) -> bool {
        let body_size = self.header.compacted_size.saturating_sub(self.header.bvh_offset as u64);
        offset as u64 % self.variant.node_size_gcd() as u64 == 0 && (offset as u64) < body_size
    }

    /// Check every structural invariant. An empty result means the
    /// structure is well formed.
    ///
    /// Containment is checked against the true contents of each subtree
    /// (the union of its primitive bounds), since quantized boxes are
    /// conservative and nest loosely.
    pub fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        let found = self.parent_link(0);
        if found != INVALID_NODE {
            issues.push(Issue::ParentLink {
                child: 0,
                expected: INVALID_NODE,
                found,
            });
        }

        // Top-down: links, offsets, reachability.
        let mut nodes: Vec<(u32, Vec<ChildRef>)> = Vec::new();
        let mut contents: HashMap<u32, Aabb> = HashMap::new();
        let mut seen = HashSet::new();
        let mut stack = vec![0u32];
        while let Some(offset) = stack.pop() {
            if !seen.insert(offset) {
                issues.push(Issue::Revisited { offset });
                continue;
            }
            let parent_id = node_id(offset, NODE_TYPE_BOX32);
            let mut children = self.children(offset);
            children.retain(|child| {
                let child_offset = child.offset();
                if !self.offset_ok(child_offset) {
                    issues.push(Issue::BadOffset { offset: child_offset });
                    return false;
                }
                let link = self.parent_link(child_offset);
                if link != parent_id {
                    issues.push(Issue::ParentLink {
                        child: child_offset,
                        expected: parent_id,
                        found: link,
                    });
                }
                true
            });
            for child in &children {
                if child.is_internal() {
                    stack.push(child.offset());
                } else {
                    let bounds = self.leaf(child.id).bounds.unwrap_or(Aabb::EMPTY);
                    contents.insert(child.offset(), self.stored_form(&bounds));
                }
            }
            nodes.push((offset, children));
        }

        // Bottom-up: children were discovered after their parents.
        for (offset, children) in nodes.iter().rev() {
            let mut union = Aabb::EMPTY;
            for child in children {
                // Primitives that went inactive since the build keep stale
                // node bytes behind an inactive slot.
                if child.inactive {
                    continue;
                }
                let inner = contents.get(&child.offset()).copied().unwrap_or(Aabb::EMPTY);
                if inner.is_empty() || inner.has_nan() {
                    continue;
                }
                if child.bounds.is_empty() || child.bounds.has_nan() {
                    issues.push(Issue::EmptyBox {
                        parent: *offset,
                        child: child.offset(),
                    });
                } else if !child.bounds.contains(&inner) {
                    issues.push(Issue::NotContained {
                        parent: *offset,
                        child: child.offset(),
                    });
                }
                union.grow(&inner);
            }
            contents.insert(*offset, union);
        }

        let root = contents.get(&0).copied().unwrap_or(Aabb::EMPTY);
        if !root.is_empty() && !self.header.aabb.contains(&root) {
            issues.push(Issue::HeaderBounds);
        }
        issues
    }

    /// Bounds as the encoder stores them.
    fn stored_form(&self, bounds: &Aabb) -> Aabb {
        if self.flags.contains(BuildFlags::NO_INFS) && !bounds.is_empty() {
            bounds.clamp_infinities()
        } else {
            *bounds
        }
    }

    pub fn stats(&self) -> BvhStats {
        let mut stats = BvhStats {
            variant: self.variant.name(),
            child_histogram: vec![0; self.variant.max_children() as usize + 1],
            compacted_size: self.header.compacted_size,
            serialization_size: self.header.serialization_size,
            root_bounds: [
                self.header.aabb.min[0],
                self.header.aabb.min[1],
                self.header.aabb.min[2],
                self.header.aabb.max[0],
                self.header.aabb.max[1],
                self.header.aabb.max[2],
            ],
            ..Default::default()
        };

        let root_area = self.header.aabb.area();
        let mut area_sum = 0.0f64;
        let mut stack = vec![(0u32, 1u32)];
        let mut seen = HashSet::new();
        while let Some((offset, depth)) = stack.pop() {
            if !seen.insert(offset) {
                continue;
            }
            stats.internal_nodes += 1;
            stats.max_depth = stats.max_depth.max(depth);
            let children = self.children(offset);
            if let Some(slot) = stats.child_histogram.get_mut(children.len()) {
                *slot += 1;
            }
            for child in children {
                if !child.bounds.has_nan() {
                    area_sum += child.bounds.area() as f64;
                }
                if child.is_internal() {
                    stack.push((child.offset(), depth + 1));
                } else {
                    stats.leaf_nodes += 1;
                }
            }
        }
        if root_area > 0.0 && root_area.is_finite() {
            stats.sah_cost = (area_sum / root_area as f64) as f32;
        }
        stats
    }
}
