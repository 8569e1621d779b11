//! IR tree builder.
//!
//! Turns the leaves written by the leaf stage into a binary tree with a
//! binned surface area heuristic. Every tree leaf is exactly one
//! primitive; splitting always continues while a range holds more than one
//! leaf, falling back to a median split when the centroids cannot be
//! separated. Inactive leaves (NaN boxes) are left out of the tree.
//!
//! The builder runs as a single invocation. Internal nodes are emitted in
//! post-order, so the root is always the last internal node, and the root
//! is the only node whose output offset is known before encoding starts.

use super::args::IrBuildArgs;
use super::ir::*;
use super::leaf::ir_leaf_flags;
use crate::device::{Device, DeviceMemory, Invocation, Kernel};
use crate::util::Aabb;

pub const NAME: &str = "ir_build";

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

#[derive(Debug, Default)]
pub struct IrBuildKernel;

/// One active leaf as seen by the builder.
#[derive(Debug, Clone, Copy)]
struct BuildLeaf {
    id: u32,
    aabb: Aabb,
    centroid: [f32; 3],
    flags: u32,
}

/// Builder-side tree node.
#[derive(Debug, Clone, Copy)]
enum TempNode {
    Leaf(usize),
    Internal { left: usize, right: usize },
}

/// SAH bin for evaluating split candidates.
#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

impl Bin {
    const EMPTY: Self = Self {
        bounds: Aabb::EMPTY,
        count: 0,
    };
}

/// Build the temporary binary tree over `leaves`. Returns the node array
/// with the root at index 0.
fn build_tree(leaves: &[BuildLeaf]) -> Vec<TempNode> {
    let n = leaves.len();
    let mut indices: Vec<usize> = (0..n).collect();
    let mut nodes = Vec::with_capacity(2 * n);
    nodes.push(TempNode::Leaf(0));

    struct Task {
        node_idx: usize,
        start: usize,
        end: usize,
    }

    let mut stack = vec![Task {
        node_idx: 0,
        start: 0,
        end: n,
    }];

    while let Some(task) = stack.pop() {
        let (start, end) = (task.start, task.end);
        if end - start == 1 {
            nodes[task.node_idx] = TempNode::Leaf(indices[start]);
            continue;
        }

        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            centroid_bounds.grow_point(leaves[idx].centroid);
        }

        let (axis, split_pos) = find_best_split(&indices[start..end], leaves, &centroid_bounds);
        let mid = match axis {
            Some(axis) => partition(&mut indices[start..end], |&idx| leaves[idx].centroid[axis] < split_pos) + start,
            None => start,
        };
        let mid = if mid == start || mid == end { (start + end) / 2 } else { mid };

        let left = nodes.len();
        let right = left + 1;
        nodes.push(TempNode::Leaf(0));
        nodes.push(TempNode::Leaf(0));
        nodes[task.node_idx] = TempNode::Internal { left, right };

        stack.push(Task {
            node_idx: right,
            start: mid,
            end,
        });
        stack.push(Task {
            node_idx: left,
            start,
            end: mid,
        });
    }
    nodes
}

/// Binned SAH split search across all three axes. Returns `None` when
/// every axis is degenerate.
fn find_best_split(indices: &[usize], leaves: &[BuildLeaf], centroid_bounds: &Aabb) -> (Option<usize>, f32) {
    let mut best_axis = None;
    let mut best_pos = 0.0f32;
    let mut best_cost = f32::INFINITY;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent <= 0.0 || !extent.is_finite() {
            continue;
        }

        let mut bins = [Bin::EMPTY; NUM_BINS];
        let inv_extent = NUM_BINS as f32 / extent;
        for &idx in indices {
            let bin_id = ((leaves[idx].centroid[axis] - centroid_bounds.min[axis]) * inv_extent) as usize;
            let bin = &mut bins[bin_id.min(NUM_BINS - 1)];
            bin.bounds.grow(&leaves[idx].aabb);
            bin.count += 1;
        }

        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            if left_count[i - 1] == 0 || sweep_count == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECT_COST * (left_count[i - 1] as f32 * left_area[i - 1] + sweep_count as f32 * sweep.area());
            if cost < best_cost {
                best_cost = cost;
                best_axis = Some(axis);
                best_pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
            }
        }
    }

    (best_axis, best_pos)
}

/// Partition in place. Returns the count of elements matching `pred`.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

/// Emits internal nodes in post-order.
struct Emitter<'a> {
    memory: &'a DeviceMemory,
    ir: u64,
    internal_base: u32,
    next_index: u32,
}

impl Emitter<'_> {
    /// Write one internal node and return its IR id.
    fn emit(&mut self, aabb: Aabb, children: [u32; 2], flags: u32, is_root: bool) -> u32 {
        let offset = self.internal_base + self.next_index * IR_BOX_NODE_SIZE;
        self.next_index += 1;
        let node = IrBoxNode {
            base: IrNode { aabb },
            children,
            bvh_offset: if is_root { 0 } else { IR_OFFSET_UNKNOWN },
            flags,
        };
        self.memory.write(self.ir + offset as u64, &node);
        ir_id(offset, IR_NODE_INTERNAL)
    }
}

impl Kernel for IrBuildKernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<IrBuildArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], _invocation: Invocation) {
        let args: IrBuildArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();
        let leaf_size = ir_leaf_size(args.geometry_type);
        let leaf_type = ir_leaf_type(args.geometry_type);

        let leaves: Vec<BuildLeaf> = (0..args.leaf_count)
            .filter_map(|i| {
                let offset = i * leaf_size;
                let va = args.ir + offset as u64;
                let aabb = memory.read::<IrNode>(va).aabb;
                if aabb.has_nan() {
                    return None;
                }
                Some(BuildLeaf {
                    id: ir_id(offset, leaf_type),
                    aabb,
                    centroid: aabb.centroid(),
                    flags: ir_leaf_flags(memory, va, leaf_type),
                })
            })
            .collect();

        let mut emitter = Emitter {
            memory,
            ir: args.ir,
            internal_base: args.leaf_count * leaf_size,
            next_index: 0,
        };

        let root_aabb = match leaves.len() {
            0 => {
                emitter.emit(Aabb::EMPTY, [IR_INVALID; 2], 0, true);
                Aabb::EMPTY
            }
            1 => {
                let leaf = &leaves[0];
                emitter.emit(leaf.aabb, [leaf.id, IR_INVALID], leaf.flags, true);
                leaf.aabb
            }
            _ => {
                let tree = build_tree(&leaves);
                // (node, children visited) stack; each entry resolves to (id, aabb, flags)
                let mut results: Vec<(u32, Aabb, u32)> = Vec::with_capacity(leaves.len());
                let mut stack = vec![(0usize, false)];
                while let Some((node, visited)) = stack.pop() {
                    match tree[node] {
                        TempNode::Leaf(i) => {
                            let leaf = &leaves[i];
                            results.push((leaf.id, leaf.aabb, leaf.flags));
                        }
                        TempNode::Internal { left, right } if !visited => {
                            stack.push((node, true));
                            stack.push((right, false));
                            stack.push((left, false));
                        }
                        TempNode::Internal { .. } => {
                            let (right_id, right_aabb, right_flags) = results.pop().unwrap_or((IR_INVALID, Aabb::EMPTY, 0));
                            let (left_id, left_aabb, left_flags) = results.pop().unwrap_or((IR_INVALID, Aabb::EMPTY, 0));
                            let aabb = left_aabb.union(&right_aabb);
                            let flags = merge_flags(left_flags, right_flags);
                            let id = emitter.emit(aabb, [left_id, right_id], flags, node == 0);
                            results.push((id, aabb, flags));
                        }
                    }
                }
                results.first().map(|r| r.1).unwrap_or(Aabb::EMPTY)
            }
        };

        let mut header = memory.read::<IrHeader>(args.header);
        header.aabb = root_aabb;
        header.ir_internal_node_count = emitter.next_index;
        header.sync_data[0] = IR_PHASE_BUILT;
        memory.write(args.header, &header);

        tracing::trace!(
            active = leaves.len(),
            internal = emitter.next_index,
            "IR tree built"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::format::{GEOMETRY_OPAQUE, GEOMETRY_TYPE_AABBS};
    use crate::config::DeviceConfig;
    use crate::device::{CommandBuffer, DispatchInfo, PipelineKey};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::Arc;

    struct Built {
        device: Arc<Device>,
        ir: u64,
        header: IrHeader,
        layout: IrLayout,
    }

    fn build(boxes: &[Aabb]) -> Built {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let memory = device.memory();
        let leaf_count = boxes.len() as u32;
        let layout = IrLayout::new(leaf_count, GEOMETRY_TYPE_AABBS);
        let scratch = memory.allocate(layout.size).unwrap();
        let ir = scratch.va() + layout.bvh_offset;
        for (i, b) in boxes.iter().enumerate() {
            let node = IrAabbNode {
                base: IrNode { aabb: *b },
                primitive_id: i as u32,
                geometry_id_and_flags: if i % 2 == 0 { GEOMETRY_OPAQUE } else { 0 },
            };
            memory.write(ir + i as u64 * IR_AABB_NODE_SIZE as u64, &node);
        }

        let pipeline = device
            .pipelines()
            .get_or_create(PipelineKey { name: NAME, flags: 0 }, || Arc::new(IrBuildKernel));
        let mut cmd = CommandBuffer::new(device.clone());
        cmd.bind_pipeline(pipeline);
        cmd.push_constants(&IrBuildArgs {
            ir,
            header: scratch.va(),
            leaf_count,
            geometry_type: GEOMETRY_TYPE_AABBS,
        })
        .unwrap();
        cmd.dispatch(DispatchInfo::unaligned(1)).unwrap();
        cmd.submit().unwrap();

        let header = memory.read::<IrHeader>(scratch.va());
        Built {
            device,
            ir,
            header,
            layout,
        }
    }

    impl Built {
        fn node(&self, index: u32) -> IrBoxNode {
            self.device
                .memory()
                .read::<IrBoxNode>(self.ir + self.layout.internal_node_offset(index) as u64)
        }

        fn root(&self) -> IrBoxNode {
            self.node(self.header.ir_internal_node_count - 1)
        }

        /// Collect leaf ids below `id`, checking containment on the way.
        fn collect(&self, id: u32, out: &mut Vec<u32>) {
            if ir_type(id) != IR_NODE_INTERNAL {
                out.push(id);
                return;
            }
            let node = self.device.memory().read::<IrBoxNode>(self.ir + ir_offset(id) as u64);
            for &child in &node.children {
                assert_ne!(child, IR_INVALID);
                let child_aabb = self.device.memory().read::<IrNode>(self.ir + ir_offset(child) as u64).aabb;
                assert!(node.base.aabb.contains(&child_aabb));
                self.collect(child, out);
            }
        }
    }

    #[test]
    fn test_empty_and_single() {
        let built = build(&[Aabb::NAN, Aabb::NAN]);
        assert_eq!(built.header.ir_internal_node_count, 1);
        assert_eq!(built.header.sync_data[0], IR_PHASE_BUILT);
        let root = built.root();
        assert_eq!(root.children, [IR_INVALID; 2]);
        assert!(root.base.aabb.is_empty());
        assert_eq!(root.bvh_offset, 0);

        let b = Aabb::new([1.0; 3], [2.0; 3]);
        let built = build(&[Aabb::NAN, b]);
        let root = built.root();
        assert_eq!(root.children, [ir_id(IR_AABB_NODE_SIZE, IR_NODE_AABB), IR_INVALID]);
        assert_eq!(built.header.aabb, b);
        assert_eq!(flags_cull(root.flags), IR_FLAG_NO_OPAQUE);
    }

    #[test]
    fn test_random_tree_covers_every_active_leaf() {
        let mut rng = StdRng::seed_from_u64(7);
        let boxes: Vec<Aabb> = (0..300)
            .map(|i| {
                if i % 17 == 0 {
                    return Aabb::NAN;
                }
                let min: [f32; 3] = std::array::from_fn(|_| rng.random_range(-50.0..50.0));
                let size: [f32; 3] = std::array::from_fn(|_| rng.random_range(0.0..4.0));
                Aabb::new(min, std::array::from_fn(|k| min[k] + size[k]))
            })
            .collect();
        let active = boxes.iter().filter(|b| !b.has_nan()).count() as u32;

        let built = build(&boxes);
        assert_eq!(built.header.ir_internal_node_count, active - 1);

        let root_index = built.header.ir_internal_node_count - 1;
        let root_id = ir_id(built.layout.internal_node_offset(root_index), IR_NODE_INTERNAL);
        let mut leaves = Vec::new();
        built.collect(root_id, &mut leaves);

        let unique: HashSet<u32> = leaves.iter().copied().collect();
        assert_eq!(unique.len(), active as usize);
        assert_eq!(leaves.len(), active as usize);

        // Only the root knows its output offset up front.
        assert_eq!(built.root().bvh_offset, 0);
        assert_eq!(built.node(0).bvh_offset, IR_OFFSET_UNKNOWN);
        assert!(built.header.aabb.contains(&boxes[1]));
    }

    #[test]
    fn test_coincident_centroids_still_split() {
        let b = Aabb::new([0.0; 3], [1.0; 3]);
        let built = build(&[b; 9]);
        assert_eq!(built.header.ir_internal_node_count, 8);
        let mut leaves = Vec::new();
        let root_id = ir_id(built.layout.internal_node_offset(7), IR_NODE_INTERNAL);
        built.collect(root_id, &mut leaves);
        assert_eq!(leaves.len(), 9);
    }
}
