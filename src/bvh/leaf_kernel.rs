//! Leaf stage of a build: one invocation per primitive of one geometry.
//!
//! Each invocation writes the IR leaf at its global primitive index and
//! counts itself in the IR header when active. Inactive primitives still
//! get a leaf (with a NaN box) so leaf slots stay addressable by index.

use super::args::LeafArgs;
use super::ir::{ir_leaf_size, IR_HEADER_ACTIVE_LEAF_COUNT};
use super::leaf::{fetch_leaf, write_ir_leaf};
use crate::device::{Device, Invocation, Kernel};

pub const NAME: &str = "leaf";

#[derive(Debug, Default)]
pub struct LeafKernel;

impl Kernel for LeafKernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<LeafArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: LeafArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();
        let geom = &args.geom_data;

        let index = geom.first_id + invocation.global_id;
        let dst = args.ir + index as u64 * ir_leaf_size(geom.geometry_type) as u64;

        let leaf = fetch_leaf(memory, geom, invocation.global_id);
        write_ir_leaf(memory, dst, geom.geometry_type, leaf.as_ref());
        if leaf.is_some() {
            memory.atomic_add_u32(args.header + IR_HEADER_ACTIVE_LEAF_COUNT as u64, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::format::*;
    use crate::bvh::ir::{IrAabbNode, IrHeader, IrLayout};
    use crate::config::DeviceConfig;
    use crate::device::{CommandBuffer, DispatchInfo, PipelineKey};
    use crate::util::Aabb;
    use bytemuck::Zeroable;
    use std::sync::Arc;

    #[test]
    fn test_leaves_land_at_global_index() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let memory = device.memory();

        let boxes = [
            Aabb::new([0.0; 3], [1.0; 3]),
            Aabb::NAN,
            Aabb::new([2.0; 3], [3.0; 3]),
        ];
        let data = memory.allocate(72).unwrap();
        memory.upload(data.va(), bytemuck::cast_slice(&boxes)).unwrap();

        let layout = IrLayout::new(5, GEOMETRY_TYPE_AABBS);
        let scratch = memory.allocate(layout.size).unwrap();

        let args = LeafArgs {
            ir: scratch.va() + layout.bvh_offset,
            header: scratch.va(),
            geom_data: GeometryData {
                data: data.va(),
                stride: 24,
                geometry_type: GEOMETRY_TYPE_AABBS,
                geometry_id: 1,
                first_id: 2,
                ..Default::default()
            },
        };

        let pipeline = device
            .pipelines()
            .get_or_create(PipelineKey { name: NAME, flags: 0 }, || Arc::new(LeafKernel));
        let mut cmd = CommandBuffer::new(device.clone());
        cmd.bind_pipeline(pipeline);
        cmd.push_constants(&args).unwrap();
        cmd.dispatch(DispatchInfo::unaligned(3)).unwrap();
        cmd.submit().unwrap();

        let header = memory.read::<IrHeader>(scratch.va());
        assert_eq!(header.active_leaf_count, 2);

        let leaf = |i: u64| memory.read::<IrAabbNode>(args.ir + i * 32);
        assert_eq!(leaf(2).primitive_id, 0);
        assert_eq!(leaf(2).geometry_id_and_flags, 1);
        assert!(leaf(3).base.aabb.has_nan());
        assert_eq!(leaf(4).base.aabb, boxes[2]);
        assert_eq!(leaf(4).primitive_id, 2);
        // Slots of other geometries are untouched.
        assert_eq!(leaf(0), IrAabbNode::zeroed());
    }
}
