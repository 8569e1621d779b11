//! Header stage: sizes that depend on how many nodes the encoder allocated.
//!
//! Runs after encoding on compacting builds. Non-compacting builds know
//! every size up front and the host writes them instead.

use super::args::HeaderArgs;
use super::format::*;
use super::gfx12::GFX12_NODE_SIZE;
use super::ir::IrHeader;
use crate::device::{Device, Invocation, Kernel};
use crate::util::div_round_up;

pub const NAME: &str = "header";

/// Bytes moved by one copy workgroup (64 lanes, 16 bytes each).
pub const COPY_BYTES_PER_GROUP: u64 = 1024;

/// Size-dependent header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSizes {
    pub compacted_size: u64,
    pub serialization_size: u64,
    pub copy_dispatch_size: [u32; 3],
    pub size: u64,
}

impl HeaderSizes {
    pub fn new(compacted_size: u64, instance_count: u64) -> Self {
        let serialization_size = compacted_size + serialized_data_offset(instance_count);
        Self {
            compacted_size,
            serialization_size,
            copy_dispatch_size: [div_round_up(compacted_size, COPY_BYTES_PER_GROUP) as u32, 1, 1],
            size: serialization_size - SERIALIZATION_HEADER_SIZE - 8 * instance_count,
        }
    }

    pub fn apply(&self, header: &mut AccelStructHeader) {
        header.compacted_size = self.compacted_size;
        header.serialization_size = self.serialization_size;
        header.copy_dispatch_size = self.copy_dispatch_size;
        header.size = self.size;
    }
}

/// Invocations the 8-wide update needs for a structure whose internal
/// nodes end at `dst_node_offset`.
#[inline]
pub fn gfx12_update_invocations(dst_node_offset: u32, internal_rel: u32) -> u32 {
    (dst_node_offset.saturating_sub(internal_rel) / GFX12_NODE_SIZE + 1) * 8
}

#[derive(Debug)]
pub struct HeaderKernel {
    pub flags: BuildFlags,
}

impl Kernel for HeaderKernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<HeaderArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], _invocation: Invocation) {
        let args: HeaderArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();

        let ir_header = memory.read::<IrHeader>(args.src);
        let compacted_size = args.bvh_offset as u64 + ir_header.dst_node_offset as u64;

        let mut header = memory.read::<AccelStructHeader>(args.dst);
        HeaderSizes::new(compacted_size, args.instance_count as u64).apply(&mut header);
        header.update_dispatch_size = if self.flags.contains(BuildFlags::BVH8) {
            let internal_rel = args.internal_nodes_offset - args.bvh_offset;
            [gfx12_update_invocations(ir_header.dst_node_offset, internal_rel), 1, 1]
        } else {
            [args.leaf_node_count, 1, 1]
        };

        // Only the size fields; the encoder root owns the fields before them.
        let bytes = bytemuck::bytes_of(&header);
        let start = HEADER_COMPACTED_SIZE_OFFSET as usize;
        let end = HEADER_GEOMETRY_TYPE_OFFSET as usize;
        memory.write_bytes(args.dst + start as u64, &bytes[start..end]);

        tracing::trace!(compacted_size, "header sizes written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let sizes = HeaderSizes::new(5000, 0);
        assert_eq!(sizes.serialization_size, 5000 + 128);
        assert_eq!(sizes.copy_dispatch_size, [5, 1, 1]);
        assert_eq!(sizes.size, 5000 + 128 - 56);

        let sizes = HeaderSizes::new(1024, 10);
        // 56 + 80 = 136, aligned to 256
        assert_eq!(sizes.serialization_size, 1024 + 256);
        assert_eq!(sizes.copy_dispatch_size, [1, 1, 1]);
        assert_eq!(sizes.size, 1024 + 256 - 136);
    }

    #[test]
    fn test_update_invocations() {
        // Root only.
        assert_eq!(gfx12_update_invocations(640, 640), 8);
        // Root plus three allocated internal nodes.
        assert_eq!(gfx12_update_invocations(640 + 3 * 128, 640), 32);
    }
}
