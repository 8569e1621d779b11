//! Copy, serialize and deserialize.
//!
//! The copy kernel moves a structure in 16-byte blocks with a grid-stride
//! loop. Serialized blobs store the structure after a header and a table of
//! BLAS addresses, one per instance; instance nodes reference their BLAS
//! through a node pointer that only makes sense at one address, so
//! serialization records the BLAS base addresses and deserialization
//! rebuilds the pointers from them.
//!
//! Legacy instance nodes sit at a fixed stride from `instance_offset` and
//! are patched by the copy kernel itself. 8-wide structures place instance
//! leaves wherever the encoder allocated them, so a second pass walks the
//! leaf node offset table instead.

use super::args::{CopyArgs, COPY_MODE_COPY, COPY_MODE_DESERIALIZE, COPY_MODE_SERIALIZE};
use super::format::*;
use super::gfx12::{Gfx12InstanceNode, Gfx12InstanceUserData, GFX12_NODE_SIZE};
use crate::device::{Device, DeviceMemory, Invocation, Kernel};

pub const NAME: &str = "copy";
pub const BLAS_ADDRS_NAME: &str = "copy_blas_addrs_gfx12";

/// Bytes per copy block.
pub const COPY_BLOCK_SIZE: u64 = 16;
/// Workgroups used when deserializing (the size is only known on the device).
pub const DESERIALIZE_GROUPS: u32 = 512;
/// Workgroups of the BLAS address pass.
pub const BLAS_ADDRS_GROUPS: u32 = 256;

/// Address of instance `index` in a serialized blob's BLAS table.
#[inline]
pub fn serialized_instance_va(blob: u64, index: u64) -> u64 {
    blob + SERIALIZATION_HEADER_SIZE + 8 * index
}

/// BLAS base address referenced by an instance node pointer.
#[inline]
pub fn blas_address(bvh_ptr: u64, blas_bvh_offset: u32) -> u64 {
    node_to_addr(bvh_ptr).wrapping_sub(blas_bvh_offset as u64)
}

/// Instance node pointer for a BLAS at `blas`, keeping the flag bits of
/// `old_ptr`.
#[inline]
pub fn relocated_ptr(blas: u64, blas_bvh_offset: u32, old_ptr: u64) -> u64 {
    addr_to_node(blas.wrapping_add(blas_bvh_offset as u64)) | (old_ptr & !NODE_PTR_MASK)
}

/// Source/destination of the structure bytes and the instance info.
struct CopyPlan {
    src: u64,
    dst: u64,
    size: u64,
    instance_offset: u64,
    instance_count: u64,
}

impl CopyPlan {
    fn new(memory: &DeviceMemory, args: &CopyArgs) -> Self {
        match args.mode {
            COPY_MODE_DESERIALIZE => {
                let ser = memory.read::<SerializationHeader>(args.src_addr);
                let src = args.src_addr + serialized_data_offset(ser.instance_count);
                let header = memory.read::<AccelStructHeader>(src);
                Self {
                    src,
                    dst: args.dst_addr,
                    size: ser.compacted_size,
                    instance_offset: header.instance_offset,
                    instance_count: ser.instance_count,
                }
            }
            mode => {
                let header = memory.read::<AccelStructHeader>(args.src_addr);
                let dst = if mode == COPY_MODE_SERIALIZE {
                    args.dst_addr + serialized_data_offset(header.instance_count)
                } else {
                    args.dst_addr
                };
                Self {
                    src: args.src_addr,
                    dst,
                    size: header.compacted_size,
                    instance_offset: header.instance_offset,
                    instance_count: header.instance_count,
                }
            }
        }
    }

    /// Instance index of the node starting at `offset`, if any.
    fn instance_at(&self, offset: u64) -> Option<u64> {
        if offset < self.instance_offset {
            return None;
        }
        let rel = offset - self.instance_offset;
        let index = rel / INSTANCE_NODE_SIZE as u64;
        (rel % INSTANCE_NODE_SIZE as u64 == 0 && index < self.instance_count).then_some(index)
    }
}

#[derive(Debug)]
pub struct CopyKernel {
    pub flags: BuildFlags,
}

impl Kernel for CopyKernel {
    fn name(&self) -> &'static str {
        NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<CopyArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: CopyArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();
        let plan = CopyPlan::new(memory, &args);

        if args.mode == COPY_MODE_SERIALIZE && invocation.global_id == 0 {
            let header = memory.read::<AccelStructHeader>(args.src_addr);
            let sizes = [header.serialization_size, header.compacted_size, header.instance_count];
            memory.write(args.dst_addr + 32, &sizes);
        }

        let patch_instances = args.mode != COPY_MODE_COPY && !self.flags.contains(BuildFlags::BVH8);
        let blocks = plan.size.div_ceil(COPY_BLOCK_SIZE);
        let mut block = invocation.global_id as u64;
        while block < blocks {
            let offset = block * COPY_BLOCK_SIZE;
            let len = COPY_BLOCK_SIZE.min(plan.size - offset);
            memory.copy(plan.src + offset, plan.dst + offset, len);

            if patch_instances {
                if let Some(index) = plan.instance_at(offset) {
                    let node = memory.read::<InstanceNode>(plan.src + offset);
                    if args.mode == COPY_MODE_SERIALIZE {
                        memory.write(
                            serialized_instance_va(args.dst_addr, index),
                            &blas_address(node.bvh_ptr, node.bvh_offset),
                        );
                    } else {
                        let blas = memory.read::<u64>(serialized_instance_va(args.src_addr, index));
                        memory.write(plan.dst + offset, &relocated_ptr(blas, node.bvh_offset, node.bvh_ptr));
                    }
                }
            }
            block += invocation.count as u64;
        }
    }
}

/// Second pass over 8-wide instance leaves for serialize and deserialize.
#[derive(Debug, Default)]
pub struct CopyBlasAddrsKernel;

impl Kernel for CopyBlasAddrsKernel {
    fn name(&self) -> &'static str {
        BLAS_ADDRS_NAME
    }

    fn push_constant_size(&self) -> usize {
        std::mem::size_of::<CopyArgs>()
    }

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation) {
        let args: CopyArgs = bytemuck::pod_read_unaligned(push);
        let memory = device.memory();

        // The structure whose leaf table is walked: the source when
        // serializing, the freshly copied destination when deserializing.
        let (structure, blob) = match args.mode {
            COPY_MODE_SERIALIZE => (args.src_addr, args.dst_addr),
            COPY_MODE_DESERIALIZE => (args.dst_addr, args.src_addr),
            _ => return,
        };
        let header = memory.read::<AccelStructHeader>(structure);
        if header.geometry_type != GEOMETRY_TYPE_INSTANCES {
            return;
        }
        let body = structure + header.bvh_offset as u64;

        let mut index = invocation.global_id as u64;
        while index < header.instance_count {
            let leaf_offset = memory.read_u32(structure + header.leaf_node_offsets_offset as u64 + index * 4);
            let table_va = serialized_instance_va(blob, index);

            if leaf_offset == INVALID_NODE {
                if args.mode == COPY_MODE_SERIALIZE {
                    memory.write(table_va, &0u64);
                }
            } else {
                let node_va = body + leaf_offset as u64;
                let node = memory.read::<Gfx12InstanceNode>(node_va);
                let user = memory.read::<Gfx12InstanceUserData>(node_va + GFX12_NODE_SIZE as u64);
                if args.mode == COPY_MODE_SERIALIZE {
                    memory.write(table_va, &blas_address(node.pointer_flags_bvh_addr, user.bvh_offset));
                } else {
                    let blas = memory.read::<u64>(table_va);
                    let ptr = relocated_ptr(blas, user.bvh_offset, node.pointer_flags_bvh_addr);
                    memory.write(node_va + std::mem::offset_of!(Gfx12InstanceNode, pointer_flags_bvh_addr) as u64, &ptr);
                }
            }
            index += invocation.count as u64;
        }
    }
}
