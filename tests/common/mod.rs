//! Shared scene and build helpers for integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use radv_bvh::accel::encode_flags;
use radv_bvh::bvh::format::InstanceInput;
use radv_bvh::device::Buffer;
use radv_bvh::prelude::*;
use radv_bvh::util::MAT3X4_IDENTITY;

pub const ALL_LEVELS: [GfxLevel; 3] = [GfxLevel::Gfx10_3, GfxLevel::Gfx11, GfxLevel::Gfx12];

pub fn device(gfx: GfxLevel) -> Arc<Device> {
    Device::new(DeviceConfig::for_gfx(gfx)).unwrap()
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `count` small random triangles as packed float3 vertices.
pub fn random_triangles(rng: &mut StdRng, count: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity(count as usize * 9);
    for _ in 0..count {
        let c: [f32; 3] = std::array::from_fn(|_| rng.random_range(-100.0..100.0));
        for _ in 0..3 {
            out.extend((0..3).map(|a| c[a] + rng.random_range(-2.0..2.0f32)));
        }
    }
    out
}

/// `count` random boxes as `min.xyz, max.xyz`.
pub fn random_aabbs(rng: &mut StdRng, count: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity(count as usize * 6);
    for _ in 0..count {
        let c: [f32; 3] = std::array::from_fn(|_| rng.random_range(-100.0..100.0));
        let h: [f32; 3] = std::array::from_fn(|_| rng.random_range(0.1..3.0f32));
        out.extend((0..3).map(|a| c[a] - h[a]));
        out.extend((0..3).map(|a| c[a] + h[a]));
    }
    out
}

pub fn upload(device: &Device, data: &[f32]) -> Arc<Buffer> {
    let buffer = device.create_buffer((data.len() as u64 * 4).max(16)).unwrap();
    device.memory().upload(buffer.va(), bytemuck::cast_slice(data)).unwrap();
    buffer
}

pub fn triangles(buffer: &Buffer, count: u32) -> Geometry {
    Geometry {
        kind: GeometryKind::Triangles(TrianglesData {
            vertex_format: VertexFormat::R32G32B32Sfloat,
            vertex_data: buffer.va(),
            vertex_stride: 12,
            max_vertex: (count * 3).saturating_sub(1),
            index_type: IndexType::None,
            index_data: 0,
            transform_data: 0,
        }),
        flags: GeometryFlags::OPAQUE,
    }
}

pub fn aabbs(buffer: &Buffer) -> Geometry {
    Geometry {
        kind: GeometryKind::Aabbs(AabbsData {
            data: buffer.va(),
            stride: 24,
        }),
        flags: GeometryFlags::empty(),
    }
}

/// Instances of `blas` spread along x.
pub fn instances(device: &Device, blas: u64, count: u32) -> (Arc<Buffer>, Geometry) {
    let data: Vec<InstanceInput> = (0..count)
        .map(|i| {
            let mut transform = MAT3X4_IDENTITY;
            transform[3] = i as f32 * 10.0;
            InstanceInput {
                transform,
                custom_instance_and_mask: i | (0xff << 24),
                sbt_offset_and_flags: 0,
                acceleration_structure_reference: blas,
            }
        })
        .collect();
    let buffer = device
        .create_buffer((data.len() * std::mem::size_of::<InstanceInput>()).max(16) as u64)
        .unwrap();
    device.memory().upload(buffer.va(), bytemuck::cast_slice(&data)).unwrap();
    let geometry = Geometry {
        kind: GeometryKind::Instances(InstancesData {
            array_of_pointers: false,
            data: buffer.va(),
        }),
        flags: GeometryFlags::empty(),
    };
    (buffer, geometry)
}

fn ranges(counts: &[u32]) -> Vec<BuildRangeInfo> {
    counts
        .iter()
        .map(|&primitive_count| BuildRangeInfo {
            primitive_count,
            ..Default::default()
        })
        .collect()
}

/// A built structure with the scratch and sizes it was built with.
pub struct Built {
    pub accel: AccelerationStructure,
    pub sizes: BuildSizes,
    pub geometries: Vec<Geometry>,
    pub counts: Vec<u32>,
    pub flags: BuildAccelFlags,
}

impl Built {
    pub fn kernel_flags(&self, device: &Device) -> BuildFlags {
        encode_flags(device.config(), self.flags)
    }

    pub fn bytes(&self, device: &Device) -> Vec<u8> {
        device.memory().download(self.accel.va(), self.accel.size()).unwrap()
    }

    pub fn header(&self, device: &Device) -> AccelStructHeader {
        read_header(device, self.accel.va()).unwrap()
    }
}

pub fn build(
    device: &Arc<Device>,
    ty: AccelStructType,
    geometries: Vec<Geometry>,
    counts: &[u32],
    flags: BuildAccelFlags,
) -> Built {
    let sizes = get_build_sizes(device, ty, &geometries, counts).unwrap();
    let accel = create_acceleration_structure(device, ty, sizes.accel_struct_size).unwrap();
    let scratch = device.create_buffer(sizes.build_scratch_size).unwrap();

    let info = BuildGeometryInfo {
        ty,
        flags,
        mode: BuildMode::Build,
        src: 0,
        dst: accel.va(),
        geometries: geometries.clone(),
        scratch: scratch.va(),
    };
    let ranges = ranges(counts);
    let mut cmd = CommandBuffer::new(device.clone());
    cmd_build_acceleration_structures(&mut cmd, &[info], &[&ranges]).unwrap();
    cmd.submit().unwrap();
    device.destroy_buffer(scratch.va()).unwrap();

    Built {
        accel,
        sizes,
        geometries,
        counts: counts.to_vec(),
        flags,
    }
}

/// Refit `src` into `dst`, returning the update scratch buffer for
/// inspection.
pub fn update(device: &Arc<Device>, built: &Built, dst: u64) -> Arc<Buffer> {
    let scratch = device.create_buffer(built.sizes.update_scratch_size).unwrap();
    let info = BuildGeometryInfo {
        ty: built.accel.ty(),
        flags: built.flags,
        mode: BuildMode::Update,
        src: built.accel.va(),
        dst,
        geometries: built.geometries.clone(),
        scratch: scratch.va(),
    };
    let ranges = ranges(&built.counts);
    let mut cmd = CommandBuffer::new(device.clone());
    cmd_build_acceleration_structures(&mut cmd, &[info], &[&ranges]).unwrap();
    cmd.submit().unwrap();
    scratch
}

pub fn blas_of_triangles(device: &Arc<Device>, rng: &mut StdRng, count: u32, flags: BuildAccelFlags) -> (Arc<Buffer>, Built) {
    let buffer = upload(device, &random_triangles(rng, count));
    let built = build(device, AccelStructType::BottomLevel, vec![triangles(&buffer, count)], &[count], flags);
    (buffer, built)
}
