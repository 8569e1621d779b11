//! Copies, compaction and serialization round trips.

mod common;

use std::sync::Arc;

use common::*;
use radv_bvh::bvh::format::{SerializationHeader, SERIALIZATION_HEADER_SIZE};
use radv_bvh::prelude::*;

fn serialize(device: &Arc<Device>, built: &Built) -> u64 {
    let header = built.header(device);
    let blob = device.create_buffer(header.serialization_size).unwrap();
    let mut cmd = CommandBuffer::new(device.clone());
    cmd_copy_acceleration_structure_to_memory(&mut cmd, built.accel.va(), blob.va()).unwrap();
    cmd.submit().unwrap();
    blob.va()
}

fn deserialize(device: &Arc<Device>, blob: u64, ty: AccelStructType) -> AccelerationStructure {
    let blob_header = device.memory().host_read::<SerializationHeader>(blob).unwrap();
    let accel = create_acceleration_structure(device, ty, blob_header.compacted_size).unwrap();
    let mut cmd = CommandBuffer::new(device.clone());
    cmd_copy_memory_to_acceleration_structure(&mut cmd, blob, accel.va()).unwrap();
    cmd.submit().unwrap();
    accel
}

fn compacted_bytes(device: &Device, va: u64) -> Vec<u8> {
    let header = read_header(device, va).unwrap();
    device.memory().download(va, header.compacted_size).unwrap()
}

#[test]
fn serialization_round_trip() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let mut rng = rng(12);

        let (_tris, tri_blas) = blas_of_triangles(&device, &mut rng, 1, BuildAccelFlags::empty());
        let boxes = upload(&device, &random_aabbs(&mut rng, 1));
        let aabb_blas = build(
            &device,
            AccelStructType::BottomLevel,
            vec![aabbs(&boxes)],
            &[1],
            BuildAccelFlags::empty(),
        );
        let (_instances, geometry) = instances(&device, tri_blas.accel.va(), 1);
        let tlas = build(&device, AccelStructType::TopLevel, vec![geometry], &[1], BuildAccelFlags::empty());

        for (name, built) in [("triangles", &tri_blas), ("aabbs", &aabb_blas), ("instances", &tlas)] {
            let blob = serialize(&device, built);
            let blob_header = device.memory().host_read::<SerializationHeader>(blob).unwrap();
            assert_eq!(blob_header.driver_uuid, device.config().driver_uuid);
            assert_eq!(blob_header.accel_struct_compat, device.config().cache_uuid);
            assert_eq!(blob_header.instance_count, built.header(&device).instance_count);

            let copy = deserialize(&device, blob, built.accel.ty());
            assert!(
                compacted_bytes(&device, copy.va()) == compacted_bytes(&device, built.accel.va()),
                "{gfx:?} {name}: deserialized structure differs"
            );
        }

        // The instance table records the referenced BLAS.
        let blob = serialize(&device, &tlas);
        let recorded = device.memory().read::<u64>(blob + SERIALIZATION_HEADER_SIZE);
        assert_eq!(recorded, tri_blas.accel.va(), "{gfx:?}");
    }
}

#[test]
fn deserialize_rejects_other_driver() {
    let device = device(GfxLevel::Gfx11);
    let mut rng = rng(4);
    let (_tris, built) = blas_of_triangles(&device, &mut rng, 16, BuildAccelFlags::empty());
    let blob = serialize(&device, &built);

    let mut version = [0u8; 32];
    device.memory().read_bytes(blob, &mut version);
    assert!(device_compatibility(&device, &version));

    version[0] ^= 0xff;
    assert!(!device_compatibility(&device, &version));
    device.memory().write_bytes(blob, &version);

    let dst = create_acceleration_structure(&device, AccelStructType::BottomLevel, built.accel.size()).unwrap();
    let mut cmd = CommandBuffer::new(device.clone());
    let err = cmd_copy_memory_to_acceleration_structure(&mut cmd, blob, dst.va()).unwrap_err();
    assert!(matches!(err, Error::IncompatibleVersion));
}

#[test]
fn compaction_keeps_structure() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let mut rng = rng(6);
        let (_tris, built) = blas_of_triangles(&device, &mut rng, 200, BuildAccelFlags::ALLOW_COMPACTION);
        let header = built.header(&device);
        assert!(header.compacted_size <= built.accel.size());

        let compact = create_acceleration_structure(&device, AccelStructType::BottomLevel, header.compacted_size).unwrap();
        let mut cmd = CommandBuffer::new(device.clone());
        cmd_copy_acceleration_structure(&mut cmd, built.accel.va(), compact.va(), CopyMode::Compact).unwrap();
        cmd.submit().unwrap();

        assert!(compacted_bytes(&device, compact.va()) == compacted_bytes(&device, built.accel.va()), "{gfx:?}");
        let inspector = Inspector::new(device.memory(), compact.va(), built.kernel_flags(&device)).unwrap();
        assert!(inspector.validate().is_empty(), "{gfx:?}");
        assert_eq!(inspector.stats().leaf_nodes, 200);
    }
}

#[test]
fn clone_and_build_in_one_submission() {
    let device = device(GfxLevel::Gfx12);
    let mut rng = rng(10);
    let vertices = upload(&device, &random_triangles(&mut rng, 50));
    let geometry = triangles(&vertices, 50);
    let sizes = get_build_sizes(&device, AccelStructType::BottomLevel, &[geometry], &[50]).unwrap();
    let src = create_acceleration_structure(&device, AccelStructType::BottomLevel, sizes.accel_struct_size).unwrap();
    let dst = create_acceleration_structure(&device, AccelStructType::BottomLevel, sizes.accel_struct_size).unwrap();
    let scratch = device.create_buffer(sizes.build_scratch_size).unwrap();

    let info = BuildGeometryInfo {
        ty: AccelStructType::BottomLevel,
        flags: BuildAccelFlags::empty(),
        mode: BuildMode::Build,
        src: 0,
        dst: src.va(),
        geometries: vec![geometry],
        scratch: scratch.va(),
    };
    let ranges = [BuildRangeInfo {
        primitive_count: 50,
        ..Default::default()
    }];
    let mut cmd = CommandBuffer::new(device.clone());
    cmd_build_acceleration_structures(&mut cmd, &[info], &[&ranges]).unwrap();
    cmd.barrier("build");
    cmd_copy_acceleration_structure(&mut cmd, src.va(), dst.va(), CopyMode::Clone).unwrap();
    cmd.submit().unwrap();

    assert!(compacted_bytes(&device, dst.va()) == compacted_bytes(&device, src.va()));
}
