//! Structural properties of built and refitted structures.

mod common;

use common::*;
use radv_bvh::accel::UpdateScratchLayout;
use radv_bvh::bvh::update::ready_index;
use radv_bvh::bvh::update_gfx12::gfx12_node_index;
use radv_bvh::prelude::*;

const LEAF_COUNTS: [u32; 4] = [1, 2, 7, 1000];

fn leaf_union(inspector: &Inspector<'_>) -> Aabb {
    let mut union = Aabb::EMPTY;
    for leaf in inspector.leaves() {
        if let Some(b) = leaf.bounds {
            union.grow(&b);
        }
    }
    union
}

fn check_root(device: &Device, built: &Built, what: &str) {
    let flags = built.kernel_flags(device);
    let inspector = Inspector::new(device.memory(), built.accel.va(), flags).unwrap();
    let header = inspector.header();

    assert_eq!(header.aabb, leaf_union(&inspector), "{what}: header is not the union of the leaves");
    if inspector.variant() == BvhVariant::Legacy {
        let mut stored = Aabb::EMPTY;
        for child in inspector.children(0) {
            stored.grow(&child.bounds);
        }
        assert_eq!(header.aabb, stored, "{what}: header is not the union of the root's boxes");
    }

    let issues = inspector.validate();
    assert!(issues.is_empty(), "{what}: {issues:?}");
}

#[test]
fn root_propagation() {
    for gfx in ALL_LEVELS {
        for count in LEAF_COUNTS {
            let device = device(gfx);
            let mut rng = rng(count as u64);
            let (vertices, built) = blas_of_triangles(&device, &mut rng, count, BuildAccelFlags::ALLOW_UPDATE);
            check_root(&device, &built, &format!("{gfx:?} build of {count}"));

            let moved = random_triangles(&mut rng, count);
            device.memory().upload(vertices.va(), bytemuck::cast_slice(&moved)).unwrap();
            update(&device, &built, built.accel.va());
            check_root(&device, &built, &format!("{gfx:?} update of {count}"));
        }
    }
}

#[test]
fn containment_of_aabb_structures() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let mut rng = rng(99);
        let boxes = upload(&device, &random_aabbs(&mut rng, 777));
        let built = build(
            &device,
            AccelStructType::BottomLevel,
            vec![aabbs(&boxes)],
            &[777],
            BuildAccelFlags::ALLOW_COMPACTION,
        );
        let inspector = Inspector::new(device.memory(), built.accel.va(), built.kernel_flags(&device)).unwrap();
        let issues = inspector.validate();
        assert!(issues.is_empty(), "{gfx:?}: {issues:?}");

        let stats = inspector.stats();
        assert_eq!(stats.leaf_nodes, 777);
        assert!(stats.max_depth >= 2);
        assert!(stats.compacted_size <= built.sizes.accel_struct_size);
    }
}

#[test]
fn every_internal_node_is_refit_once() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let mut rng = rng(42);
        let (_vertices, built) = blas_of_triangles(&device, &mut rng, 300, BuildAccelFlags::ALLOW_UPDATE);
        let scratch = update(&device, &built, built.accel.va());

        let layout = UpdateScratchLayout::new(device.config(), 1, 300);
        let counter = |index: u32| {
            device
                .memory()
                .read_u32(scratch.va() + layout.internal_ready_count_offset + index as u64 * 4)
        };

        let inspector = Inspector::new(device.memory(), built.accel.va(), built.kernel_flags(&device)).unwrap();
        let header = *inspector.header();
        let internal_rel = header.internal_nodes_offset - header.bvh_offset;

        let mut stack = vec![0u32];
        let mut nodes = 0;
        while let Some(offset) = stack.pop() {
            nodes += 1;
            let children = inspector.children(offset);
            match inspector.variant() {
                // Every child arrives exactly once, so exactly one arrival
                // saw the count one short of complete.
                BvhVariant::Legacy => {
                    assert_eq!(counter(ready_index(offset, internal_rel)), children.len() as u32, "{gfx:?} {offset:#x}");
                }
                BvhVariant::Gfx12 => {
                    assert_eq!(counter(gfx12_node_index(offset, internal_rel)), 1, "{gfx:?} {offset:#x}");
                }
            }
            stack.extend(children.iter().filter(|c| c.is_internal()).map(|c| c.offset()));
        }
        assert!(nodes > 1);
    }
}

#[test]
fn empty_structure_has_no_children() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let vertices = upload(&device, &[]);
        let built = build(
            &device,
            AccelStructType::BottomLevel,
            vec![triangles(&vertices, 0)],
            &[0],
            BuildAccelFlags::ALLOW_UPDATE,
        );
        let inspector = Inspector::new(device.memory(), built.accel.va(), built.kernel_flags(&device)).unwrap();
        assert!(inspector.children(0).is_empty(), "{gfx:?}");
        assert!(inspector.validate().is_empty(), "{gfx:?}");
        assert_eq!(inspector.stats().leaf_nodes, 0);

        // Refitting nothing leaves nothing.
        update(&device, &built, built.accel.va());
        assert!(inspector.children(0).is_empty(), "{gfx:?}");
    }
}

#[test]
fn null_structure_decodes_as_empty() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let null = init_null_accel_struct(&device).unwrap();
        let flags = radv_bvh::accel::device_build_flags(device.config());
        let inspector = Inspector::new(device.memory(), null.va(), flags).unwrap();
        assert!(inspector.children(0).is_empty(), "{gfx:?}");
    }
}

#[test]
fn instance_structure_bounds_follow_transforms() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let mut rng = rng(8);
        let (_vertices, blas) = blas_of_triangles(&device, &mut rng, 64, BuildAccelFlags::empty());
        let blas_bounds = blas.header(&device).aabb;

        let (_instances, geometry) = instances(&device, blas.accel.va(), 5);
        let tlas = build(&device, AccelStructType::TopLevel, vec![geometry], &[5], BuildAccelFlags::empty());
        let header = tlas.header(&device);
        assert_eq!(header.instance_count, 5);

        // Instance i is translated by 10 * i along x.
        let inspector = Inspector::new(device.memory(), tlas.accel.va(), tlas.kernel_flags(&device)).unwrap();
        assert!(inspector.validate().is_empty(), "{gfx:?}");
        assert_eq!(inspector.leaves().len(), 5);
        assert!(header.aabb.min[0] <= blas_bounds.min[0]);
        assert!(header.aabb.max[0] >= blas_bounds.max[0] + 40.0);
    }
}
