//! Flat, grid-aligned and very large geometry survives build and refit.

mod common;

use std::sync::Arc;

use common::*;
use radv_bvh::prelude::*;

/// Two triangles per axis-aligned 4x4 quad, floors at y = 0..=4 and
/// walls at x = 0..=4.
fn grid_quads() -> Vec<f32> {
    let mut out = Vec::new();
    for k in 0..=4 {
        let k = k as f32;
        let floor = [[0.0, k, 0.0], [4.0, k, 0.0], [4.0, k, 4.0], [0.0, k, 4.0]];
        let wall = [[k, 0.0, 0.0], [k, 4.0, 0.0], [k, 4.0, 4.0], [k, 0.0, 4.0]];
        for q in [floor, wall] {
            for v in [q[0], q[1], q[2], q[0], q[2], q[3]] {
                out.extend(v);
            }
        }
    }
    out
}

/// Triangles scattered over +-1e30.
fn huge_triangles(count: u32) -> Vec<f32> {
    random_triangles(&mut rng(30), count).iter().map(|v| v * 1e28).collect()
}

fn shifted(vertices: &[f32], by: f32) -> Vec<f32> {
    vertices.iter().map(|v| v + by).collect()
}

/// Every leaf holds the uploaded triangle it names, and every slot over a
/// live subtree decodes to a box that contains it.
fn check_against_source(device: &Device, built: &Built, vertices: &[f32], what: &str) {
    let inspector = Inspector::new(device.memory(), built.accel.va(), built.kernel_flags(device)).unwrap();
    let issues = inspector.validate();
    assert!(issues.is_empty(), "{what}: {issues:?}");

    let leaves = inspector.leaves();
    assert_eq!(leaves.len() * 9, vertices.len(), "{what}");
    for leaf in &leaves {
        let base = leaf.primitive_id as usize * 9;
        let expected: [[f32; 3]; 3] = std::array::from_fn(|v| std::array::from_fn(|a| vertices[base + v * 3 + a]));
        assert_eq!(leaf.vertices, Some(expected), "{what}: primitive {}", leaf.primitive_id);

        let mut bounds = Aabb::EMPTY;
        expected.iter().for_each(|v| bounds.grow_point(*v));
        assert_eq!(leaf.bounds, Some(bounds), "{what}: primitive {}", leaf.primitive_id);
    }

    let mut stack = vec![0u32];
    while let Some(offset) = stack.pop() {
        for child in inspector.children(offset) {
            assert!(!child.inactive, "{what}: slot {:#x} of {offset:#x}", child.offset());
            assert!(!child.bounds.is_empty(), "{what}: slot {:#x} of {offset:#x}", child.offset());
            if child.is_internal() {
                stack.push(child.offset());
            }
        }
    }

    let header = built.header(device);
    assert!(!header.aabb.has_nan(), "{what}");
    assert!(header.aabb.min.iter().chain(&header.aabb.max).all(|v| v.is_finite()), "{what}");
}

fn build_and_refit(device: &Arc<Device>, vertices: Vec<f32>, moved: Vec<f32>, what: &str) {
    let count = (vertices.len() / 9) as u32;
    let buffer = upload(device, &vertices);
    let built = build(
        device,
        AccelStructType::BottomLevel,
        vec![triangles(&buffer, count)],
        &[count],
        BuildAccelFlags::ALLOW_UPDATE,
    );
    check_against_source(device, &built, &vertices, &format!("{what} build"));

    let before = built.bytes(device);
    update(device, &built, built.accel.va());
    assert!(built.bytes(device) == before, "{what}: refit without motion differs from the build");

    device.memory().upload(buffer.va(), bytemuck::cast_slice(&moved)).unwrap();
    update(device, &built, built.accel.va());
    check_against_source(device, &built, &moved, &format!("{what} refit"));
}

#[test]
fn flat_quads_on_grid_lines() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let quads = grid_quads();
        let moved = shifted(&quads, 2.0);
        build_and_refit(&device, quads, moved, &format!("{gfx:?} quads"));
    }
}

#[test]
fn very_large_coordinates() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let vertices = huge_triangles(300);
        let moved: Vec<f32> = vertices.iter().map(|v| v * 0.5).collect();
        build_and_refit(&device, vertices, moved, &format!("{gfx:?} huge"));
    }
}

#[test]
fn leaves_match_uploaded_geometry() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        let vertices = random_triangles(&mut rng(17), 500);
        let moved = random_triangles(&mut rng(18), 500);
        build_and_refit(&device, vertices, moved, &format!("{gfx:?} random"));
    }
}

#[test]
fn flat_aabbs_on_grid_lines() {
    for gfx in ALL_LEVELS {
        let device = device(gfx);
        // Slabs at y = 0..=4 plus a point box on interior grid lines.
        let mut boxes = Vec::new();
        for k in 0..=4 {
            let k = k as f32;
            boxes.extend([0.0, k, 0.0, 4.0, k, 4.0]);
        }
        boxes.extend([1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        let buffer = upload(&device, &boxes);
        let built = build(
            &device,
            AccelStructType::BottomLevel,
            vec![aabbs(&buffer)],
            &[6],
            BuildAccelFlags::empty(),
        );

        let inspector = Inspector::new(device.memory(), built.accel.va(), built.kernel_flags(&device)).unwrap();
        let issues = inspector.validate();
        assert!(issues.is_empty(), "{gfx:?}: {issues:?}");

        let leaves = inspector.leaves();
        assert_eq!(leaves.len(), 6, "{gfx:?}");
        for leaf in leaves {
            let b = &boxes[leaf.primitive_id as usize * 6..][..6];
            let expected = Aabb::new([b[0], b[1], b[2]], [b[3], b[4], b[5]]);
            assert_eq!(leaf.bounds, Some(expected), "{gfx:?}: primitive {}", leaf.primitive_id);
        }
        for child in inspector.children(0) {
            assert!(!child.bounds.is_empty(), "{gfx:?}: slot {:#x}", child.offset());
        }
    }
}
