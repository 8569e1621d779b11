//! Leaf construction.
//!
//! A primitive is first fetched into a [`LeafPrimitive`], which decides
//! whether it is active, then written out as an IR leaf (build) or as a
//! hardware leaf in either node format (encode and update). Encode and
//! update go through the same writers, which is what makes a refit with
//! unchanged geometry reproduce the built leaves bit for bit.

use bytemuck::Zeroable;

use super::format::*;
use super::geometry::{fetch_aabb, fetch_instance, fetch_triangle};
use super::gfx12::{BoxChild, Gfx12InstanceNode, Gfx12InstanceUserData, Gfx12PrimitiveNode, GFX12_NODE_SIZE};
use super::gfx12::pack_exponents;
use super::ir::*;
use super::quantize::{compute_frame, quantize};
use crate::device::DeviceMemory;
use crate::util::{affine_from_mat3x4, mat3x4_from_affine, transform_aabb, Aabb, Mat3x4};

/// Value of the legacy triangle node `id` field.
pub const TRIANGLE_NODE_ID: u32 = 9;

/// Instance data needed to emit an instance leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceLeaf {
    /// BLAS base address
    pub blas: u64,
    pub blas_bvh_offset: u32,
    pub blas_aabb: Aabb,
    pub otw_matrix: Mat3x4,
    pub custom_instance_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub instance_id: u32,
}

impl InstanceLeaf {
    /// Node pointer to the BLAS root with the instance flags attached.
    pub fn bvh_ptr(&self) -> u64 {
        let flags = ((self.sbt_offset_and_flags >> 24) & 0xf) as u64;
        addr_to_node(self.blas + self.blas_bvh_offset as u64) | (flags << INSTANCE_PTR_FLAGS_SHIFT)
    }

    pub fn wto_matrix(&self) -> Mat3x4 {
        mat3x4_from_affine(&affine_from_mat3x4(&self.otw_matrix).inverse())
    }
}

/// An active primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeafPrimitive {
    Triangle {
        coords: [[f32; 3]; 3],
        triangle_id: u32,
        geometry_id_and_flags: u32,
    },
    Aabb {
        bounds: Aabb,
        primitive_id: u32,
        geometry_id_and_flags: u32,
    },
    Instance(InstanceLeaf),
}

impl LeafPrimitive {
    pub fn bounds(&self) -> Aabb {
        match self {
            Self::Triangle { coords, .. } => {
                let mut b = Aabb::EMPTY;
                coords.iter().for_each(|v| b.grow_point(*v));
                b
            }
            Self::Aabb { bounds, .. } => *bounds,
            Self::Instance(inst) => transform_aabb(&inst.otw_matrix, &inst.blas_aabb),
        }
    }

    /// IR cull flags and instance mask.
    pub fn flags(&self) -> u32 {
        match self {
            Self::Triangle { geometry_id_and_flags, .. } | Self::Aabb { geometry_id_and_flags, .. } => {
                geometry_leaf_flags(*geometry_id_and_flags)
            }
            Self::Instance(inst) => instance_leaf_flags(inst.custom_instance_and_mask, inst.sbt_offset_and_flags),
        }
    }

    pub fn geometry_type(&self) -> u32 {
        match self {
            Self::Triangle { .. } => GEOMETRY_TYPE_TRIANGLES,
            Self::Aabb { .. } => GEOMETRY_TYPE_AABBS,
            Self::Instance(_) => GEOMETRY_TYPE_INSTANCES,
        }
    }
}

/// Read the BLAS a reference points at. `None` for null, unmapped or
/// empty structures.
fn resolve_blas(memory: &DeviceMemory, reference: u64) -> Option<(u32, Aabb)> {
    if reference == 0 {
        return None;
    }
    let header = memory.try_read::<AccelStructHeader>(reference)?;
    if header.aabb.is_empty() || header.aabb.has_nan() {
        return None;
    }
    Some((header.bvh_offset, header.aabb))
}

fn instance_leaf(memory: &DeviceMemory, input: &InstanceInput, index: u32) -> Option<InstanceLeaf> {
    let (blas_bvh_offset, blas_aabb) = resolve_blas(memory, input.acceleration_structure_reference)?;
    Some(InstanceLeaf {
        blas: input.acceleration_structure_reference,
        blas_bvh_offset,
        blas_aabb,
        otw_matrix: input.transform,
        custom_instance_and_mask: input.custom_instance_and_mask,
        sbt_offset_and_flags: input.sbt_offset_and_flags,
        instance_id: index,
    })
}

/// Fetch primitive `index` of a geometry. Returns `None` if the primitive
/// is inactive.
pub fn fetch_leaf(memory: &DeviceMemory, geom: &GeometryData, index: u32) -> Option<LeafPrimitive> {
    match geom.geometry_type {
        GEOMETRY_TYPE_TRIANGLES => {
            let coords = fetch_triangle(memory, geom, index)?;
            if coords.iter().flatten().any(|c| !c.is_finite()) {
                return None;
            }
            Some(LeafPrimitive::Triangle {
                coords,
                triangle_id: index,
                geometry_id_and_flags: geom.geometry_id,
            })
        }
        GEOMETRY_TYPE_AABBS => {
            let bounds = fetch_aabb(memory, geom, index)?;
            if bounds.has_nan() || bounds.is_empty() {
                return None;
            }
            Some(LeafPrimitive::Aabb {
                bounds,
                primitive_id: index,
                geometry_id_and_flags: geom.geometry_id,
            })
        }
        GEOMETRY_TYPE_INSTANCES => {
            let input = fetch_instance(memory, geom, index)?;
            instance_leaf(memory, &input, index).map(LeafPrimitive::Instance)
        }
        _ => None,
    }
}

// ============================================================================
// IR leaves
// ============================================================================

/// Write the IR leaf for a primitive. Inactive primitives get a NaN box.
pub fn write_ir_leaf(memory: &DeviceMemory, va: u64, geometry_type: u32, leaf: Option<&LeafPrimitive>) {
    let Some(leaf) = leaf else {
        let base = IrNode { aabb: Aabb::NAN };
        match geometry_type {
            GEOMETRY_TYPE_AABBS => memory.write(va, &IrAabbNode { base, ..Zeroable::zeroed() }),
            GEOMETRY_TYPE_INSTANCES => memory.write(va, &IrInstanceNode { base, ..Zeroable::zeroed() }),
            _ => memory.write(va, &IrTriangleNode { base, ..Zeroable::zeroed() }),
        }
        return;
    };

    let base = IrNode { aabb: leaf.bounds() };
    match leaf {
        LeafPrimitive::Triangle {
            coords,
            triangle_id,
            geometry_id_and_flags,
        } => memory.write(
            va,
            &IrTriangleNode {
                base,
                coords: *coords,
                triangle_id: *triangle_id,
                id: 0,
                geometry_id_and_flags: *geometry_id_and_flags,
            },
        ),
        LeafPrimitive::Aabb {
            primitive_id,
            geometry_id_and_flags,
            ..
        } => memory.write(
            va,
            &IrAabbNode {
                base,
                primitive_id: *primitive_id,
                geometry_id_and_flags: *geometry_id_and_flags,
            },
        ),
        LeafPrimitive::Instance(inst) => memory.write(
            va,
            &IrInstanceNode {
                base,
                base_ptr: inst.blas,
                custom_instance_and_mask: inst.custom_instance_and_mask,
                sbt_offset_and_flags: inst.sbt_offset_and_flags,
                instance_id: inst.instance_id,
                otw_matrix: inst.otw_matrix,
                reserved: 0,
            },
        ),
    }
}

/// Read an IR leaf back. Inactive leaves (NaN box) yield `None`.
pub fn read_ir_leaf(memory: &DeviceMemory, va: u64, ir_type: u32) -> Option<LeafPrimitive> {
    match ir_type {
        IR_NODE_TRIANGLE => {
            let node = memory.read::<IrTriangleNode>(va);
            (!node.base.aabb.has_nan()).then_some(LeafPrimitive::Triangle {
                coords: node.coords,
                triangle_id: node.triangle_id,
                geometry_id_and_flags: node.geometry_id_and_flags,
            })
        }
        IR_NODE_AABB => {
            let node = memory.read::<IrAabbNode>(va);
            (!node.base.aabb.has_nan()).then_some(LeafPrimitive::Aabb {
                bounds: node.base.aabb,
                primitive_id: node.primitive_id,
                geometry_id_and_flags: node.geometry_id_and_flags,
            })
        }
        IR_NODE_INSTANCE => {
            let node = memory.read::<IrInstanceNode>(va);
            if node.base.aabb.has_nan() {
                return None;
            }
            let (blas_bvh_offset, blas_aabb) = resolve_blas(memory, node.base_ptr)?;
            Some(LeafPrimitive::Instance(InstanceLeaf {
                blas: node.base_ptr,
                blas_bvh_offset,
                blas_aabb,
                otw_matrix: node.otw_matrix,
                custom_instance_and_mask: node.custom_instance_and_mask,
                sbt_offset_and_flags: node.sbt_offset_and_flags,
                instance_id: node.instance_id,
            }))
        }
        _ => None,
    }
}

/// Cull flags and mask of an IR leaf, read from its raw fields.
pub fn ir_leaf_flags(memory: &DeviceMemory, va: u64, ir_type: u32) -> u32 {
    match ir_type {
        IR_NODE_TRIANGLE => geometry_leaf_flags(memory.read::<IrTriangleNode>(va).geometry_id_and_flags),
        IR_NODE_AABB => geometry_leaf_flags(memory.read::<IrAabbNode>(va).geometry_id_and_flags),
        _ => {
            let node = memory.read::<IrInstanceNode>(va);
            instance_leaf_flags(node.custom_instance_and_mask, node.sbt_offset_and_flags)
        }
    }
}

// ============================================================================
// Hardware leaves
// ============================================================================

/// Write a legacy leaf node.
pub fn write_legacy_leaf(memory: &DeviceMemory, va: u64, leaf: &LeafPrimitive) {
    match leaf {
        LeafPrimitive::Triangle {
            coords,
            triangle_id,
            geometry_id_and_flags,
        } => memory.write(
            va,
            &TriangleNode {
                coords: *coords,
                reserved: [0; 3],
                triangle_id: *triangle_id,
                geometry_id_and_flags: *geometry_id_and_flags,
                reserved2: 0,
                id: TRIANGLE_NODE_ID,
            },
        ),
        LeafPrimitive::Aabb {
            bounds,
            primitive_id,
            geometry_id_and_flags,
        } => memory.write(
            va,
            &AabbNode {
                aabb: *bounds,
                primitive_id: *primitive_id,
                geometry_id_and_flags: *geometry_id_and_flags,
                reserved: [0; 8],
            },
        ),
        LeafPrimitive::Instance(inst) => memory.write(
            va,
            &InstanceNode {
                bvh_ptr: inst.bvh_ptr(),
                custom_instance_and_mask: inst.custom_instance_and_mask,
                sbt_offset_and_flags: inst.sbt_offset_and_flags,
                wto_matrix: inst.wto_matrix(),
                instance_id: inst.instance_id,
                bvh_offset: inst.blas_bvh_offset,
                reserved: [0; 2],
                otw_matrix: inst.otw_matrix,
            },
        ),
    }
}

/// Write an 8-wide leaf (a primitive node, or an instance node pair).
pub fn write_gfx12_leaf(memory: &DeviceMemory, va: u64, leaf: &LeafPrimitive) {
    match leaf {
        LeafPrimitive::Triangle {
            coords,
            triangle_id,
            geometry_id_and_flags,
        } => memory.write(
            va,
            &Gfx12PrimitiveNode::triangle(
                coords,
                *geometry_id_and_flags,
                *triangle_id,
                geometry_id_and_flags & GEOMETRY_OPAQUE != 0,
            ),
        ),
        LeafPrimitive::Aabb {
            bounds,
            primitive_id,
            geometry_id_and_flags,
        } => memory.write(
            va,
            &Gfx12PrimitiveNode::aabb(
                bounds,
                *geometry_id_and_flags,
                *primitive_id,
                geometry_id_and_flags & GEOMETRY_OPAQUE != 0,
            ),
        ),
        LeafPrimitive::Instance(inst) => {
            let frame = compute_frame(&inst.blas_aabb);
            let mut children = [BoxChild::NULL; 4];
            children[0] = BoxChild::new(&quantize(&frame, &inst.blas_aabb), 0, 0xff, NODE_TYPE_BOX32, 1);
            memory.write(
                va,
                &Gfx12InstanceNode {
                    wto_matrix: inst.wto_matrix(),
                    pointer_flags_bvh_addr: inst.bvh_ptr(),
                    unused: 0,
                    cull_mask_user_data: (inst.sbt_offset_and_flags & 0xff_ffff)
                        | (inst.custom_instance_and_mask & 0xff00_0000),
                    origin: frame.origin,
                    child_count_exponents: pack_exponents(&frame, 1),
                    children,
                },
            );
            memory.write(
                va + GFX12_NODE_SIZE as u64,
                &Gfx12InstanceUserData {
                    otw_matrix: inst.otw_matrix,
                    custom_instance: inst.custom_instance_and_mask & 0xff_ffff,
                    instance_index: inst.instance_id,
                    bvh_offset: inst.blas_bvh_offset,
                    reserved: [0; 17],
                },
            );
        }
    }
}

/// Write a hardware leaf in the requested format.
#[inline]
pub fn write_leaf(memory: &DeviceMemory, va: u64, leaf: &LeafPrimitive, bvh8: bool) {
    if bvh8 {
        write_gfx12_leaf(memory, va, leaf)
    } else {
        write_legacy_leaf(memory, va, leaf)
    }
}

/// Fetch and write one hardware leaf of any geometry type. Returns whether
/// the primitive is active; `bounds` is set to its box, or to
/// [`Aabb::EMPTY`] when inactive (in which case nothing is written).
pub fn build_leaf(memory: &DeviceMemory, bounds: &mut Aabb, dst: u64, geom: &GeometryData, index: u32, bvh8: bool) -> bool {
    match fetch_leaf(memory, geom, index) {
        Some(leaf) => {
            *bounds = leaf.bounds();
            write_leaf(memory, dst, &leaf, bvh8);
            true
        }
        None => {
            *bounds = Aabb::EMPTY;
            false
        }
    }
}

pub fn build_triangle(memory: &DeviceMemory, bounds: &mut Aabb, dst: u64, geom: &GeometryData, index: u32, bvh8: bool) -> bool {
    debug_assert_eq!(geom.geometry_type, GEOMETRY_TYPE_TRIANGLES);
    build_leaf(memory, bounds, dst, geom, index, bvh8)
}

pub fn build_aabb(memory: &DeviceMemory, bounds: &mut Aabb, dst: u64, geom: &GeometryData, index: u32, bvh8: bool) -> bool {
    debug_assert_eq!(geom.geometry_type, GEOMETRY_TYPE_AABBS);
    build_leaf(memory, bounds, dst, geom, index, bvh8)
}

pub fn build_instance(memory: &DeviceMemory, bounds: &mut Aabb, dst: u64, geom: &GeometryData, index: u32, bvh8: bool) -> bool {
    debug_assert_eq!(geom.geometry_type, GEOMETRY_TYPE_INSTANCES);
    build_leaf(memory, bounds, dst, geom, index, bvh8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::gfx12::PrimitiveInfo;

    fn upload<T: bytemuck::Pod>(memory: &DeviceMemory, data: &[T]) -> u64 {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buf = memory.allocate(bytes.len() as u64).unwrap();
        memory.upload(buf.va(), bytes).unwrap();
        buf.va()
    }

    fn triangle_geometry(memory: &DeviceMemory, verts: &[[f32; 3]]) -> GeometryData {
        GeometryData {
            data: upload(memory, verts),
            stride: 12,
            vertex_format: FORMAT_R32G32B32_SFLOAT,
            index_format: INDEX_TYPE_NONE,
            geometry_type: GEOMETRY_TYPE_TRIANGLES,
            geometry_id: 2 | GEOMETRY_OPAQUE,
            ..Default::default()
        }
    }

    #[test]
    fn test_triangle_leaf_both_formats() {
        let memory = DeviceMemory::new();
        let geom = triangle_geometry(&memory, &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 2.0, -1.0]]);
        let dst = memory.allocate(256).unwrap().va();

        let mut bounds = Aabb::EMPTY;
        assert!(build_triangle(&memory, &mut bounds, dst, &geom, 0, false));
        assert_eq!(bounds, Aabb::new([0.0, 0.0, -1.0], [1.0, 2.0, 0.0]));
        let node = memory.read::<TriangleNode>(dst);
        assert_eq!(node.coords[2], [0.0, 2.0, -1.0]);
        assert_eq!(node.geometry_id_and_flags, 2 | GEOMETRY_OPAQUE);
        assert_eq!(node.id, TRIANGLE_NODE_ID);

        assert!(build_triangle(&memory, &mut bounds, dst + 128, &geom, 0, true));
        let info: PrimitiveInfo = memory.read::<Gfx12PrimitiveNode>(dst + 128).decode();
        assert_eq!(info.geometry_id, 2);
        assert!(info.opaque);
        assert_eq!(info.bounds(), bounds);
    }

    #[test]
    fn test_inactive_primitives() {
        let memory = DeviceMemory::new();
        let geom = triangle_geometry(&memory, &[[0.0, f32::NAN, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let dst = memory.allocate(64).unwrap().va();
        let mut bounds = Aabb::new([0.0; 3], [1.0; 3]);
        assert!(!build_triangle(&memory, &mut bounds, dst, &geom, 0, false));
        assert!(bounds.is_empty());
        // Nothing was written.
        assert_eq!(memory.read::<TriangleNode>(dst), TriangleNode::default());

        let boxes = [Aabb::new([1.0, 0.0, 0.0], [0.0, 1.0, 1.0]), Aabb::NAN, Aabb::new([0.0; 3], [0.0; 3])];
        let geom = GeometryData {
            data: upload(&memory, &boxes),
            stride: 24,
            geometry_type: GEOMETRY_TYPE_AABBS,
            ..Default::default()
        };
        assert!(fetch_leaf(&memory, &geom, 0).is_none());
        assert!(fetch_leaf(&memory, &geom, 1).is_none());
        // A flat box is still a valid primitive.
        assert!(fetch_leaf(&memory, &geom, 2).is_some());
        // Past the end of the buffer.
        assert!(fetch_leaf(&memory, &geom, 3).is_none());
    }

    #[test]
    fn test_instance_leaf() {
        let memory = DeviceMemory::new();
        let blas = memory.allocate(256).unwrap();
        let header = AccelStructHeader {
            bvh_offset: 192,
            aabb: Aabb::new([-1.0; 3], [1.0; 3]),
            ..Default::default()
        };
        memory.upload(blas.va(), bytemuck::bytes_of(&header)).unwrap();

        let mut transform = crate::util::MAT3X4_IDENTITY;
        transform[3] = 5.0;
        let instances = [
            InstanceInput {
                transform,
                custom_instance_and_mask: 0x8000_0011,
                sbt_offset_and_flags: (INSTANCE_FORCE_OPAQUE << 24) | 3,
                acceleration_structure_reference: blas.va(),
            },
            InstanceInput::default(),
        ];
        let geom = GeometryData {
            data: upload(&memory, &instances),
            stride: INSTANCE_INPUT_SIZE,
            geometry_type: GEOMETRY_TYPE_INSTANCES,
            ..Default::default()
        };

        let leaf = fetch_leaf(&memory, &geom, 0).unwrap();
        assert_eq!(leaf.bounds(), Aabb::new([4.0, -1.0, -1.0], [6.0, 1.0, 1.0]));
        assert_eq!(flags_mask(leaf.flags()), 0x80);
        assert_eq!(flags_cull(leaf.flags()), IR_FLAG_ONLY_OPAQUE);
        // Null reference.
        assert!(fetch_leaf(&memory, &geom, 1).is_none());

        let dst = memory.allocate(256).unwrap().va();
        write_legacy_leaf(&memory, dst, &leaf);
        let node = memory.read::<InstanceNode>(dst);
        assert_eq!(node_to_addr(node.bvh_ptr), blas.va() + 192);
        assert_eq!(node.bvh_ptr >> INSTANCE_PTR_FLAGS_SHIFT, INSTANCE_FORCE_OPAQUE as u64);
        assert_eq!(node.wto_matrix[3], -5.0);

        write_gfx12_leaf(&memory, dst, &leaf);
        let user = memory.read::<Gfx12InstanceUserData>(dst + 128);
        assert_eq!(user.bvh_offset, 192);
        assert_eq!(user.custom_instance, 0x11);
        let node = memory.read::<Gfx12InstanceNode>(dst);
        assert_eq!(node.cull_mask_user_data >> 24, 0x80);
        assert!(node.children[1].is_null());
    }

    #[test]
    fn test_ir_leaf_roundtrip_keeps_inactive() {
        let memory = DeviceMemory::new();
        let va = memory.allocate(128).unwrap().va();
        write_ir_leaf(&memory, va, GEOMETRY_TYPE_AABBS, None);
        assert_eq!(read_ir_leaf(&memory, va, IR_NODE_AABB), None);

        let leaf = LeafPrimitive::Aabb {
            bounds: Aabb::new([0.0; 3], [1.0; 3]),
            primitive_id: 4,
            geometry_id_and_flags: 1,
        };
        write_ir_leaf(&memory, va, GEOMETRY_TYPE_AABBS, Some(&leaf));
        assert_eq!(read_ir_leaf(&memory, va, IR_NODE_AABB), Some(leaf));
    }
}
