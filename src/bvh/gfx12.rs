//! GFX12 8-wide node formats.
//!
//! Every node is 128 bytes. Box nodes hold up to eight children with
//! 12-bit quantized bounds (see [`quantize`](super::quantize)); children
//! are addressed implicitly from two base ids, internal children packed
//! contiguously from `internal_base_id` and leaf children from
//! `primitive_base_id`, in slot order. Instances occupy two nodes: the
//! hardware instance node followed by a user-data node.

use bytemuck::{Pod, Zeroable};

use super::format::{node_id, GEOMETRY_ID_MASK, NODE_TYPE_BOX32, NODE_TYPE_INSTANCE, NODE_TYPE_TRIANGLE};
use super::quantize::{QuantBox, QuantFrame};
use crate::util::{get_bits, set_bits, BitReader, BitWriter};
use crate::util::{Aabb, Mat3x4};

pub const GFX12_NODE_SIZE: u32 = 128;
/// Instance node + user data node.
pub const GFX12_INSTANCE_LEAF_SIZE: u32 = 2 * GFX12_NODE_SIZE;
/// No oriented-bounding-box matrix.
pub const OBB_MATRIX_NONE: u32 = 0x7f;

// ============================================================================
// Box child
// ============================================================================

/// One quantized child slot (3 dwords).
///
/// ```text
/// dword0 = min_x:12 | min_y:12 | cull_flags:4 | 0:4
/// dword1 = min_z:12 | max_x:12 | instance_mask:8
/// dword2 = max_y:12 | max_z:12 | node_type:4 | node_size:4
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BoxChild {
    pub dword0: u32,
    pub dword1: u32,
    pub dword2: u32,
}

impl BoxChild {
    /// Unused slot.
    pub const NULL: Self = Self {
        dword0: 0xffff_ffff,
        dword1: 0xfff,
        dword2: 0,
    };

    pub fn new(q: &QuantBox, cull_flags: u32, instance_mask: u32, node_type: u32, node_size: u32) -> Self {
        let mut child = Self {
            dword0: (cull_flags & 0xf) << 24,
            dword1: (instance_mask & 0xff) << 24,
            dword2: ((node_type & 0xf) << 24) | ((node_size & 0xf) << 28),
        };
        child.set_bounds(q);
        child
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Replace the quantized bounds, keeping type, size, cull flags and mask.
    pub fn set_bounds(&mut self, q: &QuantBox) {
        self.dword0 = (self.dword0 & 0xff00_0000) | (q.min[0] & 0xfff) | ((q.min[1] & 0xfff) << 12);
        self.dword1 = (self.dword1 & 0xff00_0000) | (q.min[2] & 0xfff) | ((q.max[0] & 0xfff) << 12);
        self.dword2 = (self.dword2 & 0xff00_0000) | (q.max[1] & 0xfff) | ((q.max[2] & 0xfff) << 12);
    }

    pub fn bounds(&self) -> QuantBox {
        QuantBox {
            min: [self.dword0 & 0xfff, (self.dword0 >> 12) & 0xfff, self.dword1 & 0xfff],
            max: [(self.dword1 >> 12) & 0xfff, self.dword2 & 0xfff, (self.dword2 >> 12) & 0xfff],
        }
    }

    #[inline]
    pub fn cull_flags(&self) -> u32 {
        (self.dword0 >> 24) & 0xf
    }

    #[inline]
    pub fn instance_mask(&self) -> u32 {
        self.dword1 >> 24
    }

    #[inline]
    pub fn node_type(&self) -> u32 {
        (self.dword2 >> 24) & 0xf
    }

    /// Size in 128-byte units.
    #[inline]
    pub fn node_size(&self) -> u32 {
        self.dword2 >> 28
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        !self.is_null() && self.node_type() == NODE_TYPE_BOX32
    }
}

// ============================================================================
// Box node
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Gfx12BoxNode {
    pub internal_base_id: u32,
    pub primitive_base_id: u32,
    pub unused: u32,
    pub origin: [f32; 3],
    /// exp_x:8 | exp_y:8 | exp_z:8 | 0:4 | valid_child_count_minus_one:4
    pub child_count_exponents: u32,
    pub obb_matrix_index: u32,
    pub children: [BoxChild; 8],
}

impl Gfx12BoxNode {
    /// Node with no valid children.
    pub fn empty() -> Self {
        Self {
            internal_base_id: 0,
            primitive_base_id: 0,
            unused: 0,
            origin: [0.0; 3],
            child_count_exponents: 0,
            obb_matrix_index: OBB_MATRIX_NONE,
            children: [BoxChild::NULL; 8],
        }
    }

    pub fn set_frame(&mut self, frame: &QuantFrame, valid_child_count: u32) {
        self.origin = frame.origin;
        self.child_count_exponents = pack_exponents(frame, valid_child_count);
    }

    pub fn frame(&self) -> QuantFrame {
        QuantFrame {
            origin: self.origin,
            exponents: unpack_exponents(self.child_count_exponents),
        }
    }

    /// Number of leading child slots that may be valid.
    #[inline]
    pub fn valid_child_count(&self) -> u32 {
        (self.child_count_exponents >> 28) + 1
    }

    /// Node ids of the children, in slot order. Null slots yield `None`.
    pub fn child_ids(&self) -> [Option<u32>; 8] {
        let mut ids = [None; 8];
        let mut internal_id = self.internal_base_id;
        let mut primitive_id = self.primitive_base_id;
        for (i, child) in self.children.iter().enumerate().take(self.valid_child_count() as usize) {
            if child.is_null() {
                continue;
            }
            let advance = (child.node_size() * GFX12_NODE_SIZE) >> 3;
            if child.node_type() == NODE_TYPE_BOX32 {
                ids[i] = Some(internal_id | NODE_TYPE_BOX32);
                internal_id += advance;
            } else {
                ids[i] = Some(primitive_id | child.node_type());
                primitive_id += advance;
            }
        }
        ids
    }
}

#[inline]
pub fn pack_exponents(frame: &QuantFrame, valid_child_count: u32) -> u32 {
    (frame.exponents[0] & 0xff)
        | ((frame.exponents[1] & 0xff) << 8)
        | ((frame.exponents[2] & 0xff) << 16)
        | ((valid_child_count.saturating_sub(1) & 0xf) << 28)
}

#[inline]
pub fn unpack_exponents(child_count_exponents: u32) -> [u32; 3] {
    [
        child_count_exponents & 0xff,
        (child_count_exponents >> 8) & 0xff,
        (child_count_exponents >> 16) & 0xff,
    ]
}

// ============================================================================
// Instance nodes
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Gfx12InstanceNode {
    pub wto_matrix: Mat3x4,
    /// Node pointer to the BLAS root, instance flags above bit 54
    pub pointer_flags_bvh_addr: u64,
    pub unused: u32,
    /// sbt offset (24) | cull mask (8)
    pub cull_mask_user_data: u32,
    pub origin: [f32; 3],
    pub child_count_exponents: u32,
    /// Object-space BLAS root box
    pub children: [BoxChild; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Gfx12InstanceUserData {
    pub otw_matrix: Mat3x4,
    pub custom_instance: u32,
    pub instance_index: u32,
    /// `bvh_offset` of the referenced BLAS
    pub bvh_offset: u32,
    pub reserved: [u32; 17],
}

impl Default for Gfx12InstanceUserData {
    fn default() -> Self {
        Self::zeroed()
    }
}

// ============================================================================
// Primitive node
// ============================================================================

/// Bits of the primitive node header.
pub const PRIMITIVE_NODE_HEADER_SIZE: u32 = 52;
/// Bit position of the `indices_midpoint` header field.
pub const INDICES_MIDPOINT_BIT: u32 = 42;
const PRIMITIVE_NODE_BITS: u32 = GFX12_NODE_SIZE * 8;
const PAIR_DESC_BITS: u32 = 29;
const ID_BITS: u32 = 28;
/// Vertex index marking the procedural (AABB) slot of a pair.
const PROCEDURAL_VERTEX: u32 = 0xf;

/// A 1024-bit primitive node holding one triangle or one AABB.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Gfx12PrimitiveNode {
    pub words: [u32; 32],
}

/// Decoded contents of a primitive node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveInfo {
    pub vertices: [[f32; 3]; 3],
    pub vertex_count: u32,
    pub geometry_id: u32,
    pub primitive_id: u32,
    pub opaque: bool,
    pub procedural: bool,
}

impl PrimitiveInfo {
    pub fn bounds(&self) -> Aabb {
        let mut b = Aabb::EMPTY;
        for v in &self.vertices[..self.vertex_count as usize] {
            b.grow_point(*v);
        }
        b
    }
}

impl Gfx12PrimitiveNode {
    fn encode(vertices: &[[f32; 3]], geometry_id: u32, primitive_id: u32, desc: u32) -> Self {
        let mut node = Self::zeroed();
        let midpoint = PRIMITIVE_NODE_HEADER_SIZE + vertices.len() as u32 * 96 + ID_BITS;

        let mut w = BitWriter::new(&mut node.words, 0);
        w.write(31, 5); // x_vertex_bits_minus_one
        w.write(31, 5); // y_vertex_bits_minus_one
        w.write(31, 5); // z_vertex_bits_minus_one
        w.write(0, 5); // trailing_zero_bits
        w.write(ID_BITS / 2, 4); // geometry_index_base_bits_div_2
        w.write(ID_BITS / 2, 4); // geometry_index_bits_div_2
        w.write(0, 3); // triangle_pair_count_minus_one
        w.write(0, 1); // vertex_type
        w.write(ID_BITS, 5); // primitive_index_base_bits
        w.write(ID_BITS, 5); // primitive_index_bits
        w.write(midpoint, 10);

        for v in vertices {
            for c in v {
                w.write(c.to_bits(), 32);
            }
        }
        w.write(geometry_id & GEOMETRY_ID_MASK, ID_BITS);
        debug_assert_eq!(w.position(), midpoint);
        w.write(primitive_id, ID_BITS);
        set_bits(&mut node.words, PRIMITIVE_NODE_BITS - PAIR_DESC_BITS, PAIR_DESC_BITS, desc);
        node
    }

    /// Pair descriptor, low bits first: tri1 v0/v1/v2, opaque, double
    /// sided; tri0 v0/v1/v2, opaque, double sided; range stop.
    fn pair_desc(tri0: [u32; 3], opaque: bool) -> u32 {
        let mut desc = 0u32;
        let mut pos = 0;
        let mut put = |value: u32, bits: u32| {
            desc |= (value & ((1 << bits) - 1)) << pos;
            pos += bits;
        };
        // tri1 is unused
        put(0, 4);
        put(0, 4);
        put(0, 4);
        put(0, 1);
        put(0, 1);
        put(tri0[0], 4);
        put(tri0[1], 4);
        put(tri0[2], 4);
        put(opaque as u32, 1);
        put(0, 1);
        put(1, 1); // prim_range_stop
        desc
    }

    pub fn triangle(vertices: &[[f32; 3]; 3], geometry_id: u32, primitive_id: u32, opaque: bool) -> Self {
        Self::encode(vertices, geometry_id, primitive_id, Self::pair_desc([0, 1, 2], opaque))
    }

    pub fn aabb(bounds: &Aabb, geometry_id: u32, primitive_id: u32, opaque: bool) -> Self {
        Self::encode(
            &[bounds.min, bounds.max],
            geometry_id,
            primitive_id,
            Self::pair_desc([0, 1, PROCEDURAL_VERTEX], opaque),
        )
    }

    #[inline]
    pub fn indices_midpoint(&self) -> u32 {
        get_bits(&self.words, INDICES_MIDPOINT_BIT, 10)
    }

    #[inline]
    pub fn geometry_id(&self) -> u32 {
        get_bits(&self.words, self.indices_midpoint().saturating_sub(ID_BITS), ID_BITS)
    }

    #[inline]
    pub fn primitive_id(&self) -> u32 {
        get_bits(&self.words, self.indices_midpoint(), ID_BITS)
    }

    pub fn decode(&self) -> PrimitiveInfo {
        let desc = get_bits(&self.words, PRIMITIVE_NODE_BITS - PAIR_DESC_BITS, PAIR_DESC_BITS);
        let tri0_v2 = (desc >> 22) & 0xf;
        let procedural = tri0_v2 == PROCEDURAL_VERTEX;
        let vertex_count = if procedural { 2 } else { 3 };

        let mut vertices = [[0.0f32; 3]; 3];
        let mut r = BitReader::new(&self.words, PRIMITIVE_NODE_HEADER_SIZE);
        for v in vertices.iter_mut().take(vertex_count) {
            for c in v.iter_mut() {
                *c = f32::from_bits(r.read(32));
            }
        }

        PrimitiveInfo {
            vertices,
            vertex_count: vertex_count as u32,
            geometry_id: self.geometry_id(),
            primitive_id: self.primitive_id(),
            opaque: (desc >> 26) & 1 != 0,
            procedural,
        }
    }
}

/// Id of a primitive node at a body-relative offset.
#[inline]
pub const fn primitive_node_id(offset: u32) -> u32 {
    node_id(offset, NODE_TYPE_TRIANGLE)
}

/// Id of an instance node at a body-relative offset.
#[inline]
pub const fn instance_node_id(offset: u32) -> u32 {
    node_id(offset, NODE_TYPE_INSTANCE)
}
