//! Primitive fetch from application buffers.
//!
//! Index and vertex data are read through device addresses described by a
//! [`GeometryData`] record. Reads that fall outside mapped memory and
//! formats the device cannot decode both return `None`, which the leaf
//! builder treats as an inactive primitive.

use byteorder::{ByteOrder, LittleEndian};
use half::f16;

use super::format::*;
use crate::device::DeviceMemory;
use crate::util::{transform_point, Aabb, Mat3x4};

/// Byte size of one vertex of `format`, or `None` if unsupported.
pub fn vertex_format_size(format: u32) -> Option<u32> {
    Some(match format {
        FORMAT_R32G32B32_SFLOAT => 12,
        FORMAT_R32G32_SFLOAT => 8,
        FORMAT_R16G16B16A16_SFLOAT | FORMAT_R16G16B16A16_SNORM | FORMAT_R16G16B16A16_UNORM => 8,
        FORMAT_R16G16_SFLOAT | FORMAT_R16G16_SNORM | FORMAT_R16G16_UNORM => 4,
        FORMAT_R8G8B8A8_SNORM | FORMAT_R8G8B8A8_UNORM => 4,
        FORMAT_R8G8_SNORM | FORMAT_R8G8_UNORM => 2,
        FORMAT_A2B10G10R10_UNORM_PACK32 => 4,
        _ => return None,
    })
}

/// Byte size of one index, `Some(0)` for non-indexed geometry.
pub fn index_type_size(index_type: u32) -> Option<u32> {
    Some(match index_type {
        INDEX_TYPE_NONE => 0,
        INDEX_TYPE_UINT8 => 1,
        INDEX_TYPE_UINT16 => 2,
        INDEX_TYPE_UINT32 => 4,
        _ => return None,
    })
}

#[inline]
fn snorm16(v: u16) -> f32 {
    (v as i16 as f32 / 32767.0).max(-1.0)
}

#[inline]
fn unorm16(v: u16) -> f32 {
    v as f32 / 65535.0
}

#[inline]
fn snorm8(v: u8) -> f32 {
    (v as i8 as f32 / 127.0).max(-1.0)
}

#[inline]
fn unorm8(v: u8) -> f32 {
    v as f32 / 255.0
}

/// Decode one vertex from its raw bytes.
pub fn decode_vertex(format: u32, raw: &[u8]) -> Option<[f32; 3]> {
    let f16_at = |i: usize| f16::from_bits(LittleEndian::read_u16(&raw[i * 2..])).to_f32();
    let u16_at = |i: usize| LittleEndian::read_u16(&raw[i * 2..]);
    Some(match format {
        FORMAT_R32G32B32_SFLOAT => [
            LittleEndian::read_f32(&raw[0..]),
            LittleEndian::read_f32(&raw[4..]),
            LittleEndian::read_f32(&raw[8..]),
        ],
        FORMAT_R32G32_SFLOAT => [LittleEndian::read_f32(&raw[0..]), LittleEndian::read_f32(&raw[4..]), 0.0],
        FORMAT_R16G16B16A16_SFLOAT => [f16_at(0), f16_at(1), f16_at(2)],
        FORMAT_R16G16_SFLOAT => [f16_at(0), f16_at(1), 0.0],
        FORMAT_R16G16B16A16_SNORM => [snorm16(u16_at(0)), snorm16(u16_at(1)), snorm16(u16_at(2))],
        FORMAT_R16G16_SNORM => [snorm16(u16_at(0)), snorm16(u16_at(1)), 0.0],
        FORMAT_R16G16B16A16_UNORM => [unorm16(u16_at(0)), unorm16(u16_at(1)), unorm16(u16_at(2))],
        FORMAT_R16G16_UNORM => [unorm16(u16_at(0)), unorm16(u16_at(1)), 0.0],
        FORMAT_R8G8B8A8_SNORM => [snorm8(raw[0]), snorm8(raw[1]), snorm8(raw[2])],
        FORMAT_R8G8_SNORM => [snorm8(raw[0]), snorm8(raw[1]), 0.0],
        FORMAT_R8G8B8A8_UNORM => [unorm8(raw[0]), unorm8(raw[1]), unorm8(raw[2])],
        FORMAT_R8G8_UNORM => [unorm8(raw[0]), unorm8(raw[1]), 0.0],
        FORMAT_A2B10G10R10_UNORM_PACK32 => {
            let v = LittleEndian::read_u32(raw);
            [
                (v & 0x3ff) as f32 / 1023.0,
                ((v >> 10) & 0x3ff) as f32 / 1023.0,
                ((v >> 20) & 0x3ff) as f32 / 1023.0,
            ]
        }
        _ => return None,
    })
}

/// Vertex index of corner `corner` of triangle `primitive`.
pub fn fetch_index(memory: &DeviceMemory, geom: &GeometryData, primitive: u32, corner: u32) -> Option<u32> {
    let slot = primitive as u64 * 3 + corner as u64;
    let size = index_type_size(geom.index_format)?;
    if size == 0 {
        return u32::try_from(slot).ok();
    }
    let mut raw = [0u8; 4];
    let raw = &mut raw[..size as usize];
    if !memory.read_bytes(geom.indices + slot * size as u64, raw) {
        return None;
    }
    Some(match size {
        1 => raw[0] as u32,
        2 => LittleEndian::read_u16(raw) as u32,
        _ => LittleEndian::read_u32(raw),
    })
}

/// Read vertex `index` untransformed.
pub fn fetch_vertex(memory: &DeviceMemory, geom: &GeometryData, index: u32) -> Option<[f32; 3]> {
    let size = vertex_format_size(geom.vertex_format)?;
    let mut raw = [0u8; 12];
    let raw = &mut raw[..size as usize];
    if !memory.read_bytes(geom.data + index as u64 * geom.stride as u64, raw) {
        return None;
    }
    decode_vertex(geom.vertex_format, raw)
}

/// Read the geometry transform, identity when none is set.
pub fn fetch_transform(memory: &DeviceMemory, geom: &GeometryData) -> Option<Option<Mat3x4>> {
    if geom.transform == 0 {
        return Some(None);
    }
    memory.try_read::<Mat3x4>(geom.transform).map(Some)
}

/// The three transformed vertices of triangle `primitive`.
pub fn fetch_triangle(memory: &DeviceMemory, geom: &GeometryData, primitive: u32) -> Option<[[f32; 3]; 3]> {
    let transform = fetch_transform(memory, geom)?;
    let mut vertices = [[0.0f32; 3]; 3];
    for (corner, v) in vertices.iter_mut().enumerate() {
        let index = fetch_index(memory, geom, primitive, corner as u32)?;
        let p = fetch_vertex(memory, geom, index)?;
        *v = match &transform {
            Some(m) => transform_point(m, p),
            None => p,
        };
    }
    Some(vertices)
}

/// Procedural box `primitive`.
pub fn fetch_aabb(memory: &DeviceMemory, geom: &GeometryData, primitive: u32) -> Option<Aabb> {
    memory.try_read::<Aabb>(geom.data + primitive as u64 * geom.stride as u64)
}

/// Instance `index`, following the pointer when the geometry is an array
/// of pointers (stride 8).
pub fn fetch_instance(memory: &DeviceMemory, geom: &GeometryData, index: u32) -> Option<InstanceInput> {
    let at = geom.data + index as u64 * geom.stride as u64;
    let va = if geom.stride == 8 { memory.try_read::<u64>(at)? } else { at };
    memory.try_read::<InstanceInput>(va)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_formats() {
        let mut raw = [0u8; 12];
        LittleEndian::write_f32(&mut raw[0..], 1.5);
        LittleEndian::write_f32(&mut raw[4..], -2.0);
        LittleEndian::write_f32(&mut raw[8..], 3.25);
        assert_eq!(decode_vertex(FORMAT_R32G32B32_SFLOAT, &raw), Some([1.5, -2.0, 3.25]));
        assert_eq!(decode_vertex(FORMAT_R32G32_SFLOAT, &raw), Some([1.5, -2.0, 0.0]));

        let mut raw = [0u8; 8];
        LittleEndian::write_u16(&mut raw[0..], f16::from_f32(0.5).to_bits());
        LittleEndian::write_u16(&mut raw[2..], f16::from_f32(-4.0).to_bits());
        LittleEndian::write_u16(&mut raw[4..], f16::from_f32(8.0).to_bits());
        assert_eq!(decode_vertex(FORMAT_R16G16B16A16_SFLOAT, &raw), Some([0.5, -4.0, 8.0]));

        LittleEndian::write_u16(&mut raw[0..], 0x8000); // -32768
        LittleEndian::write_u16(&mut raw[2..], 32767);
        assert_eq!(decode_vertex(FORMAT_R16G16_SNORM, &raw), Some([-1.0, 1.0, 0.0]));

        let raw = [255u8, 0, 128, 0];
        assert_eq!(decode_vertex(FORMAT_R8G8_UNORM, &raw), Some([1.0, 0.0, 0.0]));
        assert_eq!(decode_vertex(FORMAT_R8G8B8A8_SNORM, &[0x81, 0x7f, 0, 0]), Some([-1.0, 1.0, 0.0]));

        let packed = 1023u32 | (1023 << 20);
        assert_eq!(
            decode_vertex(FORMAT_A2B10G10R10_UNORM_PACK32, &packed.to_le_bytes()),
            Some([1.0, 0.0, 1.0])
        );
        assert_eq!(decode_vertex(12345, &[0u8; 12]), None);
        assert_eq!(vertex_format_size(12345), None);
    }

    #[test]
    fn test_indexed_fetch() {
        let memory = DeviceMemory::new();
        let vb = memory.allocate(4 * 12).unwrap();
        let ib = memory.allocate(6 * 2).unwrap();
        let verts: [[f32; 3]; 4] = [[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        memory.upload(vb.va(), bytemuck::cast_slice(&verts)).unwrap();
        memory.upload(ib.va(), bytemuck::cast_slice(&[0u16, 1, 2, 1, 3, 2])).unwrap();

        let geom = GeometryData {
            data: vb.va(),
            indices: ib.va(),
            stride: 12,
            vertex_format: FORMAT_R32G32B32_SFLOAT,
            index_format: INDEX_TYPE_UINT16,
            ..Default::default()
        };
        assert_eq!(fetch_triangle(&memory, &geom, 1), Some([verts[1], verts[3], verts[2]]));
        // Index buffer ends after two triangles.
        assert_eq!(fetch_triangle(&memory, &geom, 2), None);

        let translated = GeometryData {
            transform: {
                let t = memory.allocate(48).unwrap();
                let m: Mat3x4 = [1.0, 0.0, 0.0, 10.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
                memory.upload(t.va(), bytemuck::bytes_of(&m)).unwrap();
                t.va()
            },
            ..geom
        };
        let tri = fetch_triangle(&memory, &translated, 0).unwrap();
        assert_eq!(tri[1], [11.0, 0.0, 0.0]);
    }

    #[test]
    fn test_instance_pointer_array() {
        let memory = DeviceMemory::new();
        let instances = memory.allocate(64).unwrap();
        let pointers = memory.allocate(8).unwrap();
        let inst = InstanceInput {
            custom_instance_and_mask: 0xff00_0007,
            acceleration_structure_reference: 0x1234_0000,
            ..Default::default()
        };
        memory.upload(instances.va(), bytemuck::bytes_of(&inst)).unwrap();
        memory.upload(pointers.va(), &instances.va().to_le_bytes()).unwrap();

        let geom = GeometryData {
            data: pointers.va(),
            stride: 8,
            geometry_type: GEOMETRY_TYPE_INSTANCES,
            ..Default::default()
        };
        assert_eq!(fetch_instance(&memory, &geom, 0), Some(inst));
        assert_eq!(fetch_instance(&memory, &geom, 1), None);
    }
}
