//! # radv-bvh
//!
//! Software model of the RADV ray-tracing acceleration structure pipeline.
//!
//! Structures are built, refitted, copied and (de)serialized by compute
//! kernels running on a simulated device, producing the same bytes the GPU
//! would: the legacy 4-wide format (GFX10.3/GFX11) or the 8-wide quantized
//! format (GFX12).
//!
//! ## Modules
//!
//! - [`util`] - errors, bounding boxes, bit streams
//! - [`config`] - device configuration
//! - [`device`] - memory, pipelines, dispatch, command buffers
//! - [`bvh`] - node formats and kernels, host-side inspection
//! - [`accel`] - driver entry points: sizes, build, update, copy
//!
//! ## Example
//!
//! ```ignore
//! use radv_bvh::prelude::*;
//!
//! let device = Device::new(DeviceConfig::load())?;
//! let sizes = get_build_sizes(&device, AccelStructType::BottomLevel, &geometries, &[count])?;
//! let blas = create_acceleration_structure(&device, AccelStructType::BottomLevel, sizes.accel_struct_size)?;
//!
//! let mut cmd = CommandBuffer::new(device.clone());
//! cmd_build_acceleration_structures(&mut cmd, &[info], &[&ranges])?;
//! cmd.submit()?;
//! ```

pub mod accel;
pub mod bvh;
pub mod config;
pub mod device;
pub mod util;

pub use config::{DeviceConfig, GfxLevel};
pub use device::{CommandBuffer, Device};
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accel::{
        cmd_build_acceleration_structures, cmd_copy_acceleration_structure, cmd_copy_acceleration_structure_to_memory,
        cmd_copy_memory_to_acceleration_structure, create_acceleration_structure, device_compatibility,
        get_build_sizes, init_null_accel_struct, read_header, AabbsData, AccelStructType, AccelerationStructure,
        BuildAccelFlags, BuildGeometryInfo, BuildMode, BuildRangeInfo, BuildSizes, CopyMode, Geometry,
        GeometryFlags, GeometryKind, IndexType, InstancesData, TrianglesData, VertexFormat,
    };
    pub use crate::bvh::inspect::{BvhStats, Inspector};
    pub use crate::bvh::{AccelStructHeader, BuildFlags, BvhVariant};
    pub use crate::config::{DeviceConfig, GfxLevel};
    pub use crate::device::{CommandBuffer, Device};
    pub use crate::util::{Aabb, Error, Result};
}
