//! Copies, compaction and (de)serialization.
//!
//! All three copy the structure with one kernel whose size comes from the
//! source header at execution time, so the dispatch is indirect through
//! `copy_dispatch_size`. Deserialization cannot read a header until the
//! blob's own sizes are known and dispatches a fixed grid instead.

use super::{check_buffer, device_build_flags, device_compatibility, pipeline, CopyMode};
use crate::bvh::args::{CopyArgs, COPY_MODE_COPY, COPY_MODE_DESERIALIZE, COPY_MODE_SERIALIZE};
use crate::bvh::copy::{CopyBlasAddrsKernel, CopyKernel, BLAS_ADDRS_GROUPS, BLAS_ADDRS_NAME, DESERIALIZE_GROUPS, NAME};
use crate::bvh::format::*;
use crate::device::{CommandBuffer, DispatchInfo};
use crate::util::{Error, Result};

fn bind_copy(cmd: &mut CommandBuffer) -> BuildFlags {
    let device = cmd.device().clone();
    let flags = device_build_flags(device.config());
    cmd.bind_pipeline(pipeline(&device, NAME, flags, || CopyKernel { flags }));
    flags
}

/// Rewrite 8-wide instance pointers through the leaf node offset table.
fn record_blas_addrs(cmd: &mut CommandBuffer, args: &CopyArgs) -> Result<()> {
    let device = cmd.device().clone();
    cmd.barrier("copy");
    cmd.bind_pipeline(pipeline(&device, BLAS_ADDRS_NAME, BuildFlags::empty(), CopyBlasAddrsKernel::default));
    cmd.push_constants(args)?;
    cmd.dispatch(DispatchInfo::groups(BLAS_ADDRS_GROUPS))
}

/// Copy `src` to `dst`. Both modes copy the compacted size; clones of
/// non-compacted builds have the two sizes equal.
#[tracing::instrument(skip(cmd))]
pub fn cmd_copy_acceleration_structure(cmd: &mut CommandBuffer, src: u64, dst: u64, mode: CopyMode) -> Result<()> {
    if !matches!(mode, CopyMode::Clone | CopyMode::Compact) {
        return Err(Error::CommandBuffer(format!("{mode:?} is not a structure-to-structure copy")));
    }
    let device = cmd.device().clone();
    check_buffer(&device, src, HEADER_SIZE as u64)?;
    check_buffer(&device, dst, HEADER_SIZE as u64)?;

    bind_copy(cmd);
    cmd.push_constants(&CopyArgs {
        src_addr: src,
        dst_addr: dst,
        mode: COPY_MODE_COPY,
        reserved: 0,
    })?;
    cmd.dispatch(DispatchInfo::indirect(src + HEADER_COPY_DISPATCH_OFFSET as u64))
}

/// Serialize `src` into the blob at `dst`.
#[tracing::instrument(skip(cmd))]
pub fn cmd_copy_acceleration_structure_to_memory(cmd: &mut CommandBuffer, src: u64, dst: u64) -> Result<()> {
    let device = cmd.device().clone();
    check_buffer(&device, src, HEADER_SIZE as u64)?;
    check_buffer(&device, dst, SERIALIZATION_HEADER_SIZE)?;

    let version = device.config().version_data();
    cmd.update_memory(dst, &version)?;

    let flags = bind_copy(cmd);
    let args = CopyArgs {
        src_addr: src,
        dst_addr: dst,
        mode: COPY_MODE_SERIALIZE,
        reserved: 0,
    };
    cmd.push_constants(&args)?;
    cmd.dispatch(DispatchInfo::indirect(src + HEADER_COPY_DISPATCH_OFFSET as u64))?;

    if flags.contains(BuildFlags::BVH8) {
        record_blas_addrs(cmd, &args)?;
    }
    Ok(())
}

/// Deserialize the blob at `src` into `dst`. The blob's version prefix is
/// checked when recording, so it must already hold its data.
#[tracing::instrument(skip(cmd))]
pub fn cmd_copy_memory_to_acceleration_structure(cmd: &mut CommandBuffer, src: u64, dst: u64) -> Result<()> {
    let device = cmd.device().clone();
    let blob = device.memory().host_read::<SerializationHeader>(src)?;

    let mut version = [0u8; 32];
    version[..16].copy_from_slice(&blob.driver_uuid);
    version[16..].copy_from_slice(&blob.accel_struct_compat);
    if !device_compatibility(&device, &version) {
        tracing::warn!("serialized structure from another driver");
        return Err(Error::IncompatibleVersion);
    }
    check_buffer(&device, src, blob.serialization_size)?;
    check_buffer(&device, dst, blob.compacted_size)?;

    let flags = bind_copy(cmd);
    let args = CopyArgs {
        src_addr: src,
        dst_addr: dst,
        mode: COPY_MODE_DESERIALIZE,
        reserved: 0,
    };
    cmd.push_constants(&args)?;
    cmd.dispatch(DispatchInfo::groups(DESERIALIZE_GROUPS))?;

    if flags.contains(BuildFlags::BVH8) {
        record_blas_addrs(cmd, &args)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GfxLevel};
    use crate::device::{Command, Device};

    fn dispatch_names(cmd: &CommandBuffer) -> Vec<&'static str> {
        cmd.commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { pipeline, .. } => Some(pipeline.name()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_copy_of_raw_header() {
        let device = Device::new(DeviceConfig::for_gfx(GfxLevel::Gfx11)).unwrap();
        let src = device.create_buffer(4096).unwrap();
        let dst = device.create_buffer(4096).unwrap();

        let mut header = AccelStructHeader::default();
        crate::bvh::header::HeaderSizes::new(4096, 0).apply(&mut header);
        device.memory().upload(src.va(), bytemuck::bytes_of(&header)).unwrap();
        let payload: Vec<u8> = (0..4096 - HEADER_SIZE as usize).map(|i| (i * 7) as u8).collect();
        device.memory().upload(src.va() + HEADER_SIZE as u64, &payload).unwrap();

        let mut cmd = CommandBuffer::new(device.clone());
        cmd_copy_acceleration_structure(&mut cmd, src.va(), dst.va(), CopyMode::Clone).unwrap();
        cmd.submit().unwrap();

        let memory = device.memory();
        assert_eq!(memory.download(dst.va(), 4096).unwrap(), memory.download(src.va(), 4096).unwrap());
    }

    #[test]
    fn test_wrong_copy_mode() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let buf = device.create_buffer(256).unwrap();
        let mut cmd = CommandBuffer::new(device.clone());
        assert!(cmd_copy_acceleration_structure(&mut cmd, buf.va(), buf.va(), CopyMode::Serialize).is_err());
    }

    #[test]
    fn test_serialize_records_blas_pass_on_bvh8() {
        let device = Device::new(DeviceConfig::for_gfx(GfxLevel::Gfx12)).unwrap();
        let src = device.create_buffer(1024).unwrap();
        let blob = device.create_buffer(2048).unwrap();

        let mut cmd = CommandBuffer::new(device.clone());
        cmd_copy_acceleration_structure_to_memory(&mut cmd, src.va(), blob.va()).unwrap();
        assert_eq!(dispatch_names(&cmd), [NAME, BLAS_ADDRS_NAME]);

        let device = Device::new(DeviceConfig::for_gfx(GfxLevel::Gfx11)).unwrap();
        let src = device.create_buffer(1024).unwrap();
        let blob = device.create_buffer(2048).unwrap();
        let mut cmd = CommandBuffer::new(device.clone());
        cmd_copy_acceleration_structure_to_memory(&mut cmd, src.va(), blob.va()).unwrap();
        assert_eq!(dispatch_names(&cmd), [NAME]);
    }

    #[test]
    fn test_deserialize_rejects_foreign_blob() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let blob = device.create_buffer(1024).unwrap();
        let dst = device.create_buffer(1024).unwrap();
        device.memory().upload(blob.va(), &[0xabu8; 32]).unwrap();

        let mut cmd = CommandBuffer::new(device.clone());
        let err = cmd_copy_memory_to_acceleration_structure(&mut cmd, blob.va(), dst.va()).unwrap_err();
        assert!(matches!(err, Error::IncompatibleVersion));
        assert!(cmd.commands().is_empty());
    }
}
