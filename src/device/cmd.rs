//! Command buffers.
//!
//! Commands are recorded against a device and executed in order by
//! [`CommandBuffer::submit`]. Recording validates every host-supplied
//! address, so a bad request fails before any command has run.
//!
//! Small host payloads go inline through the command processor
//! ([`Command::WriteData`]); larger ones are uploaded into a staging buffer
//! at record time and copied on the queue.

use bytemuck::Pod;
use std::sync::Arc;

use super::dispatch::{run_dispatch, DispatchInfo};
use super::{Buffer, Device, Pipeline};
use crate::util::{Error, Result};

/// One recorded command.
#[derive(Debug, Clone)]
pub enum Command {
    Dispatch {
        pipeline: Pipeline,
        push: Vec<u8>,
        info: DispatchInfo,
    },
    /// Command-processor memory write
    WriteData { va: u64, data: Vec<u8> },
    Fill { va: u64, size: u64, pattern: u32 },
    Copy { src: u64, dst: u64, size: u64 },
    /// Compute-write to compute/indirect-read barrier
    Barrier { reason: &'static str },
}

/// Counters gathered while executing a command buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitStats {
    pub dispatches: u32,
    pub invocations: u64,
    pub cp_writes: u32,
    pub fills: u32,
    pub copies: u32,
    pub barriers: u32,
}

/// A recorded command stream.
pub struct CommandBuffer {
    device: Arc<Device>,
    commands: Vec<Command>,
    pipeline: Option<Pipeline>,
    push: Vec<u8>,
    staging: Vec<Arc<Buffer>>,
}

impl CommandBuffer {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            commands: Vec::new(),
            pipeline: None,
            push: Vec::new(),
            staging: Vec::new(),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Recorded commands so far.
    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn bind_pipeline(&mut self, pipeline: Pipeline) {
        self.pipeline = Some(pipeline);
        self.push.clear();
    }

    pub fn push_constants<T: Pod>(&mut self, value: &T) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| Error::CommandBuffer("push constants without a bound pipeline".into()))?;
        let bytes = bytemuck::bytes_of(value);
        let expected = pipeline.kernel().push_constant_size();
        if bytes.len() != expected {
            return Err(Error::CommandBuffer(format!(
                "{} expects {} push-constant bytes, got {}",
                pipeline.name(),
                expected,
                bytes.len()
            )));
        }
        self.push = bytes.to_vec();
        Ok(())
    }

    pub fn dispatch(&mut self, info: DispatchInfo) -> Result<()> {
        let pipeline = self
            .pipeline
            .clone()
            .ok_or_else(|| Error::CommandBuffer("dispatch without a bound pipeline".into()))?;
        if self.push.len() != pipeline.kernel().push_constant_size() {
            return Err(Error::CommandBuffer(format!("{} dispatched without push constants", pipeline.name())));
        }
        if info.indirect_va != 0 {
            self.device.memory().resolve_checked(info.indirect_va, 12)?;
        }
        self.commands.push(Command::Dispatch {
            pipeline,
            push: self.push.clone(),
            info,
        });
        Ok(())
    }

    /// Command-processor write. Payload must be dword sized and fit the
    /// configured inline limit.
    pub fn write_cp(&mut self, va: u64, data: &[u8]) -> Result<()> {
        let limit = self.device.config().cp_write_threshold as usize;
        if data.len() % 4 != 0 || va % 4 != 0 {
            return Err(Error::CommandBuffer(format!("unaligned CP write of {} bytes at {va:#x}", data.len())));
        }
        if data.len() > limit {
            return Err(Error::CommandBuffer(format!("CP write of {} bytes exceeds {limit}", data.len())));
        }
        self.device.memory().resolve_checked(va, data.len() as u64)?;
        self.commands.push(Command::WriteData { va, data: data.to_vec() });
        Ok(())
    }

    pub fn fill(&mut self, va: u64, size: u64, pattern: u32) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.device.memory().resolve_checked(va, size)?;
        self.commands.push(Command::Fill { va, size, pattern });
        Ok(())
    }

    pub fn copy(&mut self, src: u64, dst: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.device.memory().resolve_checked(src, size)?;
        self.device.memory().resolve_checked(dst, size)?;
        self.commands.push(Command::Copy { src, dst, size });
        Ok(())
    }

    /// Write host data into device memory: inline when small and dword
    /// aligned, otherwise through a staging buffer and a queue copy.
    pub fn update_memory(&mut self, va: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let threshold = self.device.config().cp_write_threshold as usize;
        if data.len() <= threshold && data.len() % 4 == 0 && va % 4 == 0 {
            return self.write_cp(va, data);
        }
        let staging = self.device.create_buffer(data.len() as u64)?;
        self.device.memory().upload(staging.va(), data)?;
        tracing::trace!(size = data.len(), "staging upload");
        let src = staging.va();
        self.staging.push(staging);
        self.copy(src, va, data.len() as u64)
    }

    pub fn barrier(&mut self, reason: &'static str) {
        self.commands.push(Command::Barrier { reason });
    }

    /// Execute all commands in order, then release staging memory.
    pub fn submit(self) -> Result<SubmitStats> {
        let _span = tracing::debug_span!("submit", commands = self.commands.len()).entered();
        let memory = self.device.memory();
        let mut stats = SubmitStats::default();

        for command in &self.commands {
            match command {
                Command::Dispatch { pipeline, push, info } => {
                    let d = run_dispatch(&self.device, pipeline.kernel(), push, info);
                    stats.dispatches += 1;
                    stats.invocations += d.invocations;
                }
                Command::WriteData { va, data } => {
                    memory.write_bytes(*va, data);
                    stats.cp_writes += 1;
                }
                Command::Fill { va, size, pattern } => {
                    memory.fill(*va, *size, *pattern);
                    stats.fills += 1;
                }
                Command::Copy { src, dst, size } => {
                    memory.copy(*src, *dst, *size);
                    stats.copies += 1;
                }
                Command::Barrier { reason } => {
                    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
                    tracing::trace!(reason, "barrier");
                    stats.barriers += 1;
                }
            }
        }

        for staging in &self.staging {
            memory.free(staging.va())?;
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("commands", &self.commands.len())
            .field("staging", &self.staging.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    fn device(threshold: u32) -> Arc<Device> {
        Device::new(DeviceConfig {
            cp_write_threshold: threshold,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_update_memory_paths() {
        let device = device(64);
        let buf = device.create_buffer(1024).unwrap();

        let small = [7u8; 64];
        let large: Vec<u8> = (0..200u32).map(|i| i as u8).collect();

        let mut cmd = CommandBuffer::new(device.clone());
        cmd.update_memory(buf.va(), &small).unwrap();
        cmd.update_memory(buf.va() + 256, &large).unwrap();
        assert!(matches!(cmd.commands()[0], Command::WriteData { .. }));
        assert!(matches!(cmd.commands()[1], Command::Copy { .. }));

        let stats = cmd.submit().unwrap();
        assert_eq!(stats.cp_writes, 1);
        assert_eq!(stats.copies, 1);

        let mem = device.memory();
        assert_eq!(mem.download(buf.va(), 64).unwrap(), small.to_vec());
        assert_eq!(mem.download(buf.va() + 256, 200).unwrap(), large);
    }

    #[test]
    fn test_record_errors() {
        let device = device(64);
        let buf = device.create_buffer(16).unwrap();
        let mut cmd = CommandBuffer::new(device.clone());

        assert!(matches!(cmd.dispatch(DispatchInfo::groups(1)), Err(Error::CommandBuffer(_))));
        assert!(matches!(cmd.push_constants(&0u32), Err(Error::CommandBuffer(_))));
        assert!(cmd.write_cp(buf.va(), &[0u8; 128]).is_err());
        assert!(cmd.write_cp(buf.va() + 2, &[0u8; 4]).is_err());
        assert!(matches!(cmd.fill(buf.va(), 32, 0), Err(Error::OutOfBounds { .. })));
        assert!(matches!(cmd.copy(0x40, buf.va(), 4), Err(Error::InvalidAddress(0x40))));
        assert!(cmd.commands().is_empty());
    }
}
