//! Simulated device memory.
//!
//! Every allocation is a run of `AtomicU32` words mapped at a device virtual
//! address. Kernels address memory only through VAs. Plain loads and stores
//! are relaxed; visibility between invocations comes from explicit fences
//! and the read-modify-write atomics, as on the GPU.
//!
//! Kernel-side accesses never fail: an access outside any allocation reads
//! as zero, drops the write and bumps the fault counter, like a GPU running
//! with page-fault retries disabled. Host-side accessors return errors.

use bytemuck::Pod;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::util::{align_u64, Error, Result};

/// First VA handed out. Keeps 0 (the null address) unmapped.
pub const VA_BASE: u64 = 0x0000_0001_0000_0000;
/// Top of the 48-bit canonical address space usable for allocations.
pub const VA_LIMIT: u64 = 1 << 47;
/// Allocation alignment.
pub const VA_ALIGN: u64 = 256;
/// Unmapped gap between allocations so overruns fault.
pub const VA_GUARD: u64 = 4096;

/// One device allocation.
pub struct Buffer {
    va: u64,
    size: u64,
    words: Box<[AtomicU32]>,
}

impl Buffer {
    fn new(va: u64, size: u64) -> Self {
        let word_count = size.div_ceil(4) as usize;
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        Self { va, size, words }
    }

    #[inline]
    pub fn va(&self) -> u64 {
        self.va
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True if `[va, va+len)` lies inside this allocation.
    #[inline]
    pub fn contains(&self, va: u64, len: u64) -> bool {
        va >= self.va && va.saturating_add(len) <= self.va + self.size
    }

    #[inline]
    fn word(&self, offset: u64) -> &AtomicU32 {
        &self.words[(offset / 4) as usize]
    }

    /// Copy bytes starting at byte `offset` into `out`.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        let mut pos = 0usize;
        while pos < out.len() {
            let at = offset + pos as u64;
            let shift = (at % 4) as usize;
            let bytes = self.word(at).load(Ordering::Relaxed).to_le_bytes();
            let n = (4 - shift).min(out.len() - pos);
            out[pos..pos + n].copy_from_slice(&bytes[shift..shift + n]);
            pos += n;
        }
    }

    /// Store `data` at byte `offset`. Partial words are merged atomically so
    /// neighbouring bytes written by other invocations are preserved.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let mut pos = 0usize;
        while pos < data.len() {
            let at = offset + pos as u64;
            let shift = (at % 4) as usize;
            let n = (4 - shift).min(data.len() - pos);
            let word = self.word(at);
            if n == 4 {
                let v = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
                word.store(v, Ordering::Relaxed);
            } else {
                let mut mask_bytes = [0u8; 4];
                let mut value_bytes = [0u8; 4];
                mask_bytes[shift..shift + n].fill(0xff);
                value_bytes[shift..shift + n].copy_from_slice(&data[pos..pos + n]);
                let mask = u32::from_le_bytes(mask_bytes);
                let value = u32::from_le_bytes(value_bytes);
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                    Some((old & !mask) | value)
                });
            }
            pos += n;
        }
    }

    /// Fill `size` bytes at `offset` with a repeated dword pattern.
    pub fn fill(&self, offset: u64, size: u64, pattern: u32) {
        let bytes = pattern.to_le_bytes();
        let mut chunk: SmallVec<[u8; 256]> = SmallVec::new();
        for i in 0..size.min(256) {
            chunk.push(bytes[((offset + i) % 4) as usize]);
        }
        let mut pos = 0u64;
        while pos < size {
            let n = (size - pos).min(chunk.len() as u64);
            // chunk length is a multiple of 4 except for the tail, so the pattern phase holds
            self.write_bytes(offset + pos, &chunk[..n as usize]);
            pos += n;
        }
    }

    #[inline]
    pub fn load_u32(&self, offset: u64, order: Ordering) -> u32 {
        debug_assert!(offset % 4 == 0);
        self.word(offset).load(order)
    }

    #[inline]
    pub fn store_u32(&self, offset: u64, value: u32, order: Ordering) {
        debug_assert!(offset % 4 == 0);
        self.word(offset).store(value, order)
    }

    #[inline]
    pub fn fetch_add_u32(&self, offset: u64, value: u32) -> u32 {
        debug_assert!(offset % 4 == 0);
        self.word(offset).fetch_add(value, Ordering::AcqRel)
    }

    #[inline]
    pub fn fetch_max_u32(&self, offset: u64, value: u32) -> u32 {
        debug_assert!(offset % 4 == 0);
        self.word(offset).fetch_max(value, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("va", &format_args!("{:#x}", self.va))
            .field("size", &self.size)
            .finish()
    }
}

/// Device address space: all live allocations keyed by base VA.
pub struct DeviceMemory {
    buffers: RwLock<BTreeMap<u64, Arc<Buffer>>>,
    next_va: AtomicU64,
    faults: AtomicU64,
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(BTreeMap::new()),
            next_va: AtomicU64::new(VA_BASE),
            faults: AtomicU64::new(0),
        }
    }

    /// Allocate a zero-filled buffer.
    pub fn allocate(&self, size: u64) -> Result<Arc<Buffer>> {
        let size = size.max(4);
        let span = align_u64(size, VA_ALIGN) + VA_GUARD;
        let va = self.next_va.fetch_add(span, Ordering::Relaxed);
        if va + span > VA_LIMIT {
            return Err(Error::OutOfDeviceMemory(size));
        }
        let buffer = Arc::new(Buffer::new(va, size));
        self.buffers.write().insert(va, Arc::clone(&buffer));
        tracing::trace!(va = format_args!("{va:#x}"), size, "allocated device buffer");
        Ok(buffer)
    }

    /// Unmap the allocation starting at `va`.
    pub fn free(&self, va: u64) -> Result<()> {
        self.buffers
            .write()
            .remove(&va)
            .map(|_| ())
            .ok_or(Error::InvalidAddress(va))
    }

    /// Find the allocation holding `[va, va+len)`.
    pub fn resolve(&self, va: u64, len: u64) -> Option<(Arc<Buffer>, u64)> {
        let buffers = self.buffers.read();
        let (_, buffer) = buffers.range(..=va).next_back()?;
        if buffer.contains(va, len) {
            Some((Arc::clone(buffer), va - buffer.va()))
        } else {
            None
        }
    }

    /// Like [`resolve`](Self::resolve) but reporting a host error.
    pub fn resolve_checked(&self, va: u64, len: u64) -> Result<(Arc<Buffer>, u64)> {
        if let Some(found) = self.resolve(va, len) {
            return Ok(found);
        }
        let buffers = self.buffers.read();
        match buffers.range(..=va).next_back() {
            Some((_, b)) if va < b.va() + b.size() => Err(Error::OutOfBounds {
                offset: va - b.va(),
                len,
                size: b.size(),
            }),
            _ => Err(Error::InvalidAddress(va)),
        }
    }

    /// Number of faulting kernel accesses so far.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    fn fault(&self, va: u64, len: u64, write: bool) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(va = format_args!("{va:#x}"), len, write, "device memory fault");
    }

    // Kernel-side accessors

    /// Read a POD value, or `None` if the range is unmapped.
    pub fn try_read<T: Pod>(&self, va: u64) -> Option<T> {
        let (buffer, offset) = self.resolve(va, std::mem::size_of::<T>() as u64)?;
        let mut value = T::zeroed();
        buffer.read_bytes(offset, bytemuck::bytes_of_mut(&mut value));
        Some(value)
    }

    /// Read a POD value. Faulting reads return zeroes.
    pub fn read<T: Pod>(&self, va: u64) -> T {
        self.try_read(va).unwrap_or_else(|| {
            self.fault(va, std::mem::size_of::<T>() as u64, false);
            T::zeroed()
        })
    }

    /// Write a POD value. Faulting writes are dropped.
    pub fn write<T: Pod>(&self, va: u64, value: &T) {
        self.write_bytes(va, bytemuck::bytes_of(value));
    }

    /// Copy bytes out of device memory. Returns false on a fault.
    pub fn read_bytes(&self, va: u64, out: &mut [u8]) -> bool {
        match self.resolve(va, out.len() as u64) {
            Some((buffer, offset)) => {
                buffer.read_bytes(offset, out);
                true
            }
            None => {
                out.fill(0);
                self.fault(va, out.len() as u64, false);
                false
            }
        }
    }

    pub fn write_bytes(&self, va: u64, data: &[u8]) {
        match self.resolve(va, data.len() as u64) {
            Some((buffer, offset)) => buffer.write_bytes(offset, data),
            None => self.fault(va, data.len() as u64, true),
        }
    }

    #[inline]
    pub fn read_u32(&self, va: u64) -> u32 {
        self.read::<u32>(va)
    }

    #[inline]
    pub fn write_u32(&self, va: u64, value: u32) {
        self.write(va, &value)
    }

    /// Acquire load of an aligned dword.
    pub fn load_acquire_u32(&self, va: u64) -> u32 {
        match self.resolve(va, 4) {
            Some((buffer, offset)) => buffer.load_u32(offset, Ordering::Acquire),
            None => {
                self.fault(va, 4, false);
                0
            }
        }
    }

    /// Release store of an aligned dword.
    pub fn store_release_u32(&self, va: u64, value: u32) {
        match self.resolve(va, 4) {
            Some((buffer, offset)) => buffer.store_u32(offset, value, Ordering::Release),
            None => self.fault(va, 4, true),
        }
    }

    /// `atomicAdd`, returns the previous value.
    pub fn atomic_add_u32(&self, va: u64, value: u32) -> u32 {
        match self.resolve(va, 4) {
            Some((buffer, offset)) => buffer.fetch_add_u32(offset, value),
            None => {
                self.fault(va, 4, true);
                0
            }
        }
    }

    /// `atomicMax`, returns the previous value.
    pub fn atomic_max_u32(&self, va: u64, value: u32) -> u32 {
        match self.resolve(va, 4) {
            Some((buffer, offset)) => buffer.fetch_max_u32(offset, value),
            None => {
                self.fault(va, 4, true);
                0
            }
        }
    }

    /// Fill with a dword pattern (kernel/queue side).
    pub fn fill(&self, va: u64, size: u64, pattern: u32) {
        match self.resolve(va, size) {
            Some((buffer, offset)) => buffer.fill(offset, size, pattern),
            None => self.fault(va, size, true),
        }
    }

    /// Copy between (possibly different) allocations.
    pub fn copy(&self, src: u64, dst: u64, size: u64) {
        let mut chunk = [0u8; 256];
        let mut pos = 0u64;
        while pos < size {
            let n = (size - pos).min(chunk.len() as u64) as usize;
            self.read_bytes(src + pos, &mut chunk[..n]);
            self.write_bytes(dst + pos, &chunk[..n]);
            pos += n as u64;
        }
    }

    // Host-side accessors

    /// Host upload (mapped-memory write).
    pub fn upload(&self, va: u64, data: &[u8]) -> Result<()> {
        let (buffer, offset) = self.resolve_checked(va, data.len() as u64)?;
        buffer.write_bytes(offset, data);
        Ok(())
    }

    /// Host readback.
    pub fn download(&self, va: u64, len: u64) -> Result<Vec<u8>> {
        let (buffer, offset) = self.resolve_checked(va, len)?;
        let mut out = vec![0u8; len as usize];
        buffer.read_bytes(offset, &mut out);
        Ok(out)
    }

    /// Host read of a POD value.
    pub fn host_read<T: Pod>(&self, va: u64) -> Result<T> {
        let (buffer, offset) = self.resolve_checked(va, std::mem::size_of::<T>() as u64)?;
        let mut value = T::zeroed();
        buffer.read_bytes(offset, bytemuck::bytes_of_mut(&mut value));
        Ok(value)
    }
}
