//! Simulated GPU device.
//!
//! - [`memory`] - device address space of atomic dwords
//! - [`dispatch`] - kernels, dispatch grids, ordered execution
//! - [`cluster`] - invocation clusters and subgroup operations
//! - [`cmd`] - command buffers (dispatch, CP writes, fills, copies, barriers)

pub mod cluster;
pub mod cmd;
pub mod dispatch;
pub mod memory;

pub use cluster::{ClusterLanes, InvocationCluster};
pub use cmd::{Command, CommandBuffer, SubmitStats};
pub use dispatch::{Backoff, DispatchInfo, Invocation, Kernel, SUBGROUP_SIZE, WORKGROUP_SIZE};
pub use memory::{Buffer, DeviceMemory};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::util::{Error, Result};

/// A bound compute pipeline: a kernel with its specialization constants.
#[derive(Clone)]
pub struct Pipeline {
    kernel: Arc<dyn Kernel>,
}

impl Pipeline {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self { kernel }
    }

    #[inline]
    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.kernel.name()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({:?})", self.kernel)
    }
}

/// Cache key: kernel name plus specialization flags.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub struct PipelineKey {
    pub name: &'static str,
    pub flags: u32,
}

/// Thread-safe pipeline cache.
pub struct PipelineCache {
    pipelines: RwLock<HashMap<PipelineKey, Pipeline>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Look up a pipeline, creating it on first use.
    pub fn get_or_create(&self, key: PipelineKey, create: impl FnOnce() -> Arc<dyn Kernel>) -> Pipeline {
        if let Some(p) = self.pipelines.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return p.clone();
        }
        let mut pipelines = self.pipelines.write();
        // Another thread may have won the race between the two locks
        if let Some(p) = pipelines.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return p.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(name = key.name, flags = format_args!("{:#x}", key.flags), "creating pipeline");
        let pipeline = Pipeline::new(create());
        pipelines.insert(key, pipeline.clone());
        pipeline
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The simulated device: configuration, address space, worker pool and
/// pipeline cache.
pub struct Device {
    config: DeviceConfig,
    memory: DeviceMemory,
    pool: rayon::ThreadPool,
    pipelines: PipelineCache,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("radv-bvh-{i}"))
            .build()
            .map_err(|e| Error::other(format!("failed to create worker pool: {e}")))?;

        tracing::info!(
            gfx_level = config.gfx_level.name(),
            workers = pool.current_num_threads(),
            "device created"
        );

        Ok(Arc::new(Self {
            config,
            memory: DeviceMemory::new(),
            pool,
            pipelines: PipelineCache::new(),
        }))
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    #[inline]
    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    #[inline]
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Allocate a zero-filled device buffer.
    pub fn create_buffer(&self, size: u64) -> Result<Arc<Buffer>> {
        self.memory.allocate(size)
    }

    /// Release a buffer by base address.
    pub fn destroy_buffer(&self, va: u64) -> Result<()> {
        self.memory.free(va)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("gfx_level", &self.config.gfx_level)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Nop;

    impl Kernel for Nop {
        fn name(&self) -> &'static str {
            "nop"
        }

        fn push_constant_size(&self) -> usize {
            0
        }

        fn execute(&self, _device: &Device, _push: &[u8], _invocation: Invocation) {}
    }

    #[test]
    fn test_pipeline_cache() {
        let cache = PipelineCache::new();
        let key = PipelineKey { name: "nop", flags: 1 };
        let a = cache.get_or_create(key, || Arc::new(Nop));
        let b = cache.get_or_create(key, || panic!("cached pipeline must be reused"));
        assert_eq!(a.name(), b.name());
        cache.get_or_create(PipelineKey { name: "nop", flags: 2 }, || Arc::new(Nop));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats(), (1, 2));
    }
}
