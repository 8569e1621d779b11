//! Compute dispatch model.
//!
//! A dispatch runs a [`Kernel`] over a grid of invocations on the device's
//! worker pool. Per-thread kernels get one task per invocation; clustered
//! kernels get one task per cluster and run the cluster's lanes in lockstep
//! inside that task.
//!
//! Ordered dispatches hand out task indices in ascending order from a shared
//! counter. A task that spins on a value published by a lower-indexed task
//! therefore always waits on something that has already started running, so
//! a pool with fewer workers than tasks cannot livelock.

use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use super::Device;

/// Invocations per workgroup for every kernel.
pub const WORKGROUP_SIZE: u32 = 64;
/// Hardware subgroup (wave) size.
pub const SUBGROUP_SIZE: u32 = 64;

/// Dispatch dimensions, `radv_dispatch_info` style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchInfo {
    /// Workgroups, or invocations when `unaligned`
    pub blocks: [u32; 3],
    /// `blocks` counts invocations instead of workgroups
    pub unaligned: bool,
    /// Tasks must start in ascending index order
    pub ordered: bool,
    /// Read `blocks` from device memory at execution time when non-zero
    pub indirect_va: u64,
}

impl DispatchInfo {
    /// Dispatch `x` workgroups.
    pub fn groups(x: u32) -> Self {
        Self {
            blocks: [x, 1, 1],
            ..Default::default()
        }
    }

    /// Dispatch exactly `x` invocations.
    pub fn unaligned(x: u32) -> Self {
        Self {
            blocks: [x, 1, 1],
            unaligned: true,
            ..Default::default()
        }
    }

    /// Dispatch with dimensions read from `va`.
    pub fn indirect(va: u64) -> Self {
        Self {
            indirect_va: va,
            ..Default::default()
        }
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn with_unaligned(mut self) -> Self {
        self.unaligned = true;
        self
    }

    /// Total invocations once `blocks` is known.
    pub fn invocation_count(&self, blocks: [u32; 3]) -> u64 {
        let n = blocks[0] as u64 * blocks[1] as u64 * blocks[2] as u64;
        if self.unaligned {
            n
        } else {
            n * WORKGROUP_SIZE as u64
        }
    }
}

/// Position of one task inside its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    /// Global invocation index of the task's first lane
    pub global_id: u32,
    /// Total invocations in the dispatch
    pub count: u32,
}

/// A compute kernel. Specialization constants live in the implementing type,
/// push constants arrive as raw bytes.
pub trait Kernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Lanes executed together per task.
    fn cluster_size(&self) -> u32 {
        1
    }

    /// Size of the push-constant block the kernel expects.
    fn push_constant_size(&self) -> usize;

    fn execute(&self, device: &Device, push: &[u8], invocation: Invocation);
}

/// Counters for one executed dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub invocations: u64,
    pub tasks: u64,
}

/// Run a dispatch to completion on the device pool.
pub fn run_dispatch(device: &Device, kernel: &dyn Kernel, push: &[u8], info: &DispatchInfo) -> DispatchStats {
    let blocks = if info.indirect_va != 0 {
        device.memory().read::<[u32; 3]>(info.indirect_va)
    } else {
        info.blocks
    };
    let invocations = info.invocation_count(blocks).min(u32::MAX as u64) as u32;
    let cluster = kernel.cluster_size().max(1);
    let tasks = invocations.div_ceil(cluster);

    let _span = tracing::debug_span!(
        "dispatch",
        kernel = kernel.name(),
        invocations,
        tasks,
        ordered = info.ordered
    )
    .entered();

    if tasks == 0 {
        return DispatchStats::default();
    }

    let run_task = |task: u32| {
        kernel.execute(
            device,
            push,
            Invocation {
                global_id: task * cluster,
                count: invocations,
            },
        )
    };

    if info.ordered {
        let next = AtomicU32::new(0);
        device.pool().broadcast(|_| loop {
            let task = next.fetch_add(1, Ordering::Relaxed);
            if task >= tasks {
                break;
            }
            run_task(task);
        });
    } else {
        device.pool().install(|| (0..tasks).into_par_iter().for_each(run_task));
    }

    DispatchStats {
        invocations: invocations as u64,
        tasks: tasks as u64,
    }
}

/// Busy-wait helper for spin loops: spins briefly, then yields the worker.
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub fn new() -> Self {
        Self { step: 0 }
    }

    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug)]
    struct Chain {
        cluster: u32,
    }

    /// Task i waits for task i-1 to publish, the shape of every ordered kernel here.
    impl Kernel for Chain {
        fn name(&self) -> &'static str {
            "chain"
        }

        fn cluster_size(&self) -> u32 {
            self.cluster
        }

        fn push_constant_size(&self) -> usize {
            8
        }

        fn execute(&self, device: &Device, push: &[u8], inv: Invocation) {
            let base = u64::from_le_bytes(push[..8].try_into().unwrap());
            let task = inv.global_id / self.cluster;
            if task > 0 {
                let mut backoff = Backoff::new();
                while device.memory().load_acquire_u32(base + 4 * (task as u64 - 1)) == 0 {
                    backoff.snooze();
                }
            }
            device.memory().store_release_u32(base + 4 * task as u64, task + 1);
        }
    }

    #[test]
    fn test_ordered_chain_with_few_workers() {
        let config = DeviceConfig {
            worker_threads: 2,
            ..Default::default()
        };
        let device = Device::new(config).unwrap();
        let buf = device.memory().allocate(4 * 512).unwrap();
        let push = buf.va().to_le_bytes();

        let stats = run_dispatch(
            &device,
            &Chain { cluster: 8 },
            &push,
            &DispatchInfo::unaligned(512 * 8).ordered(),
        );
        assert_eq!(stats.tasks, 512);
        assert_eq!(device.memory().read_u32(buf.va() + 4 * 511), 512);
    }

    #[derive(Debug)]
    struct Count(AtomicU64);

    impl Kernel for Count {
        fn name(&self) -> &'static str {
            "count"
        }

        fn push_constant_size(&self) -> usize {
            0
        }

        fn execute(&self, _device: &Device, _push: &[u8], inv: Invocation) {
            assert!(inv.global_id < inv.count);
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_grid_sizes() {
        let device = Device::new(DeviceConfig::default()).unwrap();

        let k = Count(AtomicU64::new(0));
        run_dispatch(&device, &k, &[], &DispatchInfo::groups(3));
        assert_eq!(k.0.load(Ordering::Relaxed), 3 * WORKGROUP_SIZE as u64);

        let k = Count(AtomicU64::new(0));
        run_dispatch(&device, &k, &[], &DispatchInfo::unaligned(77));
        assert_eq!(k.0.load(Ordering::Relaxed), 77);

        let buf = device.memory().allocate(12).unwrap();
        device.memory().write(buf.va(), &[5u32, 1, 1]);
        let k = Count(AtomicU64::new(0));
        run_dispatch(&device, &k, &[], &DispatchInfo::indirect(buf.va()).with_unaligned());
        assert_eq!(k.0.load(Ordering::Relaxed), 5);
    }
}
