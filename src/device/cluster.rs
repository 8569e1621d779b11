//! Invocation clusters.
//!
//! A cluster is `cluster_size` consecutive lanes of a 64-lane subgroup that
//! cooperate on one node, one lane per child slot. Lanes of a cluster run in
//! lockstep, so a kernel holds per-lane state as `[T; N]` and the subgroup
//! operations below combine those arrays exactly like the hardware ballot,
//! broadcast and clustered reductions do.

use super::dispatch::SUBGROUP_SIZE;

/// The three values a lane captures when it joins a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationCluster {
    /// Lane index inside the cluster (0..cluster_size)
    pub invocation_index: u32,
    /// Cluster index inside the subgroup
    pub cluster_index: u32,
    pub cluster_size: u32,
}

impl InvocationCluster {
    /// Cluster membership of subgroup lane `subgroup_invocation`.
    #[inline]
    pub fn new(subgroup_invocation: u32, cluster_size: u32) -> Self {
        debug_assert!(cluster_size.is_power_of_two() && cluster_size < 32);
        Self {
            invocation_index: subgroup_invocation % cluster_size,
            cluster_index: subgroup_invocation / cluster_size,
            cluster_size,
        }
    }

    /// Restrict a subgroup-wide ballot to this cluster's lanes.
    #[inline]
    pub fn ballot(&self, subgroup_ballot: u64) -> u32 {
        let mask = (1u64 << self.cluster_size) - 1;
        ((subgroup_ballot >> (self.cluster_index * self.cluster_size)) & mask) as u32
    }
}

/// The lanes of one cluster, placed at their position in the subgroup.
#[derive(Debug, Clone, Copy)]
pub struct ClusterLanes<const N: usize> {
    pub lanes: [InvocationCluster; N],
    /// Subgroup lane of lane 0
    first_lane: u32,
}

impl<const N: usize> ClusterLanes<N> {
    /// Lanes of the cluster whose first invocation is `global_id`.
    pub fn new(global_id: u32) -> Self {
        let first_lane = global_id % SUBGROUP_SIZE;
        let lanes = std::array::from_fn(|i| InvocationCluster::new(first_lane + i as u32, N as u32));
        Self { lanes, first_lane }
    }

    /// `subgroupBallot` over this cluster's predicates, then the
    /// cluster-restricted view of it.
    pub fn ballot(&self, predicate: &[bool; N]) -> u32 {
        let mut subgroup = 0u64;
        for (i, &p) in predicate.iter().enumerate() {
            if p {
                subgroup |= 1u64 << (self.first_lane + i as u32);
            }
        }
        self.lanes[0].ballot(subgroup)
    }

    /// Mask with every lane of the cluster set.
    #[inline]
    pub const fn full_mask() -> u32 {
        ((1u64 << N) - 1) as u32
    }
}

/// Broadcast lane `lane`'s value to the whole cluster.
#[inline]
pub fn read_invocation<T: Copy, const N: usize>(values: &[T; N], lane: u32) -> T {
    values[lane as usize]
}

/// `subgroupClusteredMin` over a float lane value.
pub fn clustered_min<const N: usize>(values: &[f32; N]) -> f32 {
    values.iter().copied().fold(f32::INFINITY, f32::min)
}

/// `subgroupClusteredMax` over a float lane value.
pub fn clustered_max<const N: usize>(values: &[f32; N]) -> f32 {
    values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

/// Exclusive prefix count of set predicates below each lane
/// (`bitCount(ballot & ((1 << lane) - 1))`).
pub fn exclusive_prefix_count(mask: u32, lane: u32) -> u32 {
    (mask & ((1u32 << lane) - 1)).count_ones()
}
