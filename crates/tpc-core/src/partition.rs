//! Partitions and partition-to-reactor affinity.

use crate::address::Address;

pub type PartitionId = i32;

/// Map a partition to a reactor index.
///
/// Deterministic for a fixed `reactor_count`; the only input is the
/// partition id, so the mapping is stable for the life of the process.
/// `i32::MIN` has no absolute value and maps to 0.
#[inline]
pub fn hash_to_index(partition: PartitionId, reactor_count: usize) -> usize {
    debug_assert!(reactor_count > 0);
    if partition == i32::MIN {
        return 0;
    }
    partition.unsigned_abs() as usize % reactor_count
}

/// Cluster membership collaborator: who owns a partition right now.
///
/// Called from arbitrary caller threads on every invoke, so implementations
/// must not block.
///
/// # Implementors
///
/// - `StaticOwnership` (tpc-engine): in-memory table with a default owner,
///   used by tests and the smoke binary.
pub trait PartitionOwnership: Send + Sync {
    /// `None` when no owner is currently known.
    fn owner_of(&self, partition: PartitionId) -> Option<Address>;
}
