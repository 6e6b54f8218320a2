//! Local partition storage contract used by the demander.
//!
//! The demander never touches storage internals. It reserves and locks a
//! partition for the duration of a page, writes entries with a conditional
//! insert, and finally moves the partition to the owning state.
//!
//! ```text
//!   Moving ──own_partition──▶ Owning ──▶ Renting ──▶ Evicted
//!     │
//!     └── topology change ──▶ Invalid
//! ```

mod memory;

pub use memory::MemoryPartitionStore;

use crate::error::StorageError;
use crate::rebalancing::messages::EntryInfo;
use crate::types::{EntryVersion, PartitionId, TopologyVersion};

/// Local state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    /// Being filled by rebalancing.
    Moving,
    /// Fully loaded and serving.
    Owning,
    /// Handed off, waiting to be evicted.
    Renting,
    /// Removed locally.
    Evicted,
    /// No longer assigned to this node at the given topology.
    Invalid,
}

impl PartitionState {
    /// Whether entries can still be written into the partition.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, PartitionState::Moving | PartitionState::Owning)
    }
}

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was written for the first time.
    Inserted,
    /// An equal or newer version is already stored.
    AlreadyNewer,
    /// The partition became invalid; stop applying it.
    PartitionInvalid,
    /// The slot was removed concurrently; the entry is ignored.
    Removed,
}

/// Storage primitives consumed by the demander.
pub trait PartitionStore: Send + Sync + 'static {
    /// State of `partition` as seen at `topology`.
    fn partition_state(&self, partition: PartitionId, topology: TopologyVersion) -> PartitionState;

    /// Pin the partition so it cannot be evicted. Returns `false` if it is
    /// already gone.
    fn reserve_partition(&self, partition: PartitionId) -> bool;

    /// Drop a reservation taken with [`reserve_partition`](Self::reserve_partition).
    fn release_partition(&self, partition: PartitionId);

    /// Take the partition's write lock if it is free. Never blocks; callers
    /// on an async runtime retry after yielding.
    fn try_lock_partition(&self, partition: PartitionId) -> bool;

    fn unlock_partition(&self, partition: PartitionId);

    /// Move a `Moving` partition to `Owning`. Returns `false` if the state
    /// did not allow it.
    fn own_partition(&self, partition: PartitionId) -> bool;

    /// Whether `key` at `version` may be preloaded. Entries evicted locally
    /// at a newer version must not come back through rebalancing.
    fn preloading_permitted(&self, partition: PartitionId, key: &[u8], version: EntryVersion)
        -> bool;

    /// Insert `entry` unless an equal or newer version is already stored.
    fn conditional_insert(
        &self,
        partition: PartitionId,
        entry: &EntryInfo,
        topology: TopologyVersion,
    ) -> Result<InsertOutcome, StorageError>;

    /// Register a freshly inserted key with the eviction policy.
    fn track_eviction(&self, partition: PartitionId, key: &[u8], topology: TopologyVersion);

    /// Remove the slot for `key` if it holds no value. Used after a write was
    /// refused for capacity reasons.
    fn discard_if_empty(&self, partition: PartitionId, key: &[u8]) -> bool;
}
