//! In-memory partition store.

use super::{InsertOutcome, PartitionState, PartitionStore};
use crate::error::StorageError;
use crate::rebalancing::messages::EntryInfo;
use crate::types::{EntryVersion, PartitionId, TopologyVersion};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Slot {
    value: Option<Bytes>,
    version: EntryVersion,
    expire_time: Option<u64>,
    obsolete: bool,
}

#[derive(Debug)]
struct PartitionData {
    state: RwLock<PartitionState>,
    reservations: AtomicUsize,
    locked: Mutex<bool>,
    slots: RwLock<HashMap<Bytes, Slot>>,
    tracked: Mutex<HashSet<Bytes>>,
}

impl PartitionData {
    fn new(state: PartitionState) -> Self {
        Self {
            state: RwLock::new(state),
            reservations: AtomicUsize::new(0),
            locked: Mutex::new(false),
            slots: RwLock::new(HashMap::new()),
            tracked: Mutex::new(HashSet::new()),
        }
    }
}

/// Partition store backed by hash maps, one per partition.
///
/// Used by the test cluster and as the reference for the storage contract.
#[derive(Debug, Default)]
pub struct MemoryPartitionStore {
    partitions: DashMap<PartitionId, Arc<PartitionData>>,
    evictions: DashMap<(PartitionId, Bytes), EntryVersion>,
    capacity: Option<usize>,
    len: AtomicUsize,
}

impl MemoryPartitionStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that refuses new keys beyond `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Create (or reset the state of) a partition.
    pub fn create_partition(&self, partition: PartitionId, state: PartitionState) {
        match self.partitions.get(&partition) {
            Some(data) => *data.state.write() = state,
            None => {
                self.partitions
                    .insert(partition, Arc::new(PartitionData::new(state)));
            }
        }
    }

    /// Create several partitions in the same state.
    pub fn create_partitions(
        &self,
        partitions: impl IntoIterator<Item = PartitionId>,
        state: PartitionState,
    ) {
        for partition in partitions {
            self.create_partition(partition, state);
        }
    }

    /// Force the state of an existing partition.
    pub fn set_state(&self, partition: PartitionId, state: PartitionState) {
        if let Some(data) = self.partitions.get(&partition) {
            *data.state.write() = state;
        }
    }

    /// Current state, ignoring topology.
    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.partitions.get(&partition).map(|d| *d.state.read())
    }

    /// Partitions currently in `state`.
    pub fn partitions_in(&self, state: PartitionState) -> BTreeSet<PartitionId> {
        self.partitions
            .iter()
            .filter(|e| *e.value().state.read() == state)
            .map(|e| *e.key())
            .collect()
    }

    /// Write a value directly, bypassing the conditional insert.
    pub fn put(&self, partition: PartitionId, entry: &EntryInfo) {
        let Some(data) = self.partition(partition) else {
            return;
        };
        let previous = data.slots.write().insert(
            entry.key.clone(),
            Slot {
                value: Some(entry.value.clone()),
                version: entry.version,
                expire_time: entry.expire_time,
                obsolete: false,
            },
        );
        if !matches!(previous, Some(Slot { value: Some(_), .. })) {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stored value and version for `key`.
    pub fn get(&self, partition: PartitionId, key: &[u8]) -> Option<(Bytes, EntryVersion)> {
        let data = self.partition(partition)?;
        let slots = data.slots.read();
        let slot = slots.get(key)?;
        slot.value.clone().map(|v| (v, slot.version))
    }

    /// Live entries of a partition, sorted by key.
    pub fn entries(&self, partition: PartitionId) -> Vec<EntryInfo> {
        let Some(data) = self.partition(partition) else {
            return Vec::new();
        };
        let sorted: BTreeMap<Bytes, Slot> = data
            .slots
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        sorted
            .into_iter()
            .filter_map(|(key, slot)| {
                let value = slot.value?;
                let mut entry = EntryInfo::new(key, value, slot.version);
                entry.expire_time = slot.expire_time;
                Some(entry)
            })
            .collect()
    }

    /// Whether a slot exists for `key`, with or without a value.
    pub fn has_slot(&self, partition: PartitionId, key: &[u8]) -> bool {
        self.partition(partition)
            .map_or(false, |d| d.slots.read().contains_key(key))
    }

    /// Evict `key` locally, remembering the version it was evicted at.
    pub fn evict(&self, partition: PartitionId, key: &[u8]) {
        let Some(data) = self.partition(partition) else {
            return;
        };
        let removed = data.slots.write().remove(key);
        if let Some(slot) = removed {
            if slot.value.is_some() {
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
            self.evictions
                .insert((partition, Bytes::copy_from_slice(key)), slot.version);
        }
    }

    /// Mark the slot for `key` as concurrently removed.
    pub fn mark_obsolete(&self, partition: PartitionId, key: &[u8]) {
        let Some(data) = self.partition(partition) else {
            return;
        };
        let mut slots = data.slots.write();
        let slot = slots.entry(Bytes::copy_from_slice(key)).or_insert(Slot {
            value: None,
            version: EntryVersion::default(),
            expire_time: None,
            obsolete: false,
        });
        slot.obsolete = true;
    }

    /// Keys registered with the eviction policy.
    pub fn tracked_keys(&self, partition: PartitionId) -> usize {
        self.partition(partition)
            .map_or(0, |d| d.tracked.lock().len())
    }

    /// Outstanding reservations on a partition.
    pub fn reservations(&self, partition: PartitionId) -> usize {
        self.partition(partition)
            .map_or(0, |d| d.reservations.load(Ordering::SeqCst))
    }

    /// Whether the partition is locked right now.
    pub fn is_locked(&self, partition: PartitionId) -> bool {
        self.partition(partition).map_or(false, |d| *d.locked.lock())
    }

    /// Number of stored values across partitions.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition(&self, partition: PartitionId) -> Option<Arc<PartitionData>> {
        self.partitions.get(&partition).map(|d| d.value().clone())
    }
}

impl PartitionStore for MemoryPartitionStore {
    fn partition_state(&self, partition: PartitionId, _topology: TopologyVersion) -> PartitionState {
        self.state(partition).unwrap_or(PartitionState::Invalid)
    }

    fn reserve_partition(&self, partition: PartitionId) -> bool {
        let Some(data) = self.partition(partition) else {
            return false;
        };
        // Hold the state lock so eviction cannot slip in between check and pin.
        let state = data.state.read();
        if *state == PartitionState::Evicted {
            return false;
        }
        data.reservations.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn release_partition(&self, partition: PartitionId) {
        if let Some(data) = self.partition(partition) {
            let _ = data
                .reservations
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    fn try_lock_partition(&self, partition: PartitionId) -> bool {
        // Nothing to lock.
        let Some(data) = self.partition(partition) else {
            return true;
        };
        let mut locked = data.locked.lock();
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    fn unlock_partition(&self, partition: PartitionId) {
        if let Some(data) = self.partition(partition) {
            *data.locked.lock() = false;
        }
    }

    fn own_partition(&self, partition: PartitionId) -> bool {
        let Some(data) = self.partition(partition) else {
            return false;
        };
        let mut state = data.state.write();
        if *state != PartitionState::Moving {
            return false;
        }
        *state = PartitionState::Owning;
        true
    }

    fn preloading_permitted(
        &self,
        partition: PartitionId,
        key: &[u8],
        version: EntryVersion,
    ) -> bool {
        match self.evictions.get(&(partition, Bytes::copy_from_slice(key))) {
            Some(evicted_at) => version > *evicted_at,
            None => true,
        }
    }

    fn conditional_insert(
        &self,
        partition: PartitionId,
        entry: &EntryInfo,
        _topology: TopologyVersion,
    ) -> Result<InsertOutcome, StorageError> {
        let data = self
            .partition(partition)
            .ok_or(StorageError::PartitionNotFound(partition))?;

        if !data.state.read().accepts_writes() {
            return Ok(InsertOutcome::PartitionInvalid);
        }

        let mut slots = data.slots.write();
        let slot = slots.entry(entry.key.clone()).or_insert(Slot {
            value: None,
            version: EntryVersion::default(),
            expire_time: None,
            obsolete: false,
        });

        if slot.obsolete {
            return Ok(InsertOutcome::Removed);
        }
        if slot.value.is_some() {
            if slot.version >= entry.version {
                return Ok(InsertOutcome::AlreadyNewer);
            }
            slot.value = Some(entry.value.clone());
            slot.version = entry.version;
            slot.expire_time = entry.expire_time;
            return Ok(InsertOutcome::Inserted);
        }

        // New key: the empty slot stays behind when capacity refuses it.
        if let Some(capacity) = self.capacity {
            if self.len.load(Ordering::Relaxed) >= capacity {
                return Err(StorageError::CapacityExceeded { partition });
            }
        }

        slot.value = Some(entry.value.clone());
        slot.version = entry.version;
        slot.expire_time = entry.expire_time;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(InsertOutcome::Inserted)
    }

    fn track_eviction(&self, partition: PartitionId, key: &[u8], _topology: TopologyVersion) {
        if let Some(data) = self.partition(partition) {
            data.tracked.lock().insert(Bytes::copy_from_slice(key));
        }
    }

    fn discard_if_empty(&self, partition: PartitionId, key: &[u8]) -> bool {
        let Some(data) = self.partition(partition) else {
            return false;
        };
        let mut slots = data.slots.write();
        match slots.get(key) {
            Some(slot) if slot.value.is_none() => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }
}
