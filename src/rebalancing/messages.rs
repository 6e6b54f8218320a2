//! Demand and supply messages exchanged during rebalancing.
//!
//! A demander asks a peer for a set of partitions with a [`DemandMessage`];
//! the peer streams [`SupplyMessage`] pages back on the demander's worker
//! topic. Once a page has been consumed the demander sends a continuation
//! demand (empty partition set) to request the next page.

use crate::rebalancing::router::Topic;
use crate::types::{EntryVersion, PartitionId, TopologyVersion, WorkerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single entry carried in a supply message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// The entry key.
    pub key: Bytes,

    /// The entry value.
    pub value: Bytes,

    /// Version used for conditional inserts.
    pub version: EntryVersion,

    /// Time to live, if any.
    pub ttl: Option<Duration>,

    /// Absolute expiration time in milliseconds since UNIX epoch.
    pub expire_time: Option<u64>,

    /// Internal entries are never reported as rebalance events.
    pub internal: bool,
}

impl EntryInfo {
    /// Create an entry without expiration.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>, version: EntryVersion) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            ttl: None,
            expire_time: None,
            internal: false,
        }
    }

    /// Attach a TTL; the expiration time is computed from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.ttl = Some(ttl);
        self.expire_time = Some(now_ms + ttl.as_millis() as u64);
        self
    }

    /// Mark the entry as internal.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expire_time.map_or(false, |expires| {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            expires <= now_ms
        })
    }

    /// Key rendered as hex, for logs and errors.
    pub fn key_hex(&self) -> String {
        self.key.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Request for partition data, sent to a supplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandMessage {
    /// Partitions requested. Empty for continuation demands.
    pub partitions: BTreeSet<PartitionId>,

    /// Topology the demand was computed against.
    pub topology_version: TopologyVersion,

    /// How long the supplier should keep the stream open.
    pub timeout: Duration,

    /// Preferred page size in bytes. Zero leaves it to the supplier.
    pub batch_size: usize,

    /// Topic the supplier should answer on.
    pub topic: Option<Topic>,
}

impl DemandMessage {
    /// Create a demand for the given partitions.
    pub fn new(
        partitions: impl IntoIterator<Item = PartitionId>,
        topology_version: TopologyVersion,
    ) -> Self {
        Self {
            partitions: partitions.into_iter().collect(),
            topology_version,
            timeout: Duration::ZERO,
            batch_size: 0,
            topic: None,
        }
    }

    /// Copy of this demand restricted to `partitions`, answered on `topic`.
    pub fn with_partitions(&self, partitions: BTreeSet<PartitionId>, topic: Topic) -> Self {
        Self {
            partitions,
            topology_version: self.topology_version,
            timeout: self.timeout,
            batch_size: self.batch_size,
            topic: Some(topic),
        }
    }

    /// Continuation demand asking for the next page on `topic`.
    pub fn continuation(&self, topic: Topic) -> Self {
        self.with_partitions(BTreeSet::new(), topic)
    }

    /// Whether this is a continuation demand.
    pub fn is_continuation(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// A page of partition data streamed back by a supplier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplyMessage {
    /// Worker the page belongs to.
    pub worker: WorkerId,

    /// Entries grouped by partition.
    pub entries: BTreeMap<PartitionId, Vec<EntryInfo>>,

    /// Partitions for which this page is the final one.
    pub last: BTreeSet<PartitionId>,

    /// Partitions the supplier could not provide.
    pub missed: BTreeSet<PartitionId>,

    /// Set when the supplier failed to load classes for the data.
    pub class_error: Option<String>,
}

impl SupplyMessage {
    /// Create an empty supply page for a worker.
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            ..Default::default()
        }
    }

    /// Add entries for a partition.
    pub fn add_entries(&mut self, partition: PartitionId, entries: impl IntoIterator<Item = EntryInfo>) {
        self.entries.entry(partition).or_default().extend(entries);
    }

    /// Mark a partition as complete with this page.
    pub fn mark_last(&mut self, partition: PartitionId) {
        self.entries.entry(partition).or_default();
        self.last.insert(partition);
    }

    /// Mark a partition as missed.
    pub fn mark_missed(&mut self, partition: PartitionId) {
        self.missed.insert(partition);
    }

    /// Total entries in the page.
    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether the page carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.missed.is_empty() && self.class_error.is_none()
    }
}
