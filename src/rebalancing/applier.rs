//! Writing received entries into local storage.

use crate::error::{RebalanceError, Result, StorageError};
use crate::rebalancing::context::RebalanceContext;
use crate::rebalancing::events::{RebalanceEvent, RebalanceEventKind};
use crate::rebalancing::messages::EntryInfo;
use crate::storage::InsertOutcome;
use crate::types::{NodeId, PartitionId, TopologyVersion};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Filter deciding whether a received entry is preloaded at all.
pub type PreloadPredicate = Arc<dyn Fn(PartitionId, &EntryInfo) -> bool + Send + Sync>;

/// Lets a message through at most once per interval.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Whether the caller should log now.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Validates and writes single entries.
///
/// Holds no per-round state. The only mutable parts are the preload
/// predicate and the capacity warning throttle.
pub struct EntryApplier {
    predicate: RwLock<Option<PreloadPredicate>>,
    capacity_warning: LogThrottle,
}

impl EntryApplier {
    /// Create an applier that repeats capacity warnings at most once per
    /// `capacity_warn_interval`.
    pub fn new(capacity_warn_interval: Duration) -> Self {
        Self {
            predicate: RwLock::new(None),
            capacity_warning: LogThrottle::new(capacity_warn_interval),
        }
    }

    /// Install or clear the preload predicate.
    pub fn set_predicate(&self, predicate: Option<PreloadPredicate>) {
        *self.predicate.write() = predicate;
    }

    /// Apply one entry received from `node`.
    ///
    /// Returns `Ok(false)` when the partition became invalid and no further
    /// entries of it should be applied.
    pub fn apply(
        &self,
        ctx: &RebalanceContext,
        node: NodeId,
        partition: PartitionId,
        entry: &EntryInfo,
        topology: TopologyVersion,
    ) -> Result<bool> {
        debug!(key = %entry.key_hex(), partition, node_id = node, "Rebalancing key");

        if entry.is_expired() {
            debug!(key = %entry.key_hex(), partition, "Rebalancing entry has expired (will ignore)");
            ctx.metrics.entries_skipped.inc();
            return Ok(true);
        }

        let accepted = self
            .predicate
            .read()
            .as_ref()
            .map_or(true, |accept| accept(partition, entry));
        if !accepted {
            debug!(
                key = %entry.key_hex(),
                partition,
                "Rebalance predicate evaluated to false for entry (will ignore)"
            );
            ctx.metrics.entries_skipped.inc();
            return Ok(true);
        }

        match ctx.store.conditional_insert(partition, entry, topology) {
            Ok(InsertOutcome::Inserted) => {
                ctx.store.track_eviction(partition, &entry.key, topology);
                ctx.metrics.entries_applied.inc();

                if !entry.internal && ctx.events.is_recordable(RebalanceEventKind::ObjectLoaded) {
                    ctx.events.record(RebalanceEvent::ObjectLoaded {
                        partition,
                        key: entry.key.clone(),
                        node,
                        value: entry.value.clone(),
                    });
                }
                Ok(true)
            }
            Ok(InsertOutcome::AlreadyNewer) => {
                debug!(
                    key = %entry.key_hex(),
                    partition,
                    "Rebalancing entry is already in cache (will ignore)"
                );
                ctx.metrics.entries_skipped.inc();
                Ok(true)
            }
            Ok(InsertOutcome::Removed) => {
                debug!(
                    key = %entry.key_hex(),
                    partition,
                    "Entry has been concurrently removed while rebalancing (will ignore)"
                );
                ctx.metrics.entries_skipped.inc();
                Ok(true)
            }
            Ok(InsertOutcome::PartitionInvalid) => {
                debug!(partition, "Partition became invalid during rebalancing (will ignore)");
                Ok(false)
            }
            Err(StorageError::CapacityExceeded { .. }) => {
                if self.capacity_warning.allow() {
                    warn!(
                        partition,
                        "Failed to rebalance entries (dataset size exceeded maximum, will ignore rebalance entries)"
                    );
                }
                ctx.store.discard_if_empty(partition, &entry.key);
                ctx.metrics.entries_dropped.inc();
                Ok(true)
            }
            Err(e) => Err(RebalanceError::EntryApplyFailed {
                node,
                partition,
                key: entry.key_hex(),
                reason: e.to_string(),
            }
            .into()),
        }
    }
}
