//! Rebalance events emitted while partitions are loaded.

use crate::rebalancing::exchange::DiscoveryEvent;
use crate::types::{NodeId, PartitionId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Kinds of rebalance events, used to check whether recording is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceEventKind {
    PartitionLoaded,
    ObjectLoaded,
}

/// Events emitted by the demander.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceEvent {
    /// A partition received its last page and is now owned locally.
    PartitionLoaded {
        /// The partition.
        partition: PartitionId,
        /// Discovery event of the exchange that caused the round.
        discovery: DiscoveryEvent,
    },

    /// An entry was inserted for the first time by rebalancing.
    ObjectLoaded {
        /// Partition of the entry.
        partition: PartitionId,
        /// Entry key.
        key: Bytes,
        /// Node the entry was received from.
        node: NodeId,
        /// Entry value.
        value: Bytes,
    },
}

impl RebalanceEvent {
    /// The kind of this event.
    pub fn kind(&self) -> RebalanceEventKind {
        match self {
            RebalanceEvent::PartitionLoaded { .. } => RebalanceEventKind::PartitionLoaded,
            RebalanceEvent::ObjectLoaded { .. } => RebalanceEventKind::ObjectLoaded,
        }
    }

    /// Partition the event is about.
    pub fn partition(&self) -> PartitionId {
        match self {
            RebalanceEvent::PartitionLoaded { partition, .. } => *partition,
            RebalanceEvent::ObjectLoaded { partition, .. } => *partition,
        }
    }
}

/// Sink for rebalance events.
pub trait EventRecorder: Send + Sync + 'static {
    /// Whether events of `kind` should be built and recorded at all.
    fn is_recordable(&self, kind: RebalanceEventKind) -> bool;

    /// Record an event.
    fn record(&self, event: RebalanceEvent);
}

/// Recorder that drops everything.
pub struct NoopEventRecorder;

impl EventRecorder for NoopEventRecorder {
    fn is_recordable(&self, _kind: RebalanceEventKind) -> bool {
        false
    }

    fn record(&self, _event: RebalanceEvent) {}
}

/// Recorder that logs partition events.
pub struct LoggingEventRecorder;

impl EventRecorder for LoggingEventRecorder {
    fn is_recordable(&self, kind: RebalanceEventKind) -> bool {
        kind == RebalanceEventKind::PartitionLoaded
    }

    fn record(&self, event: RebalanceEvent) {
        match &event {
            RebalanceEvent::PartitionLoaded {
                partition,
                discovery,
            } => {
                tracing::info!(
                    partition,
                    trigger_node = discovery.node,
                    trigger = ?discovery.kind,
                    "Partition loaded"
                );
            }
            RebalanceEvent::ObjectLoaded {
                partition, node, ..
            } => {
                tracing::trace!(partition, node, "Object loaded");
            }
        }
    }
}

/// Recorder that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    enabled: HashSet<RebalanceEventKind>,
    events: Mutex<Vec<RebalanceEvent>>,
}

impl MemoryEventRecorder {
    /// Record only the given kinds.
    pub fn new(enabled: impl IntoIterator<Item = RebalanceEventKind>) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Record every kind.
    pub fn all() -> Self {
        Self::new([
            RebalanceEventKind::PartitionLoaded,
            RebalanceEventKind::ObjectLoaded,
        ])
    }

    /// Copy of the recorded events.
    pub fn events(&self) -> Vec<RebalanceEvent> {
        self.events.lock().clone()
    }

    /// Recorded events of one kind.
    pub fn events_of(&self, kind: RebalanceEventKind) -> Vec<RebalanceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn is_recordable(&self, kind: RebalanceEventKind) -> bool {
        self.enabled.contains(&kind)
    }

    fn record(&self, event: RebalanceEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancing::exchange::DiscoveryEventKind;

    #[test]
    fn test_event_kind_and_partition() {
        let event = RebalanceEvent::ObjectLoaded {
            partition: 3,
            key: Bytes::from_static(b"k"),
            node: 1,
            value: Bytes::from_static(b"v"),
        };
        assert_eq!(event.kind(), RebalanceEventKind::ObjectLoaded);
        assert_eq!(event.partition(), 3);
    }

    #[test]
    fn test_memory_recorder_filters_by_kind() {
        let recorder = MemoryEventRecorder::new([RebalanceEventKind::PartitionLoaded]);
        assert!(recorder.is_recordable(RebalanceEventKind::PartitionLoaded));
        assert!(!recorder.is_recordable(RebalanceEventKind::ObjectLoaded));

        recorder.record(RebalanceEvent::PartitionLoaded {
            partition: 9,
            discovery: DiscoveryEvent::new(4, DiscoveryEventKind::NodeJoined),
        });
        assert_eq!(recorder.events_of(RebalanceEventKind::PartitionLoaded).len(), 1);
        assert!(recorder.events_of(RebalanceEventKind::ObjectLoaded).is_empty());
    }

    #[test]
    fn test_logging_recorder_only_takes_partition_events() {
        let recorder = LoggingEventRecorder;
        assert!(recorder.is_recordable(RebalanceEventKind::PartitionLoaded));
        assert!(!recorder.is_recordable(RebalanceEventKind::ObjectLoaded));
        assert!(!NoopEventRecorder.is_recordable(RebalanceEventKind::PartitionLoaded));
    }
}
