//! Partition map exchanges as seen by the demander.
//!
//! An exchange is the cluster-wide step that computes a new topology version
//! after a discovery event. The demander only needs a handle to it: its
//! topology version, the event that triggered it, and a way to run code once
//! it has finished.

use crate::rebalancing::completion::Completion;
use crate::types::{NodeId, TopologyVersion};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of membership change behind an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    NodeJoined,
    NodeLeft,
    NodeFailed,
    /// Exchange forced locally, e.g. to retry missed partitions.
    Forced,
}

/// The discovery event that triggered an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    /// Node the event is about.
    pub node: NodeId,
    /// What happened.
    pub kind: DiscoveryEventKind,
    /// Event time in milliseconds since UNIX epoch.
    pub timestamp_ms: u64,
}

impl DiscoveryEvent {
    /// Create an event stamped with the current time.
    pub fn new(node: NodeId, kind: DiscoveryEventKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            node,
            kind,
            timestamp_ms,
        }
    }
}

struct ExchangeInner {
    topology_version: TopologyVersion,
    discovery: DiscoveryEvent,
    done: Completion<TopologyVersion>,
}

/// Shared handle to an exchange.
#[derive(Clone)]
pub struct ExchangeHandle {
    inner: Arc<ExchangeInner>,
}

impl ExchangeHandle {
    /// Create a handle for a pending exchange.
    pub fn new(topology_version: TopologyVersion, discovery: DiscoveryEvent) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                topology_version,
                discovery,
                done: Completion::new(),
            }),
        }
    }

    /// Create a handle for an exchange that has already finished.
    pub fn completed(topology_version: TopologyVersion, discovery: DiscoveryEvent) -> Self {
        let handle = Self::new(topology_version, discovery);
        handle.complete();
        handle
    }

    /// Topology version produced by the exchange.
    pub fn topology_version(&self) -> TopologyVersion {
        self.inner.topology_version
    }

    /// The event that triggered the exchange.
    pub fn discovery_event(&self) -> &DiscoveryEvent {
        &self.inner.discovery
    }

    /// Mark the exchange as finished.
    pub fn complete(&self) -> bool {
        self.inner.done.complete(self.inner.topology_version)
    }

    /// Whether the exchange has finished.
    pub fn is_done(&self) -> bool {
        self.inner.done.is_done()
    }

    /// Wait for the exchange to finish.
    pub async fn wait(&self) -> TopologyVersion {
        self.inner.done.wait().await
    }

    /// Run `f` once the exchange has finished.
    pub fn on_done(&self, f: impl FnOnce(TopologyVersion) + Send + 'static) {
        self.inner.done.on_done(move |version| f(*version));
    }

    /// Whether two handles refer to the same exchange.
    pub fn same_exchange(&self, other: &ExchangeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("topology_version", &self.inner.topology_version)
            .field("discovery", &self.inner.discovery)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Entry point into the exchange machinery, used to re-drive rebalancing.
pub trait ExchangeManager: Send + Sync + 'static {
    /// Start a new rebalance round for the topology of `exchange`.
    ///
    /// Eventually results in `add_assignments(plan, force = true)`.
    fn force_preload_exchange(&self, exchange: &ExchangeHandle);

    /// Start a dummy exchange, optionally recomputing assignments so that
    /// missed partitions get a fresh plan.
    fn force_dummy_exchange(&self, reassign: bool, exchange: &ExchangeHandle);
}

/// Exchange manager that ignores every request.
pub struct NoopExchangeManager;

impl ExchangeManager for NoopExchangeManager {
    fn force_preload_exchange(&self, _exchange: &ExchangeHandle) {}

    fn force_dummy_exchange(&self, _reassign: bool, _exchange: &ExchangeHandle) {}
}
