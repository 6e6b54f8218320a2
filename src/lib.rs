//! Demand-side partition rebalancing for a partitioned data grid.
//!
//! When cluster membership changes, a node may be assigned partitions whose
//! data lives elsewhere. This crate pulls that data in: it turns an
//! assignment plan into per-worker demand messages, applies the supply pages
//! streamed back by peers, and hands partitions over to the owning state once
//! their last page has landed.
//!
//! - **Rounds** are serialized: a new plan waits for the previous round
//! - **Workers** split each dataset's traffic by `partition % pool_size`
//! - **Misses** trigger one forced exchange per round so they get reassigned
//!
//! # Example
//!
//! ```rust,ignore
//! use gridsync::{Demander, RebalanceConfig, RebalanceContext};
//! use gridsync::rebalancing::AssignmentPlan;
//!
//! let ctx = RebalanceContext::new(transport, store, affinity, exchange_manager);
//! let demander = Demander::new(RebalanceConfig::new(1, "orders"), ctx)?;
//!
//! // Pull partitions 0..16 from node 3.
//! let plan = AssignmentPlan::new(exchange).demand_from(3, 0..16);
//! demander.add_assignments(plan, false).await?;
//!
//! let summary = demander.sync_future().wait().await;
//! println!("missed: {:?}", summary.missed);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Exchange / assignment layer           │
//! └─────────────────────────────────────────────┘
//!                     │ AssignmentPlan
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │                 Demander                     │
//! │  • add_assignments(plan, force)             │
//! │  • handle_supply_message(worker, node, msg) │
//! │  • stop() / force_preload()                 │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌───────────┐
//! │Transport│   │ Partition│   │ Affinity  │
//! │         │   │  Store   │   │           │
//! └─────────┘   └──────────┘   └───────────┘
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod rebalancing;
pub mod storage;
#[cfg(test)]
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::RebalanceConfig;
pub use error::{Error, NetworkError, RebalanceError, Result, StorageError};
pub use types::{DatasetId, EntryVersion, NodeId, PartitionId, TopologyVersion, WorkerId};

pub use rebalancing::{
    AssignmentPlan, Demander, ExchangeHandle, ExchangeManager, RebalanceContext, RoundSummary,
    StartDependencies, SyncFuture,
};

// Re-export collaborator contracts
pub use network::{MemoryNetwork, MemoryTransport, MessageHandler, RebalanceMessage, Transport};
pub use partitioning::{Affinity, StaticAffinity};
pub use storage::{InsertOutcome, MemoryPartitionStore, PartitionState, PartitionStore};

// Re-export metrics types
pub use metrics::{Counter, Gauge, LabeledCounter, RebalanceMetrics, RebalanceMetricsSnapshot};
