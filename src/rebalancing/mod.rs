//! Demand-side partition rebalancing.
//!
//! When the topology changes, a node may become the owner of partitions it
//! holds no data for. The exchange that follows produces an
//! [`AssignmentPlan`]: for every supplying peer, the partitions to pull from
//! it. The [`Demander`] executes that plan.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Demander                             │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  RebalanceScheduler                                   │  │
//! │  │  - immediate, delayed or manual start                 │  │
//! │  │  - single delay timer, forced preload exchange        │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  SyncFuture (one per round)                           │  │
//! │  │  - outstanding partitions per supplier                │  │
//! │  │  - missed partitions, forced reassignment             │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Worker topics (p % pool_size)                        │  │
//! │  │  - demand → supplier, supply pages ← supplier         │  │
//! │  │  - EntryApplier writes entries, partitions owned      │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Rounds
//!
//! A round starts when a plan is added and the previous round has finished.
//! Plans that are empty, or computed for a topology the node has already
//! moved past, complete their round immediately. Otherwise every supplier is
//! registered with the round's [`SyncFuture`] before the first demand leaves,
//! and the round completes once every requested partition has either been
//! owned, reported missing, or dropped together with its supplier.
//!
//! Partitions reported missing are not retried inside the round. When the
//! round completes with misses, a single forced exchange is requested so a
//! fresh plan can assign them elsewhere.
//!
//! # Example
//!
//! ```rust,ignore
//! use gridsync::rebalancing::{AssignmentPlan, Demander, RebalanceContext};
//!
//! let ctx = RebalanceContext::new(transport, store, affinity, exchange_manager);
//! let demander = Demander::new(RebalanceConfig::new(1, "orders"), ctx)?;
//!
//! let plan = AssignmentPlan::new(exchange).demand_from(supplier, [0, 1, 2, 3]);
//! demander.add_assignments(plan, false).await?;
//!
//! let summary = demander.sync_future().wait().await;
//! assert!(summary.is_clean());
//! ```

pub mod applier;
pub mod assignment;
pub mod completion;
pub mod context;
pub mod demander;
pub mod events;
pub mod exchange;
pub mod messages;
pub mod ranges;
pub mod router;
pub mod scheduler;
pub mod sync_future;

pub use applier::{EntryApplier, LogThrottle, PreloadPredicate};
pub use assignment::AssignmentPlan;
pub use completion::Completion;
pub use context::RebalanceContext;
pub use demander::{Demander, StartDependencies};
pub use events::{
    EventRecorder, LoggingEventRecorder, MemoryEventRecorder, NoopEventRecorder, RebalanceEvent,
    RebalanceEventKind,
};
pub use exchange::{
    DiscoveryEvent, DiscoveryEventKind, ExchangeHandle, ExchangeManager, NoopExchangeManager,
};
pub use messages::{DemandMessage, EntryInfo, SupplyMessage};
pub use ranges::{compress_ranges, PartitionRanges};
pub use router::{Topic, TopicRole, WorkerRouter};
pub use scheduler::{RebalanceScheduler, StartMode, TimerHandle};
pub use sync_future::{RoundSummary, SyncFuture};
