//! Demand side of partition rebalancing for one dataset.
//!
//! The demander turns an [`AssignmentPlan`] into demand messages, one per
//! (supplier, worker) pair, and consumes the supply pages streamed back on
//! the worker topics. Every page is applied partition by partition under a
//! reservation and lock; the round's [`SyncFuture`] records what is still
//! outstanding and what has to be retried.
//!
//! ```text
//!  add_assignments(plan)
//!        │  wait for previous round
//!        ▼
//!  SyncFuture::append(node, parts)  ──▶  demand ──▶ rebalance/supply/{ds}/{w}
//!                                                          │
//!  handle_supply_message  ◀── supply ◀── rebalance/demand/{ds}/{w}
//!        │  apply entries, own partitions, mark done / missed
//!        └─ round not done ──▶ continuation demand (same worker)
//! ```

use crate::config::RebalanceConfig;
use crate::error::{Error, Result};
use crate::metrics::{cancel_reason, RebalanceMetrics};
use crate::network::{MessageHandler, RebalanceMessage};
use crate::rebalancing::applier::{EntryApplier, PreloadPredicate};
use crate::rebalancing::assignment::AssignmentPlan;
use crate::rebalancing::completion::Completion;
use crate::rebalancing::context::RebalanceContext;
use crate::rebalancing::events::{RebalanceEvent, RebalanceEventKind};
use crate::rebalancing::exchange::ExchangeHandle;
use crate::rebalancing::messages::{DemandMessage, SupplyMessage};
use crate::rebalancing::ranges::PartitionRanges;
use crate::rebalancing::router::{Topic, WorkerRouter};
use crate::rebalancing::scheduler::{RebalanceScheduler, StartMode};
use crate::rebalancing::sync_future::SyncFuture;
use crate::storage::{PartitionState, PartitionStore};
use crate::types::{NodeId, PartitionId, WorkerId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Futures a demander waits on before its first round.
#[derive(Debug, Clone, Default)]
pub struct StartDependencies {
    /// Initial rebalance of the system dataset. Every other dataset waits
    /// for it.
    pub system: Option<Arc<SyncFuture>>,

    /// Rebalance of the datasets with a lower order. Only awaited when this
    /// dataset has a positive order.
    pub ordered: Option<Arc<SyncFuture>>,
}

struct Round {
    future: Arc<SyncFuture>,
    plan: Option<Arc<AssignmentPlan>>,
    /// Set while the round counts towards the in-flight gauge.
    in_flight: Arc<AtomicBool>,
}

impl Round {
    fn idle(future: Arc<SyncFuture>) -> Self {
        Self {
            future,
            plan: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Reservation and lock of a local partition, released on drop.
struct PartitionGuard<'a> {
    store: &'a dyn PartitionStore,
    partition: PartitionId,
    locked: bool,
}

impl<'a> PartitionGuard<'a> {
    /// Reserve, then lock. A contended lock is retried after yielding, so the
    /// worker thread stays free for other tasks.
    async fn acquire(store: &'a dyn PartitionStore, partition: PartitionId) -> Result<Self> {
        if !store.reserve_partition(partition) {
            return Err(Error::Invariant(format!(
                "failed to reserve moving partition {}",
                partition
            )));
        }

        let mut guard = Self {
            store,
            partition,
            locked: false,
        };
        while !store.try_lock_partition(partition) {
            tokio::task::yield_now().await;
        }
        guard.locked = true;
        Ok(guard)
    }
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.store.unlock_partition(self.partition);
        }
        self.store.release_partition(self.partition);
    }
}

/// Receives supply pages for one worker topic.
struct SupplyHandler {
    worker: WorkerId,
    demander: Weak<Demander>,
}

#[async_trait]
impl MessageHandler for SupplyHandler {
    async fn handle(&self, from: NodeId, msg: RebalanceMessage) {
        let Some(demander) = self.demander.upgrade() else {
            return;
        };
        match msg {
            RebalanceMessage::Supply(supply) => {
                demander
                    .handle_supply_message(self.worker, from, supply)
                    .await
            }
            other => warn!(
                from,
                worker = self.worker,
                kind = other.kind(),
                "Unexpected message on demand topic"
            ),
        }
    }

    fn on_decode_error(&self, from: NodeId, error: Error) {
        if let Some(demander) = self.demander.upgrade() {
            demander.handle_undecodable(self.worker, from, &error);
        }
    }
}

/// Rebalancing demander for a single dataset.
pub struct Demander {
    config: RebalanceConfig,
    router: WorkerRouter,
    ctx: RebalanceContext,
    applier: EntryApplier,
    scheduler: RebalanceScheduler,
    round: RwLock<Round>,
    /// Serializes round planning.
    planning: tokio::sync::Mutex<()>,
    /// Message handlers hold the read side; `stop` takes the write side.
    busy: tokio::sync::RwLock<()>,
    stopping: AtomicBool,
    stopped: Completion<()>,
    topics: Mutex<Vec<Topic>>,
    fatal: Mutex<Option<Error>>,
}

impl Demander {
    /// Create a demander and register its worker handlers.
    ///
    /// When rebalancing is disabled or the node is a client, no handlers are
    /// registered and the initial sync future is already complete.
    pub fn new(config: RebalanceConfig, ctx: RebalanceContext) -> Result<Arc<Self>> {
        config.validate()?;

        let router = WorkerRouter::new(config.dataset_id, config.pool_size);
        let initial = Arc::new(SyncFuture::new(ctx.exchange_manager.clone()));

        let demander = Arc::new(Self {
            applier: EntryApplier::new(config.capacity_warn_interval),
            scheduler: RebalanceScheduler::new(config.delay, ctx.exchange_manager.clone()),
            round: RwLock::new(Round::idle(initial)),
            planning: tokio::sync::Mutex::new(()),
            busy: tokio::sync::RwLock::new(()),
            stopping: AtomicBool::new(false),
            stopped: Completion::new(),
            topics: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            router,
            ctx,
            config,
        });

        if demander.config.is_active() {
            for worker in 0..router.pool_size() {
                let topic = router.demand_topic(worker);
                let handler = Arc::new(SupplyHandler {
                    worker,
                    demander: Arc::downgrade(&demander),
                });
                demander
                    .ctx
                    .transport
                    .register_handler(topic.clone(), handler)?;
                demander.topics.lock().push(topic);
            }
            info!(
                dataset = %demander.config.dataset_name,
                node_id = demander.ctx.local_node,
                workers = router.pool_size(),
                "Rebalance demander started"
            );
        } else {
            debug!(
                dataset = %demander.config.dataset_name,
                client_mode = demander.config.client_mode,
                "Rebalancing disabled, completing sync future"
            );
            demander.sync_future().complete();
        }

        Ok(demander)
    }

    /// Wait for the datasets this one depends on.
    ///
    /// Returns `false` if the demander was stopped while waiting.
    pub async fn start(&self, dependencies: &StartDependencies) -> bool {
        if let Some(system) = &dependencies.system {
            debug!(dataset = %self.config.dataset_name, "Waiting for system dataset rebalance");
            if !self.wait_or_stop(system).await {
                debug!(
                    dataset = %self.config.dataset_name,
                    "Failed to wait for system dataset rebalance (demander is stopping)"
                );
                return false;
            }
        }

        if self.config.order > 0 {
            if let Some(ordered) = &dependencies.ordered {
                debug!(
                    dataset = %self.config.dataset_name,
                    order = self.config.order,
                    "Waiting for dependant datasets rebalance"
                );
                if !self.wait_or_stop(ordered).await {
                    debug!(
                        dataset = %self.config.dataset_name,
                        order = self.config.order,
                        "Failed to wait for ordered rebalance (demander is stopping)"
                    );
                    return false;
                }
            }
        }

        true
    }

    async fn wait_or_stop(&self, future: &SyncFuture) -> bool {
        tokio::select! {
            _ = future.wait() => true,
            _ = self.stopped.wait() => false,
        }
    }

    /// Start (or schedule) a rebalance round for `plan`.
    ///
    /// A newer plan supersedes the current one once the current round has
    /// finished. Errors recorded by message handlers since the last call are
    /// returned first.
    pub async fn add_assignments(&self, plan: AssignmentPlan, force: bool) -> Result<()> {
        self.take_fatal()?;

        if !self.config.is_active() {
            debug!(dataset = %self.config.dataset_name, "Ignoring assignments, rebalancing disabled");
            return Ok(());
        }
        if self.stopping.load(Ordering::SeqCst) {
            debug!(dataset = %self.config.dataset_name, "Ignoring assignments, demander is stopping");
            return Ok(());
        }

        debug!(
            dataset = %self.config.dataset_name,
            topology = %plan.topology_version(),
            nodes = plan.nodes().count(),
            force,
            "Adding partition assignments"
        );

        match self.scheduler.start_mode(force) {
            StartMode::Immediate => {}
            StartMode::Delayed(delay) => return self.scheduler.schedule_delayed(delay),
            StartMode::Manual => {
                debug!(
                    dataset = %self.config.dataset_name,
                    "Rebalance delay is not set, waiting for forced rebalance"
                );
                return Ok(());
            }
        }

        let _planning = self.planning.lock().await;

        let previous = self.sync_future();
        // A round planned against an older topology never finishes on its own
        // once its suppliers stop answering.
        self.cancel_if_stale(&previous);
        let future = if previous.is_attached() {
            if !self.wait_or_stop(&previous).await {
                return Err(Error::Cancelled);
            }
            Arc::new(SyncFuture::new(self.ctx.exchange_manager.clone()))
        } else {
            previous
        };
        future.attach(plan.exchange());

        let topology = plan.topology_version();
        let current = self.ctx.affinity.current_topology_version();
        if plan.is_empty() || current > topology {
            debug!(
                dataset = %self.config.dataset_name,
                topology = %topology,
                current = %current,
                "Nothing to rebalance for plan"
            );
            *self.round.write() = Round::idle(future.clone());
            future.complete();
            self.ctx.metrics.record_noop_round();
            return Ok(());
        }

        let mut plan = plan;
        for (_, demand) in plan.iter_mut() {
            demand.timeout = self.config.timeout;
            demand.batch_size = self.config.batch_size;
        }
        let plan = Arc::new(plan);

        // Every node is registered before the first demand goes out, so an
        // early reply cannot complete the round.
        for (&node, demand) in plan.iter() {
            future.append(node, demand.partitions.iter().copied());
        }

        let in_flight = Arc::new(AtomicBool::new(true));
        self.ctx.metrics.record_round_started();

        let metrics = self.ctx.metrics.clone();
        let dataset = self.config.dataset_name.clone();
        let round_id = future.round_id();
        let settle = in_flight.clone();
        future.on_done(move |summary| {
            metrics.record_round_completed(summary.missed.len());
            if settle.swap(false, Ordering::SeqCst) {
                metrics.record_round_settled();
            }
            info!(
                dataset = %dataset,
                round = %round_id,
                missed = summary.missed.len(),
                cancelled = summary.cancelled.len(),
                "Completed rebalance round"
            );
        });

        *self.round.write() = Round {
            future: future.clone(),
            plan: Some(plan.clone()),
            in_flight,
        };

        for (&node, demand) in plan.iter() {
            if demand.partitions.is_empty() {
                continue;
            }
            self.send_demands(&future, node, demand).await;
        }

        Ok(())
    }

    async fn send_demands(&self, future: &SyncFuture, node: NodeId, demand: &DemandMessage) {
        let mut failure: Option<Error> = None;
        let shards = self.router.shard(&demand.partitions);
        for (worker, shard) in shards.into_iter().enumerate() {
            if shard.is_empty() {
                continue;
            }
            let msg = demand.with_partitions(shard, self.router.demand_topic(worker));
            let topic = self.router.supply_topic(worker);

            match self
                .ctx
                .transport
                .send(node, &topic, RebalanceMessage::Demand(msg), demand.timeout)
                .await
            {
                Ok(()) => self.ctx.metrics.demands_sent.inc(),
                Err(e) => {
                    self.ctx.metrics.demand_send_failures.inc();
                    error!(
                        dataset = %self.config.dataset_name,
                        node_id = node,
                        worker,
                        error = %e,
                        "Failed to send partition demand message to node"
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            // No page comes back for an unsent shard. What still belongs here
            // is retried through the reassigning exchange.
            let topology = demand.topology_version;
            for p in future.remaining_partitions(node) {
                if self.ctx.affinity.is_locally_owned(p, topology) {
                    future.mark_missed(node, p);
                    self.ctx.metrics.partitions_missed.inc();
                }
            }
            let reason = if e.is_node_left() {
                cancel_reason::NODE_LEFT
            } else {
                cancel_reason::SEND_FAILED
            };
            self.cancel_node(future, node, reason);
            return;
        }

        info!(
            dataset = %self.config.dataset_name,
            node_id = node,
            partitions = demand.partitions.len(),
            ranges = %PartitionRanges(&demand.partitions),
            "Requested rebalancing"
        );
    }

    /// Process a supply page received from `node` on `worker`'s topic.
    ///
    /// Skipped when the demander is stopping. Never fails: every problem ends
    /// in cancelling `node` for the current round.
    pub async fn handle_supply_message(&self, worker: WorkerId, node: NodeId, supply: SupplyMessage) {
        if self.stopping.load(Ordering::SeqCst) {
            debug!(node_id = node, worker, "Dropping supply message (demander is stopping)");
            return;
        }
        let Ok(_busy) = self.busy.try_read() else {
            debug!(
                node_id = self.ctx.local_node,
                "Failed to enter to busy state (demander is stopping)"
            );
            return;
        };

        self.ctx.metrics.supply_received.inc();

        let (future, plan) = {
            let round = self.round.read();
            (round.future.clone(), round.plan.clone())
        };
        let Some(plan) = plan else {
            debug!(node_id = node, worker, "Ignoring supply message, no active plan");
            return;
        };
        let Some(demand) = plan.get(node) else {
            debug!(node_id = node, worker, "Ignoring supply message from node without demand");
            return;
        };

        let topology = demand.topology_version;
        if self.ctx.affinity.topology_changed(topology) {
            debug!(
                node_id = node,
                worker,
                topology = %topology,
                current = %self.ctx.affinity.current_topology_version(),
                "Topology changed, cancelling rebalancing from node"
            );
            self.cancel_node(&future, node, cancel_reason::TOPOLOGY_CHANGED);
            return;
        }

        debug!(
            node_id = node,
            worker,
            entries = supply.entry_count(),
            last = supply.last.len(),
            missed = supply.missed.len(),
            "Received supply message"
        );

        if let Some(reason) = &supply.class_error {
            warn!(
                node_id = node,
                worker,
                reason = %reason,
                "Class got undeployed during preloading"
            );
            self.cancel_node(&future, node, cancel_reason::CLASS_ERROR);
            return;
        }

        match self
            .process_supply(worker, node, &future, &plan, demand, &supply)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_node_left() => {
                debug!(
                    node_id = node,
                    error = %e,
                    "Node left during rebalancing (will retry)"
                );
                self.cancel_node(&future, node, cancel_reason::NODE_LEFT);
            }
            Err(e) => {
                error!(
                    node_id = node,
                    worker,
                    topology = %topology,
                    error = %e,
                    "Failed to receive partitions from node (rebalancing will not fully finish)"
                );
                self.cancel_node(&future, node, cancel_reason::PROCESSING_ERROR);
                if matches!(e, Error::Invariant(_)) {
                    self.fatal.lock().get_or_insert(e);
                }
            }
        }
    }

    async fn process_supply(
        &self,
        worker: WorkerId,
        node: NodeId,
        future: &SyncFuture,
        plan: &AssignmentPlan,
        demand: &DemandMessage,
        supply: &SupplyMessage,
    ) -> Result<()> {
        let topology = demand.topology_version;
        let store = self.ctx.store.as_ref();

        for (&p, entries) in &supply.entries {
            if !self.ctx.affinity.is_locally_owned(p, topology) {
                future.mark_partition_done(node, p);
                debug!(
                    partition = p,
                    "Skipping rebalancing partition (it does not belong on current node)"
                );
                continue;
            }

            let state = store.partition_state(p, topology);
            if state != PartitionState::Moving {
                future.mark_partition_done(node, p);
                debug!(partition = p, state = ?state, "Skipping rebalancing partition (state is not moving)");
                continue;
            }

            let _guard = PartitionGuard::acquire(store, p).await?;

            for entry in entries {
                if !store.preloading_permitted(p, &entry.key, entry.version) {
                    debug!(
                        partition = p,
                        key = %entry.key_hex(),
                        version = %entry.version,
                        "Preloading is not permitted for entry due to evictions"
                    );
                    self.ctx.metrics.entries_skipped.inc();
                    continue;
                }
                if !self.applier.apply(&self.ctx, node, p, entry, topology)? {
                    debug!(
                        partition = p,
                        "Got entries for invalid partition during preloading (will skip)"
                    );
                    break;
                }
            }

            if supply.last.contains(&p) {
                store.own_partition(p);
                self.ctx.metrics.partitions_owned.inc();
                if self.ctx.events.is_recordable(RebalanceEventKind::PartitionLoaded) {
                    self.ctx.events.record(RebalanceEvent::PartitionLoaded {
                        partition: p,
                        discovery: plan.exchange().discovery_event().clone(),
                    });
                }

                // Last, since this may complete the round.
                future.mark_partition_done(node, p);
                debug!(partition = p, node_id = node, "Finished rebalancing partition");
            }
        }

        // Only retry partitions that still belong here.
        for &p in &supply.missed {
            if self.ctx.affinity.is_locally_owned(p, topology) {
                future.mark_missed(node, p);
                self.ctx.metrics.partitions_missed.inc();
            }
        }
        for &p in &supply.missed {
            future.mark_partition_done(node, p);
        }

        if !future.is_done() {
            let next = demand.continuation(self.router.demand_topic(worker));
            self.ctx
                .transport
                .send(
                    node,
                    &self.router.supply_topic(worker),
                    RebalanceMessage::Demand(next),
                    demand.timeout,
                )
                .await?;
            self.ctx.metrics.demands_sent.inc();
        }

        Ok(())
    }

    fn cancel_node(&self, future: &SyncFuture, node: NodeId, reason: &'static str) {
        future.cancel(node);
        self.ctx.metrics.record_cancellation(reason);
    }

    fn handle_undecodable(&self, worker: WorkerId, node: NodeId, error: &Error) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let future = self.sync_future();
        if !future.remaining_nodes().contains(&node) {
            return;
        }
        error!(
            node_id = node,
            worker,
            error = %error,
            "Failed to decode supply message (rebalancing will not fully finish)"
        );
        self.cancel_node(&future, node, cancel_reason::PROCESSING_ERROR);
    }

    /// Cancel every node still outstanding in `future` if the topology has
    /// moved past the one it was planned for.
    fn cancel_if_stale(&self, future: &SyncFuture) {
        let Some(topology) = future.topology_version() else {
            return;
        };
        if future.is_done() || !self.ctx.affinity.topology_changed(topology) {
            return;
        }

        let nodes = future.remaining_nodes();
        debug!(
            dataset = %self.config.dataset_name,
            topology = %topology,
            current = %self.ctx.affinity.current_topology_version(),
            nodes = nodes.len(),
            "Topology changed, cancelling outstanding rebalancing"
        );
        for node in nodes {
            self.cancel_node(future, node, cancel_reason::TOPOLOGY_CHANGED);
        }
    }

    /// Stop waiting on a node that left the cluster.
    ///
    /// Its partitions are reassigned by the exchange that follows the
    /// departure.
    pub fn on_node_left(&self, node: NodeId) {
        let future = self.sync_future();
        if !future.remaining_nodes().contains(&node) {
            return;
        }
        debug!(node_id = node, "Node left during rebalancing, cancelling its stream");
        self.cancel_node(&future, node, cancel_reason::NODE_LEFT);
    }

    /// Cancel the current round's outstanding nodes if the topology it was
    /// planned for is no longer current.
    pub fn on_topology_changed(&self) {
        self.cancel_if_stale(&self.sync_future());
    }

    fn take_fatal(&self) -> Result<()> {
        match self.fatal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unregister the worker handlers, forget the last exchange and cancel
    /// the delay timer.
    ///
    /// Waits for handlers already processing a page. The current round is
    /// abandoned, not completed.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.stopped.complete(());

        {
            let round = self.round.read();
            if !round.future.is_done() && round.in_flight.swap(false, Ordering::SeqCst) {
                self.ctx.metrics.record_round_abandoned();
            }
        }

        {
            let _busy = self.busy.write().await;
            let topics: Vec<Topic> = self.topics.lock().drain(..).collect();
            for topic in &topics {
                self.ctx.transport.unregister_handler(topic);
            }
        }

        self.scheduler.stop();
        info!(dataset = %self.config.dataset_name, "Rebalance demander stopped");

        self.take_fatal()
    }

    /// Cancel the delay timer and force a rebalance for the last exchange.
    pub fn force_preload(&self) {
        self.scheduler.force_preload();
    }

    /// Record the latest exchange; delayed and forced rounds are driven by it.
    pub fn update_last_exchange(&self, exchange: ExchangeHandle) {
        self.scheduler.update_last_exchange(exchange);
    }

    /// Install or clear the preload predicate.
    pub fn set_preload_predicate(&self, predicate: Option<PreloadPredicate>) {
        self.applier.set_predicate(predicate);
    }

    /// Sync future of the current round.
    pub fn sync_future(&self) -> Arc<SyncFuture> {
        self.round.read().future.clone()
    }

    /// The plan of the current round, if one is installed.
    pub fn current_plan(&self) -> Option<Arc<AssignmentPlan>> {
        self.round.read().plan.clone()
    }

    /// Whether a delayed round is waiting on its timer.
    pub fn has_pending_timer(&self) -> bool {
        self.scheduler.has_pending_timer()
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    pub fn router(&self) -> &WorkerRouter {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<RebalanceMetrics> {
        &self.ctx.metrics
    }
}
