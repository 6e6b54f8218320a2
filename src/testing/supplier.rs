//! In-process supplier used by the end-to-end suites.
//!
//! Serves demands from its own [`MemoryPartitionStore`]: partitions in the
//! `Owning` state are streamed in pages bounded by `page_size` entries and by
//! the demand's `batch_size`; everything else is reported missing on the
//! first page.

use crate::network::{MemoryTransport, MessageHandler, RebalanceMessage, Transport};
use crate::rebalancing::messages::{DemandMessage, EntryInfo, SupplyMessage};
use crate::rebalancing::router::WorkerRouter;
use crate::storage::{MemoryPartitionStore, PartitionState};
use crate::types::{NodeId, PartitionId, WorkerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Default)]
struct Stream {
    pending: VecDeque<(PartitionId, Vec<EntryInfo>)>,
    missed: BTreeSet<PartitionId>,
}

impl Stream {
    /// Fill a page up to `page_size` entries or `batch_size` bytes of keys
    /// and values, whichever is hit first.
    fn next_page(&mut self, worker: WorkerId, page_size: usize, batch_size: usize) -> SupplyMessage {
        let mut page = SupplyMessage::new(worker);
        page.missed = std::mem::take(&mut self.missed);

        let mut budget = page_size.max(1);
        let mut bytes = 0;
        while let Some((p, entries)) = self.pending.front_mut() {
            let p = *p;
            let mut take = 0;
            while take < entries.len() && budget > 0 && bytes < batch_size {
                bytes += entries[take].key.len() + entries[take].value.len();
                take += 1;
                budget -= 1;
            }
            page.add_entries(p, entries.drain(..take));

            if entries.is_empty() {
                self.pending.pop_front();
                page.mark_last(p);
            }
            if budget == 0 || bytes >= batch_size {
                break;
            }
        }
        page
    }

    fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.missed.is_empty()
    }
}

/// Supplier side of one dataset on one node.
pub struct TestSupplier {
    node: NodeId,
    router: WorkerRouter,
    transport: Arc<MemoryTransport>,
    store: Arc<MemoryPartitionStore>,
    page_size: AtomicUsize,
    class_error: Mutex<Option<String>>,
    leave_on_page: Mutex<Option<usize>>,
    gate: watch::Sender<bool>,
    streams: Mutex<HashMap<(NodeId, WorkerId), Stream>>,
    pages_sent: AtomicUsize,
    demands_received: AtomicUsize,
}

impl TestSupplier {
    pub fn new(
        transport: Arc<MemoryTransport>,
        router: WorkerRouter,
        store: Arc<MemoryPartitionStore>,
    ) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            node: transport.local_node(),
            router,
            transport,
            store,
            page_size: AtomicUsize::new(usize::MAX),
            class_error: Mutex::new(None),
            leave_on_page: Mutex::new(None),
            gate,
            streams: Mutex::new(HashMap::new()),
            pages_sent: AtomicUsize::new(0),
            demands_received: AtomicUsize::new(0),
        })
    }

    /// Listen on every supplier topic of the dataset.
    pub fn register(self: &Arc<Self>) -> crate::Result<()> {
        for worker in 0..self.router.pool_size() {
            self.transport
                .register_handler(self.router.supply_topic(worker), self.clone())?;
        }
        Ok(())
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn store(&self) -> &Arc<MemoryPartitionStore> {
        &self.store
    }

    /// Maximum number of entries per page.
    pub fn set_page_size(&self, page_size: usize) {
        self.page_size.store(page_size, Ordering::SeqCst);
    }

    /// Answer every demand with a class-loading failure.
    pub fn fail_with_class_error(&self, reason: impl Into<String>) {
        *self.class_error.lock() = Some(reason.into());
    }

    /// Leave the network right before sending page number `page` (1-based).
    pub fn leave_on_page(&self, page: usize) {
        *self.leave_on_page.lock() = Some(page);
    }

    /// Hold demands until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    pub fn pages_sent(&self) -> usize {
        self.pages_sent.load(Ordering::SeqCst)
    }

    pub fn demands_received(&self) -> usize {
        self.demands_received.load(Ordering::SeqCst)
    }

    fn open_stream(&self, demand: &DemandMessage) -> Stream {
        let mut stream = Stream::default();
        for &p in &demand.partitions {
            if self.store.state(p) == Some(PartitionState::Owning) {
                stream.pending.push_back((p, self.store.entries(p)));
            } else {
                stream.missed.insert(p);
            }
        }
        stream
    }

    fn next_page(&self, from: NodeId, worker: WorkerId, demand: &DemandMessage) -> Option<SupplyMessage> {
        if let Some(reason) = self.class_error.lock().clone() {
            let mut page = SupplyMessage::new(worker);
            page.class_error = Some(reason);
            return Some(page);
        }

        let mut streams = self.streams.lock();
        if !demand.is_continuation() {
            streams.insert((from, worker), self.open_stream(demand));
        }

        let stream = streams.get_mut(&(from, worker))?;
        let batch_size = match demand.batch_size {
            0 => usize::MAX,
            n => n,
        };
        let page = stream.next_page(worker, self.page_size.load(Ordering::SeqCst), batch_size);
        if stream.is_finished() {
            streams.remove(&(from, worker));
        }
        Some(page)
    }
}

#[async_trait]
impl MessageHandler for TestSupplier {
    async fn handle(&self, from: NodeId, msg: RebalanceMessage) {
        let RebalanceMessage::Demand(demand) = msg else {
            warn!(node_id = self.node, from, "Supplier received a non-demand message");
            return;
        };
        self.demands_received.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return;
        }

        let Some(reply) = demand.topic.clone() else {
            warn!(node_id = self.node, from, "Demand without reply topic");
            return;
        };
        let Some(page) = self.next_page(from, reply.worker, &demand) else {
            debug!(node_id = self.node, from, "No open stream for continuation demand");
            return;
        };

        let sent = self.pages_sent.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.leave_on_page.lock() == Some(sent) {
            self.transport.network().fail_node(self.node);
        }

        if let Err(e) = self
            .transport
            .send(from, &reply, RebalanceMessage::Supply(page), demand.timeout)
            .await
        {
            debug!(node_id = self.node, to = from, error = %e, "Failed to send supply page");
        }
    }
}
