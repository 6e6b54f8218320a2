//! Worker routing for rebalance traffic.
//!
//! Every dataset runs a fixed pool of logical workers. A partition always
//! belongs to worker `p % pool_size`, and each worker listens on its own topic
//! so that supply streams for different workers are processed concurrently
//! while a single worker's stream stays ordered.

use crate::types::{DatasetId, PartitionId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which side of the protocol listens on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicRole {
    /// Topics the demander listens on (supply messages arrive here).
    Demand,
    /// Topics the supplier listens on (demand messages arrive here).
    Supply,
}

impl TopicRole {
    fn as_str(&self) -> &'static str {
        match self {
            TopicRole::Demand => "demand",
            TopicRole::Supply => "supply",
        }
    }
}

/// Message topic derived from (role, dataset, worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub role: TopicRole,
    pub dataset: DatasetId,
    pub worker: WorkerId,
}

impl Topic {
    /// Create a new topic.
    pub fn new(role: TopicRole, dataset: DatasetId, worker: WorkerId) -> Self {
        Self {
            role,
            dataset,
            worker,
        }
    }

    /// The topic of the other side for the same worker.
    pub fn peer(&self) -> Self {
        let role = match self.role {
            TopicRole::Demand => TopicRole::Supply,
            TopicRole::Supply => TopicRole::Demand,
        };
        Self::new(role, self.dataset, self.worker)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rebalance/{}/{}/{}",
            self.role.as_str(),
            self.dataset,
            self.worker
        )
    }
}

/// Stateless partition-to-worker router.
#[derive(Debug, Clone, Copy)]
pub struct WorkerRouter {
    dataset: DatasetId,
    pool_size: usize,
}

impl WorkerRouter {
    /// Create a router. A pool size of zero is treated as one.
    pub fn new(dataset: DatasetId, pool_size: usize) -> Self {
        Self {
            dataset,
            pool_size: pool_size.max(1),
        }
    }

    /// Number of workers.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Dataset routed by this router.
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    /// Worker responsible for a partition.
    pub fn worker_for(&self, partition: PartitionId) -> WorkerId {
        partition as usize % self.pool_size
    }

    /// Split a partition set into one shard per worker.
    ///
    /// The result always has `pool_size` elements; some may be empty.
    pub fn shard(&self, partitions: &BTreeSet<PartitionId>) -> Vec<BTreeSet<PartitionId>> {
        let mut shards = vec![BTreeSet::new(); self.pool_size];
        for &p in partitions {
            shards[self.worker_for(p)].insert(p);
        }
        shards
    }

    /// Topic the demander of `worker` listens on.
    pub fn demand_topic(&self, worker: WorkerId) -> Topic {
        Topic::new(TopicRole::Demand, self.dataset, worker)
    }

    /// Topic the supplier of `worker` listens on.
    pub fn supply_topic(&self, worker: WorkerId) -> Topic {
        Topic::new(TopicRole::Supply, self.dataset, worker)
    }

    /// All topics of one role, in worker order.
    pub fn topics(&self, role: TopicRole) -> impl Iterator<Item = Topic> + '_ {
        (0..self.pool_size).map(move |w| Topic::new(role, self.dataset, w))
    }
}
