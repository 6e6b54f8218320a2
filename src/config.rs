//! Configuration types for the rebalancing engine.

use crate::error::{Error, Result};
use crate::types::DatasetId;
use std::time::Duration;

/// Rebalancing configuration for a single dataset.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Dataset this demander serves.
    pub dataset_id: DatasetId,

    /// Human readable dataset name, used in logs.
    pub dataset_name: String,

    /// Whether rebalancing is enabled for the dataset.
    pub enabled: bool,

    /// Client nodes hold no partitions and never rebalance.
    pub client_mode: bool,

    /// Number of logical workers (and topics) per dataset.
    pub pool_size: usize,

    /// Delay before a non-forced round starts.
    ///
    /// `Some(Duration::ZERO)` starts rounds immediately, `None` leaves rounds
    /// to explicit [`force_preload`](crate::rebalancing::Demander::force_preload) calls.
    pub delay: Option<Duration>,

    /// How long a supplier keeps a stream open for a demand.
    pub timeout: Duration,

    /// Rebalance order; datasets with a lower order finish first.
    pub order: u32,

    /// Hint for the supplier's batch size in bytes.
    pub batch_size: usize,

    /// Minimum interval between repeated capacity warnings.
    pub capacity_warn_interval: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            dataset_id: 0,
            dataset_name: "default".to_string(),
            enabled: true,
            client_mode: false,
            pool_size: 2,
            delay: Some(Duration::ZERO),
            timeout: Duration::from_secs(10),
            order: 0,
            batch_size: 512 * 1024,
            capacity_warn_interval: Duration::from_secs(10),
        }
    }
}

impl RebalanceConfig {
    /// Create a configuration for the given dataset.
    pub fn new(dataset_id: DatasetId, dataset_name: impl Into<String>) -> Self {
        Self {
            dataset_id,
            dataset_name: dataset_name.into(),
            ..Default::default()
        }
    }

    /// Set the worker pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the rebalance delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Only rebalance when explicitly forced.
    pub fn with_manual_rebalance(mut self) -> Self {
        self.delay = None;
        self
    }

    /// Set the supply stream timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the rebalance order.
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Enable or disable rebalancing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Mark this node as a client node.
    pub fn with_client_mode(mut self, client_mode: bool) -> Self {
        self.client_mode = client_mode;
        self
    }

    /// Set the supplier batch size hint.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the capacity warning interval.
    pub fn with_capacity_warn_interval(mut self, interval: Duration) -> Self {
        self.capacity_warn_interval = interval;
        self
    }

    /// Whether this node takes part in rebalancing at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.client_mode
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        Ok(())
    }
}
