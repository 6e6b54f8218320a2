//! Error types for the rebalancing engine.

use crate::types::{NodeId, PartitionId};
use thiserror::Error;

/// Result type alias for rebalancing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the rebalancing engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Rebalancing protocol errors.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A protocol invariant was broken. Fatal for the current round.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error means the peer is gone and its stream should be
    /// cancelled quietly.
    pub fn is_node_left(&self) -> bool {
        matches!(self, Error::Network(NetworkError::NodeLeft(_)))
    }
}

/// Errors raised while processing a rebalance round.
#[derive(Error, Debug, Clone)]
pub enum RebalanceError {
    /// An entry could not be written to local storage.
    #[error(
        "failed to cache rebalanced entry (will stop rebalancing) [node={node}, part={partition}, key={key}]: {reason}"
    )]
    EntryApplyFailed {
        node: NodeId,
        partition: PartitionId,
        key: String,
        reason: String,
    },
}

/// Network communication errors.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// The destination node left the cluster.
    #[error("node left the cluster: {0}")]
    NodeLeft(NodeId),

    /// Nobody listens on the topic at the destination.
    #[error("no handler for topic {topic} on node {node}")]
    NoHandler { node: NodeId, topic: String },

    /// A handler is already registered for the topic.
    #[error("handler already registered for topic {0}")]
    DuplicateHandler(String),

    /// The destination did not accept the message in time.
    #[error("send to node {0} timed out")]
    Timeout(NodeId),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Wire envelope carries a version this node does not understand.
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u16),
}

/// Storage layer errors.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The partition is not known locally.
    #[error("partition not found: {0}")]
    PartitionNotFound(PartitionId),

    /// The dataset is over its capacity ceiling. A partially created slot
    /// may be left behind.
    #[error("capacity exceeded for partition {partition}")]
    CapacityExceeded { partition: PartitionId },

    /// The write was rejected by the storage engine.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
