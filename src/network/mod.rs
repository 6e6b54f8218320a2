//! Topic-addressed messaging between nodes.
//!
//! The demander talks to suppliers through the [`Transport`] trait. Delivery
//! is ordered per (source, topic); there is no ordering across topics and no
//! delivery once a node has left.

mod memory;
pub mod rpc;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use rpc::{decode_message, encode_message, RebalanceMessage, WireEnvelope, WIRE_VERSION};

use crate::error::{Error, Result};
use crate::rebalancing::router::Topic;
use crate::types::NodeId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Handler for messages arriving on a topic.
///
/// Calls for one topic are made sequentially in delivery order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, from: NodeId, msg: RebalanceMessage);

    /// A message from `from` arrived on this topic but could not be decoded.
    fn on_decode_error(&self, _from: NodeId, _error: Error) {}
}

/// Point-to-point messaging contract.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's id.
    fn local_node(&self) -> NodeId;

    /// Send `msg` to `topic` on `node`.
    ///
    /// Fails with [`NetworkError::NodeLeft`](crate::error::NetworkError::NodeLeft)
    /// if the node is gone.
    async fn send(
        &self,
        node: NodeId,
        topic: &Topic,
        msg: RebalanceMessage,
        timeout: Duration,
    ) -> Result<()>;

    /// Start delivering messages for `topic` on this node to `handler`.
    fn register_handler(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stop delivering messages for `topic`. Returns whether a handler was
    /// registered.
    fn unregister_handler(&self, topic: &Topic) -> bool;
}
