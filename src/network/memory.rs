//! In-process transport.
//!
//! Every registered (node, topic) pair gets a bounded channel and a task that
//! feeds the handler one message at a time. Messages are encoded to the wire
//! format on send and decoded by the receiving task.

use super::rpc::{decode_message, encode_message};
use super::{MessageHandler, RebalanceMessage, Transport};
use crate::error::{NetworkError, Result};
use crate::rebalancing::router::Topic;
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const ROUTE_CAPACITY: usize = 1024;

type Envelope = (NodeId, Vec<u8>);

struct Route {
    tx: mpsc::Sender<Envelope>,
    _task: JoinHandle<()>,
}

/// Shared message hub for a set of in-process nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    routes: DashMap<(NodeId, Topic), Route>,
    departed: DashSet<NodeId>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport endpoint for `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            node,
            network: self.clone(),
        })
    }

    /// Make `node` leave: its handlers are dropped and sends to it fail.
    pub fn fail_node(&self, node: NodeId) {
        self.departed.insert(node);
        self.routes.retain(|(owner, _), _| *owner != node);
        debug!(node_id = node, "Node removed from in-memory network");
    }

    /// Whether `node` has left.
    pub fn has_left(&self, node: NodeId) -> bool {
        self.departed.contains(&node)
    }

    /// Whether `node` listens on `topic`.
    pub fn is_registered(&self, node: NodeId, topic: &Topic) -> bool {
        self.routes.contains_key(&(node, topic.clone()))
    }

    fn register(&self, node: NodeId, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let key = (node, topic.clone());
        if self.routes.contains_key(&key) {
            return Err(NetworkError::DuplicateHandler(topic.to_string()).into());
        }

        let (tx, mut rx) = mpsc::channel::<Envelope>(ROUTE_CAPACITY);
        let task_topic = topic.clone();
        let task = tokio::spawn(async move {
            while let Some((from, data)) = rx.recv().await {
                match decode_message(&data) {
                    Ok(msg) => handler.handle(from, msg).await,
                    Err(e) => {
                        warn!(
                            node_id = node,
                            from,
                            topic = %task_topic,
                            error = %e,
                            "Dropping undecodable message"
                        );
                        handler.on_decode_error(from, e);
                    }
                }
            }
            trace!(node_id = node, topic = %task_topic, "Route closed");
        });

        self.routes.insert(key, Route { tx, _task: task });
        Ok(())
    }

    fn unregister(&self, node: NodeId, topic: &Topic) -> bool {
        // Dropping the sender lets the task drain what is queued and exit.
        self.routes.remove(&(node, topic.clone())).is_some()
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        topic: &Topic,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        if self.departed.contains(&to) {
            return Err(NetworkError::NodeLeft(to).into());
        }

        let tx = self
            .routes
            .get(&(to, topic.clone()))
            .map(|route| route.tx.clone())
            .ok_or_else(|| NetworkError::NoHandler {
                node: to,
                topic: topic.to_string(),
            })?;

        let send = tx.send((from, data));
        let sent = if timeout.is_zero() {
            send.await
        } else {
            tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| NetworkError::Timeout(to))?
        };

        sent.map_err(|_| {
            if self.departed.contains(&to) {
                NetworkError::NodeLeft(to)
            } else {
                NetworkError::SendFailed(format!("route {} on node {} closed", topic, to))
            }
        })?;
        Ok(())
    }
}

/// Transport endpoint of one node on a [`MemoryNetwork`].
pub struct MemoryTransport {
    node: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    /// The network this endpoint is attached to.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Deliver raw bytes, skipping the encoder.
    #[cfg(test)]
    pub(crate) async fn send_raw(&self, node: NodeId, topic: &Topic, data: Vec<u8>) -> Result<()> {
        self.network
            .deliver(self.node, node, topic, data, Duration::ZERO)
            .await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn send(
        &self,
        node: NodeId,
        topic: &Topic,
        msg: RebalanceMessage,
        timeout: Duration,
    ) -> Result<()> {
        trace!(from = self.node, to = node, topic = %topic, kind = msg.kind(), "Sending message");
        let data = encode_message(&msg)?;
        self.network
            .deliver(self.node, node, topic, data, timeout)
            .await
    }

    fn register_handler(&self, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.network.register(self.node, topic, handler)
    }

    fn unregister_handler(&self, topic: &Topic) -> bool {
        self.network.unregister(self.node, topic)
    }
}
