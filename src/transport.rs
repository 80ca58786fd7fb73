//! Transport integration trait and the in-process mesh.
//!
//! The replication engine talks to peers only through [`Transport`]:
//! best-effort, unordered delivery of [`Frame`]s. Inbound frames arrive on
//! an mpsc channel the node drains from its dispatch loop.
//!
//! [`MeshNetwork`] is a process-local mesh used by tests and embedders: each
//! node takes an endpoint keyed by its node ID, and frames addressed to a
//! detached endpoint are silently dropped, which is how tests model
//! partitions and crashed nodes.

use crate::store::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Capacity of each endpoint's inbound queue. Frames beyond this are
/// dropped, consistent with best-effort delivery.
const INBOUND_QUEUE: usize = 1024;

/// One transport-level message: a named event plus its (possibly sealed)
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Sending node's ID.
    pub from: String,
    /// Wire event name, e.g. `"put"` or `"anti-entropy-request"`.
    pub event: String,
    /// Envelope blob or plain payload, as JSON.
    pub payload: Value,
}

/// Bidirectional best-effort message channel to the mesh.
///
/// Implementations must tolerate unknown peers (drop, don't error the
/// node) and may reorder or lose frames; causality is carried by vector
/// clocks, not by delivery order.
pub trait Transport: Send + Sync + 'static {
    /// Send a frame to one peer.
    fn emit(&self, peer_id: &str, frame: Frame) -> BoxFuture<'_, ()>;

    /// Send a frame to every connected peer.
    fn broadcast(&self, frame: Frame) -> BoxFuture<'_, ()>;

    /// Take the inbound frame receiver. Yields `Some` exactly once.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Frame>>;

    /// IDs of peers currently reachable from this endpoint.
    fn peers(&self) -> Vec<String>;

    /// Disconnect this endpoint from the mesh.
    fn detach(&self);
}

/// Process-local mesh registry.
///
/// ```rust
/// use meshkv::transport::MeshNetwork;
///
/// let net = MeshNetwork::new();
/// let a = net.endpoint("n1");
/// let b = net.endpoint("n2");
/// ```
#[derive(Default)]
pub struct MeshNetwork {
    endpoints: Mutex<HashMap<String, mpsc::Sender<Frame>>>,
}

impl MeshNetwork {
    /// Create an empty mesh.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or re-create) an endpoint for a node.
    ///
    /// Re-creating an endpoint with the same ID replaces the previous
    /// registration, which is how a restarted node rejoins.
    pub fn endpoint(self: &Arc<Self>, node_id: &str) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.endpoints
            .lock()
            .expect("mesh registry poisoned")
            .insert(node_id.to_string(), tx);
        Arc::new(MemoryTransport {
            node_id: node_id.to_string(),
            net: Arc::clone(self),
            inbound: Mutex::new(Some(rx)),
        })
    }

    fn sender_for(&self, node_id: &str) -> Option<mpsc::Sender<Frame>> {
        self.endpoints
            .lock()
            .expect("mesh registry poisoned")
            .get(node_id)
            .cloned()
    }

    fn remove(&self, node_id: &str) {
        self.endpoints
            .lock()
            .expect("mesh registry poisoned")
            .remove(node_id);
    }

    fn attached(&self) -> Vec<String> {
        self.endpoints
            .lock()
            .expect("mesh registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// One node's endpoint on a [`MeshNetwork`].
pub struct MemoryTransport {
    node_id: String,
    net: Arc<MeshNetwork>,
    inbound: Mutex<Option<mpsc::Receiver<Frame>>>,
}

impl MemoryTransport {
    /// The owning node's ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, peer_id: &str, frame: Frame) -> BoxFuture<'_, ()> {
        let peer_id = peer_id.to_string();
        Box::pin(async move {
            match self.net.sender_for(&peer_id) {
                Some(tx) => {
                    // Best-effort: a full or closed queue drops the frame.
                    if tx.try_send(frame).is_err() {
                        trace!(peer_id = %peer_id, "Dropped frame (queue full or peer gone)");
                    }
                }
                None => {
                    trace!(peer_id = %peer_id, "Dropped frame (peer not attached)");
                }
            }
            Ok(())
        })
    }

    fn broadcast(&self, frame: Frame) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for peer_id in self.net.attached() {
                if peer_id == self.node_id {
                    continue;
                }
                self.emit(&peer_id, frame.clone()).await?;
            }
            Ok(())
        })
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Frame>> {
        self.inbound.lock().expect("inbound receiver poisoned").take()
    }

    fn peers(&self) -> Vec<String> {
        self.net
            .attached()
            .into_iter()
            .filter(|id| id != &self.node_id)
            .collect()
    }

    fn detach(&self) {
        self.net.remove(&self.node_id);
    }
}
