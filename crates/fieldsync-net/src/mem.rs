use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use fieldsync_types::NodeId;

use crate::traits::{Transport, TransportError};

type Frame = (NodeId, Vec<u8>);

// ---------------------------------------------------------------------------
// MemMesh
// ---------------------------------------------------------------------------

struct MeshInner {
    endpoints: HashMap<NodeId, mpsc::UnboundedSender<Frame>>,
    /// (from, to) → number of upcoming frames to lose on that link.
    drop_next: HashMap<(NodeId, NodeId), u32>,
    /// Nodes whose frames are lost in both directions.
    partitioned: HashSet<NodeId>,
    delivered: u64,
    dropped: u64,
}

/// In-process mesh connecting any number of endpoints.
///
/// Intended for tests and simulations. Loss is injected per link or per node;
/// a lost frame still reports `Ok` to the sender, as a radio would.
#[derive(Clone)]
pub struct MemMesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl MemMesh {
    pub fn new() -> Self {
        MemMesh {
            inner: Arc::new(Mutex::new(MeshInner {
                endpoints: HashMap::new(),
                drop_next: HashMap::new(),
                partitioned: HashSet::new(),
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    /// Attach a new endpoint for `node_id`, replacing any previous one.
    pub async fn endpoint(&self, node_id: NodeId) -> MemTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.endpoints.insert(node_id, tx);
        MemTransport { node_id, mesh: self.clone(), rx: Mutex::new(rx) }
    }

    /// Lose the next `count` frames sent from `from` to `to`.
    pub async fn drop_next(&self, from: NodeId, to: NodeId, count: u32) {
        *self.inner.lock().await.drop_next.entry((from, to)).or_default() += count;
    }

    /// Cut `node_id` off from everyone until `heal` is called.
    pub async fn partition(&self, node_id: NodeId) {
        self.inner.lock().await.partitioned.insert(node_id);
    }

    pub async fn heal(&self, node_id: NodeId) {
        self.inner.lock().await.partitioned.remove(&node_id);
    }

    /// `(delivered, dropped)` frame counters.
    pub async fn stats(&self) -> (u64, u64) {
        let g = self.inner.lock().await;
        (g.delivered, g.dropped)
    }

    async fn deliver(&self, from: NodeId, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut g = self.inner.lock().await;
        let Some(tx) = g.endpoints.get(&to).cloned() else {
            return Err(TransportError::UnknownPeer(to));
        };

        let lost = if g.partitioned.contains(&from) || g.partitioned.contains(&to) {
            true
        } else {
            match g.drop_next.get_mut(&(from, to)) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };

        // A receiver that went away behaves like a node that powered off.
        if lost || tx.send((from, frame)).is_err() {
            g.dropped += 1;
            tracing::trace!(from, to, "frame lost in mesh");
        } else {
            g.delivered += 1;
        }
        Ok(())
    }
}

impl Default for MemMesh {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MemTransport
// ---------------------------------------------------------------------------

pub struct MemTransport {
    node_id: NodeId,
    mesh: MemMesh,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl Transport for MemTransport {
    fn local_id(&self) -> NodeId {
        self.node_id
    }

    async fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.mesh.deliver(self.node_id, to, frame).await
    }

    async fn recv(&self) -> Result<(NodeId, Vec<u8>), TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}
