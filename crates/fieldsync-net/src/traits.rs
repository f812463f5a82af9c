use std::future::Future;

use fieldsync_types::{FieldsyncError, NodeId};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("no route to node {0}")]
    UnknownPeer(NodeId),
    #[error("transport closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for FieldsyncError {
    fn from(e: TransportError) -> Self {
        FieldsyncError::Transport(e.to_string())
    }
}

/// Datagram-style link to the mesh.
///
/// Delivery is at-least-once at best: frames may be lost, duplicated or
/// reordered. Methods use RPITIT with an explicit `+ Send` bound so generic
/// callers can hold the futures across `.await` on a multi-threaded runtime.
pub trait Transport: Send + Sync + 'static {
    /// Node id this endpoint sends as.
    fn local_id(&self) -> NodeId;

    /// Hand `frame` to the link. `Ok` only means the frame left this node.
    fn send(&self, to: NodeId, frame: Vec<u8>)
        -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next inbound frame and its sender. Cancel safe.
    fn recv(&self) -> impl Future<Output = Result<(NodeId, Vec<u8>), TransportError>> + Send;
}
