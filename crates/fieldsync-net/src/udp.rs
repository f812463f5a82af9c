use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use fieldsync_types::NodeId;

use crate::traits::{Transport, TransportError};

/// Largest datagram accepted from the socket.
const MAX_DATAGRAM: usize = 4096;

/// UDP link with a static peer table, for WiFi / IP-capable gateways.
///
/// Datagrams from addresses outside the peer table are discarded.
pub struct UdpTransport {
    node_id: NodeId,
    socket: UdpSocket,
    peers: HashMap<NodeId, SocketAddr>,
    by_addr: HashMap<SocketAddr, NodeId>,
}

impl UdpTransport {
    pub async fn bind(
        node_id: NodeId,
        addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let by_addr = peers.iter().map(|(id, addr)| (*addr, *id)).collect();
        tracing::info!(node_id, addr = %socket.local_addr()?, peers = peers.len(), "udp transport bound");
        Ok(UdpTransport { node_id, socket, peers, by_addr })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn local_id(&self) -> NodeId {
        self.node_id
    }

    async fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        let addr = self.peers.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        self.socket.send_to(&frame, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(NodeId, Vec<u8>), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match self.by_addr.get(&from) {
                Some(node_id) => return Ok((*node_id, buf[..len].to_vec())),
                None => tracing::warn!(%from, len, "datagram from unknown peer dropped"),
            }
        }
    }
}
