//! Transports that drive the connection state machine (spec §4.7, §6).
//!
//! Two shapes: `TcpTransport` carries full framed connections (metadata,
//! payload chunks, and control messages) between daemons; `UdpApplicationTransport`
//! is the local "application port" variant (spec §6) used by applications on
//! the same host — it never exchanges control messages, just one `Metadata`
//! frame per datagram.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionError};
use crate::framing::{Frame, FrameError};
use crate::peer::PeerId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("peer not connected: {0}")]
    PeerNotFound(PeerId),
}

/// Event surfaced by a transport to whoever owns it (the protocol manager).
#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    FrameReceived { from: PeerId, frame: Frame },
}

/// TCP-backed transport: one `Connection` (and its own outbound queue) per
/// connected peer.
pub struct TcpTransport {
    listen_addr: SocketAddr,
    connections: RwLock<HashMap<PeerId, Arc<Connection>>>,
}

impl TcpTransport {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.connections
            .read()
            .get(id)
            .map(|c| !c.is_terminal())
            .unwrap_or(false)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    pub fn register(&self, peer: PeerId, conn: Connection) {
        self.connections.write().insert(peer, Arc::new(conn));
    }

    pub fn remove(&self, peer: &PeerId) {
        self.connections.write().remove(peer);
    }

    pub fn try_send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        let conn = self
            .connections
            .read()
            .get(to)
            .cloned()
            .ok_or(TransportError::PeerNotFound(*to))?;
        conn.try_send(frame).map_err(TransportError::from)
    }

    /// Accept loop: binds the listener and hands each incoming stream's raw
    /// socket off to the caller via `event_tx`. Actual frame I/O per
    /// connection is driven by the protocol manager, which owns the
    /// `Connection` state machine and the codec; this just multiplexes
    /// accepted sockets onto the event channel.
    pub async fn listen(
        &self,
        event_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    ) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("haggle-net: listening on {}", self.listen_addr);
        loop {
            let (stream, addr) = listener.accept().await?;
            if event_tx.send((stream, addr)).await.is_err() {
                warn!("haggle-net: accept loop has no receiver, stopping");
                return Ok(());
            }
        }
    }
}

/// Local application transport: UDP loopback with no control messages.
/// Every datagram is exactly one `Metadata` frame (no length prefix needed
/// since UDP already preserves datagram boundaries).
pub struct UdpApplicationTransport {
    socket: UdpSocket,
}

impl UdpApplicationTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send a raw metadata payload to `to`. No framing, no control
    /// messages: the datagram boundary is the message boundary.
    pub async fn send_to(&self, to: SocketAddr, metadata_bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(metadata_bytes, to).await?;
        Ok(())
    }

    /// Receive one datagram as a `Metadata` frame.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(Frame, SocketAddr), TransportError> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((Frame::metadata(buf[..n].to_vec()), from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_application_transport_round_trip() {
        let a = UdpApplicationTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpApplicationTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b_addr, b"hello").await.unwrap();

        let mut buf = [0u8; 1024];
        let (frame, _from) = b.recv(&mut buf).await.unwrap();
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn tcp_transport_tracks_connected_peers() {
        let transport = TcpTransport::new("127.0.0.1:0".parse().unwrap());
        let peer = PeerId::from_bytes([9u8; 32]);
        let (conn, _rx) = Connection::new(peer);
        transport.register(peer, conn);
        assert_eq!(transport.connected_peers(), vec![peer]);
        transport.remove(&peer);
        assert!(transport.connected_peers().is_empty());
    }
}
