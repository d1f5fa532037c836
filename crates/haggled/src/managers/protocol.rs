//! Protocol Engine / Connection Manager (spec §4.7): the connection-oriented
//! send/receive state machine that actually moves data objects between
//! daemons over TCP.
//!
//! Grounded on `ProtocolManager.cpp`'s per-neighbour serialized send queue
//! and its metadata-then-payload, accept/reject/ack handshake, built on top
//! of `haggle-net`'s `Connection` FSM, `TcpTransport` registry, and
//! `FrameCodec`. The original's direction-bound connection ("a connection is
//! bound to a local interface, a peer interface, and a direction") is taken
//! literally here: a connection this daemon dials only ever sends, a
//! connection it accepts only ever receives. Discovering peers and dialable
//! addresses (link-layer probing, Bluetooth SDP, mDNS) is an explicit
//! Non-goal; this manager resolves a dial target by parsing a neighbour's
//! `Interface::identifier()` as a socket address directly, a pragmatic
//! substitute documented in DESIGN.md.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use haggle_core::canonical::blake3_domain;
use haggle_core::DataObject;
use haggle_net::{Connection, ConnectionEvent, Frame, FrameCodec, FrameType, PeerId, TcpTransport};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::event::{Event, EventKind, FailureKind, Phase};
use crate::kernel::KernelHandle;
use crate::managers::node::NodeManager;
use crate::node_store::{InterfaceStore, NodeStore};

const MANAGER_NAME: &str = "ProtocolManager";
const DOMAIN_PEER: &str = "haggle.protocol.peer.v1";
const DIAL_ATTEMPTS: u32 = 4;
const DIAL_BACKOFF_MIN_SECS: u64 = 2;
const DIAL_BACKOFF_MAX_SECS: u64 = 10;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(20);

fn peer_id_for_node(node_id: &str) -> PeerId {
    PeerId::from_bytes(blake3_domain(DOMAIN_PEER, node_id.as_bytes()))
}

fn peer_id_for_addr(addr: SocketAddr) -> PeerId {
    PeerId::from_bytes(blake3_domain(DOMAIN_PEER, addr.to_string().as_bytes()))
}

/// Find a dialable address among a node's interfaces. Real connectivity
/// discovery is out of scope; an interface identifier that parses as a
/// socket address is treated as one directly.
fn resolve_addr(nodes: &NodeStore, node_id: &str) -> Option<SocketAddr> {
    let node = nodes.get(node_id)?;
    node.interfaces().iter().filter(|i| i.is_up()).find_map(|i| i.identifier().parse().ok())
}

async fn dial_with_retry(addr: SocketAddr) -> Result<TcpStream, ()> {
    for attempt in 0..DIAL_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(%addr, attempt, error = %e, "protocol: dial failed");
                if attempt + 1 < DIAL_ATTEMPTS {
                    let backoff = rand::thread_rng().gen_range(DIAL_BACKOFF_MIN_SECS..=DIAL_BACKOFF_MAX_SECS);
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }
    Err(())
}

/// Drives one outgoing TCP connection's write half, draining whatever the
/// owning `Connection`'s bounded queue hands it (spec §4.7: backpressure
/// lives in the queue, not in this loop).
async fn run_writer(mut framed: FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if framed.send(frame).await.is_err() {
            return;
        }
    }
}

/// Drives one outgoing connection's read half: only control replies are
/// expected here, since this daemon dialed and is therefore the sender for
/// this connection's lifetime.
async fn run_outbound_reader(mut framed: FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>, reply_tx: mpsc::UnboundedSender<Frame>) {
    while let Some(result) = framed.next().await {
        match result {
            Ok(frame) => {
                if reply_tx.send(frame).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "protocol: outbound connection read failed");
                return;
            }
        }
    }
}

pub struct ProtocolManager {
    handle: KernelHandle,
    nodes: Arc<NodeStore>,
    interfaces: Arc<InterfaceStore>,
    node_manager: Arc<NodeManager>,
    transport: Arc<TcpTransport>,
    outbound: Mutex<HashMap<String, mpsc::UnboundedSender<Arc<DataObject>>>>,
}

impl ProtocolManager {
    pub fn new(
        handle: KernelHandle,
        nodes: Arc<NodeStore>,
        interfaces: Arc<InterfaceStore>,
        node_manager: Arc<NodeManager>,
        transport: Arc<TcpTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            nodes,
            interfaces,
            node_manager,
            transport,
            outbound: Mutex::new(HashMap::new()),
        })
    }

    fn queue_for(self: &Arc<Self>, node_id: &str) -> mpsc::UnboundedSender<Arc<DataObject>> {
        let mut outbound = self.outbound.lock();
        if let Some(tx) = outbound.get(node_id) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        outbound.insert(node_id.to_string(), tx.clone());
        tokio::spawn(self.clone().run_outbound_worker(node_id.to_string(), rx));
        tx
    }

    async fn connect_outbound(self: &Arc<Self>, node_id: &str) -> Result<(PeerId, mpsc::UnboundedReceiver<Frame>), ()> {
        let addr = resolve_addr(&self.nodes, node_id).ok_or(())?;
        let stream = dial_with_retry(addr).await?;
        let peer_id = peer_id_for_node(node_id);
        let (mut conn, out_rx) = Connection::new(peer_id);
        conn.apply(ConnectionEvent::DialSucceeded).map_err(|_| ())?;
        self.transport.register(peer_id, conn);

        let (read_half, write_half) = stream.into_split();
        let writer = FramedWrite::new(write_half, FrameCodec);
        let reader = FramedRead::new(read_half, FrameCodec);
        tokio::spawn(run_writer(writer, out_rx));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbound_reader(reader, reply_tx));

        Ok((peer_id, reply_rx))
    }

    async fn send_one(
        self: &Arc<Self>,
        peer_id: &PeerId,
        replies: &mut mpsc::UnboundedReceiver<Frame>,
        object: &DataObject,
    ) -> Result<(), FailureKind> {
        let header = object.header_only();
        let header_bytes = postcard::to_allocvec(&header).map_err(|_| FailureKind::PeerClosed)?;
        self.transport.try_send(peer_id, Frame::metadata(header_bytes)).map_err(|_| FailureKind::PeerClosed)?;

        let reply = tokio::time::timeout(CONTROL_TIMEOUT, replies.recv())
            .await
            .map_err(|_| FailureKind::PeerClosed)?
            .ok_or(FailureKind::PeerClosed)?;

        match reply.frame_type {
            FrameType::ControlReject => return Ok(()),
            FrameType::ControlTerminate => return Err(FailureKind::PeerTerminated),
            FrameType::ControlAccept => {}
            _ => return Err(FailureKind::PeerClosed),
        }

        if object.payload().len() > 0 {
            if let Some(bytes) = object.payload().inline_bytes() {
                self.transport
                    .try_send(peer_id, Frame::payload_chunk(bytes.to_vec()))
                    .map_err(|_| FailureKind::PeerClosed)?;
            }
        }

        let ack = tokio::time::timeout(CONTROL_TIMEOUT, replies.recv())
            .await
            .map_err(|_| FailureKind::AckMissing)?
            .ok_or(FailureKind::AckMissing)?;
        if ack.frame_type != FrameType::ControlAck {
            return Err(FailureKind::AckMissing);
        }
        Ok(())
    }

    async fn run_outbound_worker(self: Arc<Self>, node_id: String, mut queue: mpsc::UnboundedReceiver<Arc<DataObject>>) {
        let mut connected: Option<(PeerId, mpsc::UnboundedReceiver<Frame>)> = None;

        while let Some(object) = queue.recv().await {
            if let Some((peer_id, _)) = &connected {
                if !self.transport.is_connected(peer_id) {
                    connected = None;
                }
            }
            if connected.is_none() {
                match self.connect_outbound(&node_id).await {
                    Ok(pair) => connected = Some(pair),
                    Err(()) => {
                        self.handle.publish(Event::DataObjectSendFailure {
                            object_id: *object.id(),
                            node_id: node_id.clone(),
                            reason: FailureKind::PeerClosed,
                        });
                        continue;
                    }
                }
            }

            let (peer_id, replies) = connected.as_mut().unwrap();
            match self.send_one(peer_id, replies, &object).await {
                Ok(()) => {
                    self.handle.publish(Event::DataObjectSent { object_id: *object.id(), node_id: node_id.clone() });
                }
                Err(reason) => {
                    self.transport.remove(peer_id);
                    connected = None;
                    self.handle.publish(Event::DataObjectSendFailure { object_id: *object.id(), node_id: node_id.clone(), reason });
                }
            }
        }
    }

    async fn handle_incoming_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let peer_id = peer_id_for_addr(addr);
        let (mut conn, out_rx) = Connection::new(peer_id);
        if conn.apply(ConnectionEvent::AcceptedIncoming).is_err() {
            return;
        }
        self.transport.register(peer_id, conn);

        let (read_half, write_half) = stream.into_split();
        let writer = FramedWrite::new(write_half, FrameCodec);
        tokio::spawn(run_writer(writer, out_rx));
        let mut reader = FramedRead::new(read_half, FrameCodec);

        let local_interface = addr.to_string();
        let from_node = self.interfaces.owner_of(&local_interface);

        while let Some(result) = reader.next().await {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(%addr, error = %e, "protocol: inbound connection read failed");
                    break;
                }
            };
            match frame.frame_type {
                FrameType::Metadata => {
                    let Ok(mut header) = postcard::from_bytes::<DataObject>(&frame.payload) else {
                        warn!(%addr, "protocol: malformed metadata frame");
                        break;
                    };
                    let id = *header.id();
                    self.handle.publish(Event::DataObjectIncoming {
                        object: Arc::new(header.clone()),
                        from_interface: local_interface.clone(),
                    });

                    if self.node_manager.local_filter_has(&id) {
                        let _ = self.transport.try_send(&peer_id, Frame::reject(id));
                        continue;
                    }
                    if self.transport.try_send(&peer_id, Frame::accept(id)).is_err() {
                        break;
                    }

                    let declared_len = header.payload().len();
                    if declared_len > 0 {
                        match reader.next().await {
                            Some(Ok(chunk)) if chunk.frame_type == FrameType::PayloadChunk => {
                                header.attach_payload_bytes(chunk.payload);
                            }
                            _ => {
                                warn!(%addr, "protocol: accepted object never received its payload chunk");
                                break;
                            }
                        }
                    }

                    header.bookkeeping.mark_received(local_interface.clone());
                    self.handle.publish(Event::DataObjectReceived {
                        object: Arc::new(header),
                        from_node: from_node.clone(),
                        local_interface: local_interface.clone(),
                    });
                    if self.transport.try_send(&peer_id, Frame::ack(id)).is_err() {
                        break;
                    }
                }
                FrameType::ControlTerminate => break,
                _ => {}
            }
        }

        self.transport.remove(&peer_id);
    }

    /// Drain accepted sockets handed off by `TcpTransport::listen`, spawning
    /// a receive loop per connection.
    pub async fn run_accept_loop(self: Arc<Self>, mut accepted: mpsc::Receiver<(TcpStream, SocketAddr)>) {
        while let Some((stream, addr)) = accepted.recv().await {
            tokio::spawn(self.clone().handle_incoming_connection(stream, addr));
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.handle.subscribe(&[EventKind::SendRequest, EventKind::PrepareShutdown, EventKind::Shutdown]);

        while let Some(event) = rx.recv().await {
            match event {
                Event::SendRequest { object, node_id } => {
                    let tx = self.queue_for(&node_id);
                    let _ = tx.send(object);
                }
                Event::PrepareShutdown => {
                    self.handle.signal_ready(MANAGER_NAME, Phase::PrepareShutdown);
                }
                Event::Shutdown => {
                    self.handle.signal_ready(MANAGER_NAME, Phase::Shutdown);
                    break;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeState, SecurityLevel};
    use crate::kernel::Kernel;
    use crate::managers::security::SecurityManager;
    use crate::store::{DataStore, SledDataStore};
    use haggle_core::{AttributeSet, Interface, InterfaceStatus, InterfaceType, Node, NodeType, Payload};
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn fixture() -> (Arc<ProtocolManager>, KernelHandle, Arc<NodeStore>, Arc<InterfaceStore>) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let security = SecurityManager::load_or_create(handle.clone(), store.clone(), SecurityLevel::Low).unwrap();
        let nodes = Arc::new(NodeStore::new());
        let interfaces = Arc::new(InterfaceStore::new());
        let node_manager = NodeManager::new(handle.clone(), store, nodes.clone(), security, NodeState::default());
        let transport = Arc::new(TcpTransport::new("127.0.0.1:0".parse().unwrap()));
        let mgr = ProtocolManager::new(handle.clone(), nodes.clone(), interfaces.clone(), node_manager, transport);
        (mgr, handle, nodes, interfaces)
    }

    #[test]
    fn resolve_addr_reads_interface_identifier_as_socket_addr() {
        let nodes = NodeStore::new();
        let mut node = Node::new(NodeType::Peer, "peer-a", AttributeSet::new());
        let mut iface = Interface::new(InterfaceType::Ethernet, "127.0.0.1:9000");
        iface.set_status(InterfaceStatus::Up);
        node.add_interface(iface);
        nodes.upsert(node);

        assert_eq!(resolve_addr(&nodes, "peer-a"), Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[tokio::test]
    async fn full_round_trip_over_a_real_socket() {
        let (mgr_a, handle_a, nodes_a, _ifaces_a) = fixture();
        let (mgr_b, handle_b, _nodes_b, ifaces_b) = fixture();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        ifaces_b.register_owner(format!("127.0.0.1:{}", listen_addr.port()), "never-matches");

        let (accept_tx, accept_rx) = mpsc::channel(4);
        tokio::spawn(async move {
            if let Ok((stream, addr)) = listener.accept().await {
                let _ = accept_tx.send((stream, addr)).await;
            }
        });
        tokio::spawn(mgr_b.clone().run_accept_loop(accept_rx));

        let mut peer = Node::new(NodeType::Peer, "peer-b", AttributeSet::new());
        let mut iface = Interface::new(InterfaceType::Ethernet, listen_addr.to_string());
        iface.set_status(InterfaceStatus::Up);
        peer.add_interface(iface);
        nodes_a.upsert(peer);

        let mut received_rx = handle_b.subscribe(&[EventKind::DataObjectReceived]);
        let mut sent_rx = handle_a.subscribe(&[EventKind::DataObjectSent]);

        let runner_a = tokio::spawn(mgr_a.clone().run());

        let mut attrs = AttributeSet::new();
        attrs.insert(haggle_core::Attribute::new("Topic", "weather"));
        let object = Arc::new(DataObject::new(attrs, Payload::Inline(b"forecast".to_vec())));
        handle_a.publish(Event::SendRequest { object: object.clone(), node_id: "peer-b".into() });

        let sent = tokio::time::timeout(Duration::from_secs(5), sent_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(sent, Event::DataObjectSent { .. }));

        let received = tokio::time::timeout(Duration::from_secs(5), received_rx.recv()).await.unwrap().unwrap();
        match received {
            Event::DataObjectReceived { object: received_object, .. } => {
                assert_eq!(received_object.id(), object.id());
                assert_eq!(received_object.payload().inline_bytes(), Some(b"forecast".as_slice()));
            }
            _ => panic!("expected DataObjectReceived"),
        }

        handle_a.publish(Event::PrepareShutdown);
        handle_a.publish(Event::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(1), runner_a).await;
        let _ = mgr_b;
    }
}
