//! Application Manager (spec §4.3, §6 "External Interfaces"): the local
//! IPC surface applications use to register, declare interest, publish, and
//! retrieve data objects.
//!
//! Grounded on `ApplicationManager.cpp`'s registration table and its
//! `DATAOBJECT_NEW`/neighbour-update fan-out to registered apps, carried
//! over `haggle-net`'s `UdpApplicationTransport` rather than a Unix socket.
//! The original's XML-encoded application protocol is an explicit
//! Non-goal; `AppRequest`/`AppResponse` are this crate's postcard-encoded
//! substitute envelope for the same message catalogue (register,
//! deregister, interest add/remove, event subscription, publish, query,
//! delete, shutdown) — distinct from the peer-to-peer protocol engine,
//! which transmits `DataObject` itself as its wire unit (spec §4.7).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use haggle_core::{AttributeSet, DataObject, Node, NodeType, Payload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{AppEventType, Event, EventKind, Phase};
use crate::kernel::KernelHandle;
use crate::managers::node::NodeManager;
use crate::managers::security::SecurityManager;
use crate::store::DataStore;
use haggle_net::UdpApplicationTransport;

const MANAGER_NAME: &str = "ApplicationManager";
const RECV_BUF_SIZE: usize = 65536;

/// Wire requests an application may send (spec §6's message catalogue).
#[derive(Clone, Debug, Serialize, Deserialize)]
enum AppRequest {
    Register { app_id: String },
    Deregister { app_id: String },
    RegisterInterest { app_id: String, attributes: AttributeSet },
    RemoveInterest { app_id: String, attributes: AttributeSet },
    GetInterests { app_id: String },
    RegisterEventInterest { app_id: String, events: Vec<u8> },
    Publish { app_id: String, attributes: AttributeSet, payload: Vec<u8> },
    GetDataObjects { app_id: String },
    DeleteDataObject { app_id: String, id: [u8; 20] },
    Shutdown { app_id: String },
}

/// Wire replies and asynchronous event notifications sent back to an
/// application (spec §6 "Event notifications to apps").
#[derive(Clone, Debug, Serialize, Deserialize)]
enum AppResponse {
    Registered,
    AlreadyRegistered,
    Interests { attributes: AttributeSet },
    DataObject { id: [u8; 20], attributes: AttributeSet, payload: Vec<u8> },
    NeighbourUpdate { node_id: String, up: bool },
    Shutdown,
    Ack,
    Error { message: String },
}

impl AppResponse {
    fn from_object(object: &DataObject) -> Self {
        AppResponse::DataObject {
            id: *object.id(),
            attributes: object.attributes().clone(),
            payload: object.payload().inline_bytes().map(|b| b.to_vec()).unwrap_or_default(),
        }
    }
}

struct AppRecord {
    addr: SocketAddr,
    interests: AttributeSet,
    events: HashSet<u8>,
}

impl AppRecord {
    fn new(addr: SocketAddr) -> Self {
        Self { addr, interests: AttributeSet::new(), events: HashSet::new() }
    }

    fn wants(&self, event: AppEventType) -> bool {
        self.events.contains(&(event as u8))
    }
}

pub struct ApplicationManager {
    handle: KernelHandle,
    store: Arc<dyn DataStore>,
    node_manager: Arc<NodeManager>,
    security: Arc<SecurityManager>,
    transport: Arc<UdpApplicationTransport>,
    apps: RwLock<HashMap<String, AppRecord>>,
}

impl ApplicationManager {
    pub fn new(
        handle: KernelHandle,
        store: Arc<dyn DataStore>,
        node_manager: Arc<NodeManager>,
        security: Arc<SecurityManager>,
        transport: Arc<UdpApplicationTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            store,
            node_manager,
            security,
            transport,
            apps: RwLock::new(HashMap::new()),
        })
    }

    async fn reply(&self, addr: SocketAddr, response: &AppResponse) {
        let Ok(bytes) = postcard::to_allocvec(response) else {
            return;
        };
        if let Err(e) = self.transport.send_to(addr, &bytes).await {
            debug!(%addr, error = %e, "application: failed to deliver reply");
        }
    }

    /// The union of every registered app's interests, folded into thisNode's
    /// own attributes (spec §4.3: "thisNode's attributes mirror the union of
    /// every locally registered application's interest set").
    fn union_of_all_interests(&self) -> AttributeSet {
        let apps = self.apps.read();
        apps.values().fold(AttributeSet::new(), |acc, app| acc.union(&app.interests))
    }

    fn sync_this_node_interests(&self) {
        let union = self.union_of_all_interests();
        if self.node_manager.set_attributes(union) {
            self.handle.publish(Event::NodeDescriptionSend);
        }
    }

    /// Register a new application node, or, for an id already registered,
    /// reply `already_registered` and leave existing state untouched (spec
    /// §4.3 "Replying to an already-registered id returns reply(\"Already
    /// registered\")"; §7 lists this as the `registration_in_use` failure
    /// kind, and §8 scenario 5 requires it deliver nothing on the retry).
    async fn handle_register(&self, app_id: String, addr: SocketAddr) {
        {
            let mut apps = self.apps.write();
            if apps.contains_key(&app_id) {
                drop(apps);
                debug!(app_id, %addr, "application: registration_in_use");
                return self.reply(addr, &AppResponse::AlreadyRegistered).await;
            }
            apps.insert(app_id.clone(), AppRecord::new(addr));
        }
        debug!(app_id, %addr, "application: registered");
        self.reply(addr, &AppResponse::Registered).await;
    }

    async fn handle_deregister(&self, app_id: &str, addr: SocketAddr) {
        self.apps.write().remove(app_id);
        self.store.delete_filter(app_id);
        self.sync_this_node_interests();
        self.reply(addr, &AppResponse::Ack).await;
    }

    async fn handle_register_interest(&self, app_id: &str, attributes: AttributeSet, addr: SocketAddr) {
        let updated = {
            let mut apps = self.apps.write();
            let Some(app) = apps.get_mut(app_id) else {
                return self.reply(addr, &AppResponse::Error { message: "not registered".into() }).await;
            };
            app.interests = app.interests.union(&attributes);
            app.interests.clone()
        };

        match self.store.insert_filter(app_id, updated, true) {
            Ok(matches) => {
                for object in matches {
                    self.reply(addr, &AppResponse::from_object(&object)).await;
                }
            }
            Err(e) => warn!(app_id, error = %e, "application: failed to register interest filter"),
        }
        self.sync_this_node_interests();
        self.reply(addr, &AppResponse::Ack).await;
    }

    async fn handle_remove_interest(&self, app_id: &str, attributes: AttributeSet, addr: SocketAddr) {
        let updated = {
            let mut apps = self.apps.write();
            let Some(app) = apps.get_mut(app_id) else {
                return self.reply(addr, &AppResponse::Error { message: "not registered".into() }).await;
            };
            for attr in attributes.iter() {
                app.interests.remove(attr);
            }
            app.interests.clone()
        };

        if let Err(e) = self.store.insert_filter(app_id, updated, false) {
            warn!(app_id, error = %e, "application: failed to update interest filter");
        }
        self.sync_this_node_interests();
        self.reply(addr, &AppResponse::Ack).await;
    }

    async fn handle_get_interests(&self, app_id: &str, addr: SocketAddr) {
        let attributes = self.apps.read().get(app_id).map(|a| a.interests.clone()).unwrap_or_default();
        self.reply(addr, &AppResponse::Interests { attributes }).await;
    }

    async fn handle_register_event_interest(&self, app_id: &str, events: Vec<u8>, addr: SocketAddr) {
        if let Some(app) = self.apps.write().get_mut(app_id) {
            app.events.extend(events);
        }
        self.reply(addr, &AppResponse::Ack).await;
    }

    async fn handle_publish(&self, attributes: AttributeSet, payload: Vec<u8>, addr: SocketAddr) {
        let payload = if payload.is_empty() { Payload::None } else { Payload::Inline(payload) };
        let mut object = DataObject::new(attributes, payload);
        object.bookkeeping.for_local_app = true;
        object.bookkeeping.mark_received("application");
        self.security.sign_if_needed(&mut object);
        object.mark_verified(true);
        self.handle.publish(Event::DataObjectVerified { object: Arc::new(object), from_node: None });
        self.reply(addr, &AppResponse::Ack).await;
    }

    async fn handle_get_dataobjects(&self, app_id: &str, addr: SocketAddr) {
        let interests = self.apps.read().get(app_id).map(|a| a.interests.clone()).unwrap_or_default();
        let query_node = Node::new(NodeType::Application, app_id, interests);
        match self.store.do_dataobject_query(&query_node, query_node.max_objects_per_match()) {
            Ok(matches) => {
                for object in matches {
                    self.reply(addr, &AppResponse::from_object(&object)).await;
                }
            }
            Err(e) => warn!(app_id, error = %e, "application: data object query failed"),
        }
    }

    async fn handle_delete_dataobject(&self, id: [u8; 20], addr: SocketAddr) {
        match self.store.delete_dataobject(&id) {
            Ok(()) => self.reply(addr, &AppResponse::Ack).await,
            Err(e) => {
                warn!(error = %e, "application: delete failed");
                self.reply(addr, &AppResponse::Error { message: e.to_string() }).await;
            }
        }
    }

    async fn handle_shutdown_request(&self, addr: SocketAddr) {
        self.handle.request_shutdown();
        self.reply(addr, &AppResponse::Ack).await;
    }

    async fn dispatch(&self, request: AppRequest, addr: SocketAddr) {
        match request {
            AppRequest::Register { app_id } => self.handle_register(app_id, addr).await,
            AppRequest::Deregister { app_id } => self.handle_deregister(&app_id, addr).await,
            AppRequest::RegisterInterest { app_id, attributes } => self.handle_register_interest(&app_id, attributes, addr).await,
            AppRequest::RemoveInterest { app_id, attributes } => self.handle_remove_interest(&app_id, attributes, addr).await,
            AppRequest::GetInterests { app_id } => self.handle_get_interests(&app_id, addr).await,
            AppRequest::RegisterEventInterest { app_id, events } => self.handle_register_event_interest(&app_id, events, addr).await,
            AppRequest::Publish { attributes, payload, .. } => self.handle_publish(attributes, payload, addr).await,
            AppRequest::GetDataObjects { app_id } => self.handle_get_dataobjects(&app_id, addr).await,
            AppRequest::DeleteDataObject { id, .. } => self.handle_delete_dataobject(id, addr).await,
            AppRequest::Shutdown { .. } => self.handle_shutdown_request(addr).await,
        }
    }

    async fn fan_out_new_object(&self, object: &Arc<DataObject>) {
        let targets: Vec<SocketAddr> = self
            .apps
            .read()
            .values()
            .filter(|app| app.wants(AppEventType::NewDataObject) && object.attributes().matches_any(&app.interests))
            .map(|app| app.addr)
            .collect();
        for addr in targets {
            self.reply(addr, &AppResponse::from_object(object)).await;
        }
    }

    async fn fan_out_neighbour_update(&self, node_id: &str, up: bool) {
        let targets: Vec<SocketAddr> =
            self.apps.read().values().filter(|app| app.wants(AppEventType::NeighbourUpdate)).map(|app| app.addr).collect();
        for addr in targets {
            self.reply(addr, &AppResponse::NeighbourUpdate { node_id: node_id.to_string(), up }).await;
        }
    }

    async fn notify_shutdown(&self) {
        let targets: Vec<SocketAddr> =
            self.apps.read().values().filter(|app| app.wants(AppEventType::Shutdown)).map(|app| app.addr).collect();
        for addr in targets {
            self.reply(addr, &AppResponse::Shutdown).await;
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.handle.subscribe(&[
            EventKind::NeighbourUp,
            EventKind::NeighbourDown,
            EventKind::DataObjectNew,
            EventKind::PrepareShutdown,
            EventKind::Shutdown,
        ]);
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        loop {
            tokio::select! {
                biased;
                datagram = self.transport.recv(&mut buf) => {
                    match datagram {
                        Ok((frame, addr)) => {
                            match postcard::from_bytes::<AppRequest>(&frame.payload) {
                                Ok(request) => self.dispatch(request, addr).await,
                                Err(e) => debug!(%addr, error = %e, "application: malformed request"),
                            }
                        }
                        Err(e) => warn!(error = %e, "application: udp receive failed"),
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        Event::NeighbourUp { node_id, .. } => self.fan_out_neighbour_update(&node_id, true).await,
                        Event::NeighbourDown { node_id } => self.fan_out_neighbour_update(&node_id, false).await,
                        Event::DataObjectNew { object } => self.fan_out_new_object(&object).await,
                        Event::PrepareShutdown => {
                            self.notify_shutdown().await;
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeState, SecurityLevel};
    use crate::kernel::Kernel;
    use crate::node_store::NodeStore;
    use crate::store::SledDataStore;
    use haggle_core::Attribute;
    use tempfile::tempdir;

    async fn fixture() -> (Arc<ApplicationManager>, KernelHandle, SocketAddr, tokio::net::UdpSocket) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let security = SecurityManager::load_or_create(handle.clone(), store.clone(), SecurityLevel::Low).unwrap();
        let nodes = Arc::new(NodeStore::new());
        let node_manager = NodeManager::new(handle.clone(), store.clone(), nodes, security.clone(), NodeState::default());
        let transport = Arc::new(UdpApplicationTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let daemon_addr = transport.local_addr().unwrap();
        let mgr = ApplicationManager::new(handle.clone(), store, node_manager, security, transport);

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(daemon_addr).await.unwrap();
        (mgr, handle, daemon_addr, client)
    }

    async fn send(client: &tokio::net::UdpSocket, request: &AppRequest) {
        let bytes = postcard::to_allocvec(request).unwrap();
        client.send(&bytes).await.unwrap();
    }

    async fn recv(client: &tokio::net::UdpSocket) -> AppResponse {
        let mut buf = [0u8; 65536];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
        postcard::from_bytes(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn register_then_interest_returns_ack() {
        let (mgr, handle, _addr, client) = fixture().await;
        let runner = tokio::spawn(mgr.clone().run());

        send(&client, &AppRequest::Register { app_id: "weather-app".into() }).await;
        assert!(matches!(recv(&client).await, AppResponse::Registered));

        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", "weather"));
        send(&client, &AppRequest::RegisterInterest { app_id: "weather-app".into(), attributes: attrs }).await;
        assert!(matches!(recv(&client).await, AppResponse::Ack));

        assert!(mgr.node_manager.this_node().attributes().iter().any(|a| a.value == "weather"));

        handle.publish(Event::PrepareShutdown);
        handle.publish(Event::Shutdown);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn publish_reaches_a_subscribed_app() {
        let (mgr, handle, _addr, client) = fixture().await;
        let runner = tokio::spawn(mgr.clone().run());

        send(&client, &AppRequest::Register { app_id: "sink".into() }).await;
        let _ = recv(&client).await;

        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", "weather"));
        send(&client, &AppRequest::RegisterInterest { app_id: "sink".into(), attributes: attrs }).await;
        let _ = recv(&client).await; // Ack
        send(&client, &AppRequest::RegisterEventInterest { app_id: "sink".into(), events: vec![AppEventType::NewDataObject as u8] }).await;
        let _ = recv(&client).await; // Ack

        let mut publish_attrs = AttributeSet::new();
        publish_attrs.insert(Attribute::new("Topic", "weather"));
        send(&client, &AppRequest::Publish { app_id: "publisher".into(), attributes: publish_attrs, payload: b"42F".to_vec() }).await;
        let _ = recv(&client).await; // Ack for the publish

        let delivered = recv(&client).await;
        match delivered {
            AppResponse::DataObject { payload, .. } => assert_eq!(payload, b"42F"),
            other => panic!("expected DataObject delivery, got {other:?}"),
        }

        handle.publish(Event::PrepareShutdown);
        handle.publish(Event::Shutdown);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn second_registration_of_the_same_app_id_is_rejected() {
        let (mgr, handle, _addr, client) = fixture().await;
        let runner = tokio::spawn(mgr.clone().run());

        send(&client, &AppRequest::Register { app_id: "weather-app".into() }).await;
        assert!(matches!(recv(&client).await, AppResponse::Registered));

        send(&client, &AppRequest::Register { app_id: "weather-app".into() }).await;
        assert!(matches!(recv(&client).await, AppResponse::AlreadyRegistered));
        assert_eq!(mgr.apps.read().len(), 1);

        handle.publish(Event::PrepareShutdown);
        handle.publish(Event::Shutdown);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn shutdown_control_message_triggers_kernel_shutdown() {
        let (mgr, handle, _addr, client) = fixture().await;
        let runner = tokio::spawn(mgr.clone().run());

        send(&client, &AppRequest::Shutdown { app_id: "anyone".into() }).await;
        assert!(matches!(recv(&client).await, AppResponse::Ack));

        handle.publish(Event::PrepareShutdown);
        handle.publish(Event::Shutdown);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), runner).await;
    }
}
