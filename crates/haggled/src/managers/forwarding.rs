//! Forwarding Manager (spec §4.6): node-query coalescing around neighbour
//! contact/update events plus a pluggable forwarder module (spec §4.8) that
//! scores delegates for the targets a neighbour can't reach directly.
//!
//! Grounded on `ForwardingManager.cpp`'s reactive event set
//! (`NODE_CONTACT_NEW`/`NODE_UPDATED`/`NODE_CONTACT_END`/`DATAOBJECT_NEW`)
//! and its `setForwardingModule` repository-driven module selection
//! (SPEC_FULL.md §2); the send-dedup table follows `NodeManager`'s
//! `inflight`/`PendingPush` pattern, with the retry count captured before
//! the map entry is erased rather than read afterwards (REDESIGN FLAGS:
//! the original logs `(*it).second.retries` after `erase(it)`, which is
//! undefined behaviour on most STL implementations).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use haggle_core::{Attribute, AttributeSet, DataObject, Node, Payload};
use haggle_prophet::{Forwarder, ForwarderEmpty, ForwarderProphet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{now_unix, Event, EventKind, Phase};
use crate::kernel::KernelHandle;
use crate::managers::node::NodeManager;
use crate::node_store::NodeStore;
use crate::store::DataStore;

const MANAGER_NAME: &str = "ForwardingManager";
const MODULE_AUTHORITY: &str = "ForwardingManager";
const MODULE_KEY: &str = "module";
const EMPTY_MODULE: &str = "Empty";
const FORWARDING_ATTR: &str = "Forwarding";
const DELAYED_QUERY_DELAY: Duration = Duration::from_secs(5);
const PERIODIC_QUERY_INTERVAL: Duration = Duration::from_secs(300);
const DATAOBJECT_NEW_MAX_NODES: u32 = 10;

/// Wire shape of a routing-information object's payload: the sender's own
/// node id plus every metric it's willing to advertise (spec §4.8
/// "addRoutingInformation").
#[derive(Serialize, Deserialize)]
struct RibPayload {
    node_id: String,
    metrics: Vec<(String, f64)>,
}

struct ForwardAttempt {
    retries: u32,
}

pub struct ForwardingManager {
    handle: KernelHandle,
    store: Arc<dyn DataStore>,
    nodes: Arc<NodeStore>,
    node_manager: Arc<NodeManager>,
    module_name: &'static str,
    forwarder: Mutex<Box<dyn Forwarder>>,
    /// In-flight `(object, node)` sends, suppressing duplicate queueing
    /// until the protocol engine reports success or final failure (spec
    /// §4.6 "forwardedObjects").
    forwarded: Mutex<HashMap<([u8; 20], String), ForwardAttempt>>,
    /// Neighbours with a delayed query still pending; a `NodeUpdated` for
    /// the same node cancels it by removing the entry before it fires.
    pending_delayed: Mutex<HashSet<String>>,
    last_queried: Mutex<HashMap<String, u64>>,
}

impl ForwardingManager {
    pub fn new(handle: KernelHandle, store: Arc<dyn DataStore>, nodes: Arc<NodeStore>, node_manager: Arc<NodeManager>) -> anyhow::Result<Arc<Self>> {
        let selected = store
            .read_repository(MODULE_AUTHORITY)?
            .into_iter()
            .find(|e| e.key == MODULE_KEY)
            .map(|e| e.value)
            .unwrap_or_default();

        let mut forwarder: Box<dyn Forwarder> = if selected == EMPTY_MODULE {
            Box::new(ForwarderEmpty)
        } else {
            Box::new(ForwarderProphet::default())
        };
        let module_name = forwarder.name();

        for entry in store.read_repository(module_name)? {
            // A wrong-module entry simply fails to parse and is ignored
            // (spec §4.8); `read_repository` is already scoped to this
            // module's own authority so that case doesn't arise here.
            forwarder.restore_state(&entry.key, &entry.value);
        }
        store.insert_repository(MODULE_AUTHORITY, MODULE_KEY, module_name)?;

        Ok(Arc::new(Self {
            handle,
            store,
            nodes,
            node_manager,
            module_name,
            forwarder: Mutex::new(forwarder),
            forwarded: Mutex::new(HashMap::new()),
            pending_delayed: Mutex::new(HashSet::new()),
            last_queried: Mutex::new(HashMap::new()),
        }))
    }

    fn build_rib_object(&self, metrics: Vec<haggle_prophet::RoutingMetric>) -> DataObject {
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new(FORWARDING_ATTR, self.module_name));
        let payload = RibPayload {
            node_id: self.node_manager.id_hex(),
            metrics: metrics.into_iter().map(|m| (m.node_id, m.p)).collect(),
        };
        let bytes = postcard::to_allocvec(&payload).expect("rib payload always serializes");
        let mut object = DataObject::new(attrs, Payload::Inline(bytes));
        object.bookkeeping.persistent = false;
        object
    }

    /// Whether `object` should be offered to `node` at all (spec §4.6):
    /// never to the node a node-description object describes, and never
    /// to a node whose carried-objects filter already reports it.
    fn should_forward(&self, object: &DataObject, node: &Node) -> bool {
        if object.bookkeeping.is_node_description {
            let describes_node = object
                .attributes()
                .get_all(super::node::NODE_DESCRIPTION_ATTR)
                .iter()
                .any(|a| a.value == node.id_hex());
            if describes_node {
                return false;
            }
        }
        if let Some(bf) = node.bloomfilter() {
            if bf.has(object.id()) {
                return false;
            }
        }
        true
    }

    fn queue_forward(&self, object: Arc<DataObject>, node_id: String) {
        let key = (*object.id(), node_id.clone());
        let mut forwarded = self.forwarded.lock();
        if forwarded.contains_key(&key) {
            return;
        }
        forwarded.insert(key, ForwardAttempt { retries: 0 });
        drop(forwarded);
        self.handle.publish(Event::SendRequest { object, node_id });
    }

    fn handle_sent(&self, object_id: [u8; 20], node_id: &str) {
        if let Some(attempt) = self.forwarded.lock().remove(&(object_id, node_id.to_string())) {
            debug!(node_id, retries = attempt.retries, "forwarding: delivered");
        }
    }

    fn handle_send_failure(&self, object_id: [u8; 20], node_id: &str) {
        let key = (object_id, node_id.to_string());
        let mut forwarded = self.forwarded.lock();
        let Some(mut attempt) = forwarded.remove(&key) else {
            return;
        };
        // Capture the retry count before the entry is gone; nothing below
        // may read `attempt` through the map again.
        let retries = attempt.retries;
        if retries >= 1 {
            debug!(node_id, retries, "forwarding: delivery failed after retry, giving up");
            return;
        }
        attempt.retries += 1;
        forwarded.insert(key.clone(), attempt);
        drop(forwarded);

        match self.store.get_dataobject(&object_id) {
            Ok(Some(object)) => {
                self.handle.publish(Event::SendRequest { object: Arc::new(object), node_id: node_id.to_string() });
            }
            _ => {
                self.forwarded.lock().remove(&key);
            }
        }
    }

    /// Objects resolving against `node_id`'s interests: direct neighbours
    /// get them straight away, others only via a delegate.
    fn run_query_for_node(&self, node_id: &str) {
        let Some(node) = self.nodes.get(node_id) else { return };
        if !node.is_active() {
            return;
        }
        match self.store.do_dataobject_query(&node, node.max_objects_per_match()) {
            Ok(objects) => {
                for object in objects {
                    if self.should_forward(&object, &node) {
                        self.queue_forward(Arc::new(object), node_id.to_string());
                    }
                }
            }
            Err(e) => warn!(node_id, error = %e, "forwarding: per-neighbour data object query failed"),
        }
        self.last_queried.lock().insert(node_id.to_string(), now_unix());
    }

    fn handle_node_contact_new(&self, node_id: &str) {
        let now = now_unix();
        let metrics = {
            let mut forwarder = self.forwarder.lock();
            forwarder.new_neighbor(node_id, now);
            forwarder.routing_information_to_advertise(now)
        };
        if !metrics.is_empty() {
            let rib = self.build_rib_object(metrics);
            self.handle.publish(Event::SendRequest { object: Arc::new(rib), node_id: node_id.to_string() });
        }
        self.pending_delayed.lock().insert(node_id.to_string());
        self.handle.schedule_after(DELAYED_QUERY_DELAY, Event::DelayedForwardingQuery { node_id: node_id.to_string() });
    }

    fn handle_node_updated(&self, node_id: &str) {
        // A real description update supersedes whatever delayed query was
        // still pending for this node.
        self.pending_delayed.lock().remove(node_id);
        self.run_query_for_node(node_id);
    }

    fn handle_node_contact_end(&self, node_id: &str) {
        self.pending_delayed.lock().remove(node_id);
        self.forwarder.lock().end_neighbor(node_id, now_unix());
    }

    fn handle_delayed_query(&self, node_id: &str) {
        if self.pending_delayed.lock().remove(node_id) {
            self.run_query_for_node(node_id);
        }
    }

    fn handle_periodic_query(&self) {
        let now = now_unix();
        for node in self.nodes.neighbours() {
            let id = node.id_hex();
            let due = self
                .last_queried
                .lock()
                .get(&id)
                .map(|last| now.saturating_sub(*last) >= PERIODIC_QUERY_INTERVAL.as_secs())
                .unwrap_or(true);
            if due {
                self.run_query_for_node(&id);
            }
        }
        self.handle.schedule_after(PERIODIC_QUERY_INTERVAL, Event::PeriodicForwardingQuery);
    }

    fn handle_data_object_new(&self, object: &Arc<DataObject>) {
        if !object.attributes().get_all(FORWARDING_ATTR).is_empty() {
            self.handle_routing_information(object);
            return;
        }

        if self.nodes.neighbours().is_empty() {
            return;
        }
        let candidates = match self.store.do_node_query(object, DATAOBJECT_NEW_MAX_NODES) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "forwarding: node query for new object failed");
                return;
            }
        };
        let neighbour_ids: Vec<String> = self.nodes.neighbours().iter().map(|n| n.id_hex()).collect();
        let now = now_unix();
        for candidate in candidates {
            if candidate.is_active() {
                if self.should_forward(object, &candidate) {
                    self.queue_forward(object.clone(), candidate.id_hex());
                }
                continue;
            }
            let delegates = self.forwarder.lock().delegates_for(&candidate.id_hex(), &neighbour_ids, now);
            for delegate in delegates {
                let Some(delegate_node) = self.nodes.get(&delegate.node_id) else { continue };
                if self.should_forward(object, &delegate_node) {
                    self.queue_forward(object.clone(), delegate.node_id);
                }
            }
        }
    }

    fn handle_routing_information(&self, object: &DataObject) {
        let Some(bytes) = object.payload().inline_bytes() else { return };
        let Ok(payload) = postcard::from_bytes::<RibPayload>(bytes) else {
            warn!("forwarding: routing-information payload did not decode");
            return;
        };
        if payload.node_id == self.node_manager.id_hex() {
            return;
        }
        let reported: HashMap<String, f64> = payload.metrics.into_iter().collect();
        self.forwarder.lock().new_routing_information(&payload.node_id, &reported, now_unix());
    }

    fn persist_state(&self) {
        let entries = self.forwarder.lock().save_state();
        for (node_id, value) in entries {
            if let Err(e) = self.store.insert_repository(self.module_name, &node_id, &value) {
                warn!(error = %e, "forwarding: failed to persist forwarder state");
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.handle.subscribe(&[
            EventKind::NodeContactNew,
            EventKind::NodeUpdated,
            EventKind::NodeContactEnd,
            EventKind::DataObjectNew,
            EventKind::DelayedForwardingQuery,
            EventKind::PeriodicForwardingQuery,
            EventKind::DataObjectSent,
            EventKind::DataObjectSendFailure,
            EventKind::PrepareShutdown,
            EventKind::Shutdown,
        ]);

        self.handle.schedule_after(PERIODIC_QUERY_INTERVAL, Event::PeriodicForwardingQuery);

        while let Some(event) = rx.recv().await {
            match event {
                Event::NodeContactNew { node_id } => self.handle_node_contact_new(&node_id),
                Event::NodeUpdated { node_id } => self.handle_node_updated(&node_id),
                Event::NodeContactEnd { node_id } => self.handle_node_contact_end(&node_id),
                Event::DataObjectNew { object } => self.handle_data_object_new(&object),
                Event::DelayedForwardingQuery { node_id } => self.handle_delayed_query(&node_id),
                Event::PeriodicForwardingQuery => self.handle_periodic_query(),
                Event::DataObjectSent { object_id, node_id } => self.handle_sent(object_id, &node_id),
                Event::DataObjectSendFailure { object_id, node_id, .. } => self.handle_send_failure(object_id, &node_id),
                Event::PrepareShutdown => {
                    self.persist_state();
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
    use crate::store::SledDataStore;
    use haggle_core::{AttributeSet, Interface, InterfaceStatus, InterfaceType, NodeType};
    use tempfile::tempdir;

    fn peer_with_up_interface(name: &str) -> Node {
        let mut node = Node::new(NodeType::Peer, name, AttributeSet::new());
        let mut iface = Interface::new(InterfaceType::Ethernet, name);
        iface.set_status(InterfaceStatus::Up);
        node.add_interface(iface);
        node
    }

    fn fixture() -> (Arc<ForwardingManager>, KernelHandle, Arc<NodeStore>, Arc<dyn DataStore>) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let security = SecurityManager::load_or_create(handle.clone(), store.clone(), SecurityLevel::Low).unwrap();
        let nodes = Arc::new(NodeStore::new());
        let node_manager = NodeManager::new(handle.clone(), store.clone(), nodes.clone(), security, NodeState::default());
        let mgr = ForwardingManager::new(handle.clone(), store.clone(), nodes.clone(), node_manager).unwrap();
        (mgr, handle, nodes, store)
    }

    #[test]
    fn defaults_to_prophet_module() {
        let (mgr, _handle, _nodes, store) = fixture();
        assert_eq!(mgr.module_name, "Prophet");
        let entries = store.read_repository(MODULE_AUTHORITY).unwrap();
        assert!(entries.iter().any(|e| e.key == MODULE_KEY && e.value == "Prophet"));
    }

    #[test]
    fn honours_empty_module_selection_from_repository() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        store.insert_repository(MODULE_AUTHORITY, MODULE_KEY, EMPTY_MODULE).unwrap();
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let security = SecurityManager::load_or_create(handle.clone(), store.clone(), SecurityLevel::Low).unwrap();
        let nodes = Arc::new(NodeStore::new());
        let node_manager = NodeManager::new(handle.clone(), store.clone(), nodes.clone(), security, NodeState::default());
        let mgr = ForwardingManager::new(handle, store, nodes, node_manager).unwrap();
        assert_eq!(mgr.module_name, "Empty");
    }

    #[tokio::test]
    async fn node_contact_new_schedules_a_coalesced_delayed_query() {
        let (mgr, _handle, nodes, _store) = fixture();
        nodes.upsert(peer_with_up_interface("peer-a"));

        mgr.handle_node_contact_new("peer-a");
        assert!(mgr.pending_delayed.lock().contains("peer-a"));

        mgr.handle_node_updated("peer-a");
        assert!(!mgr.pending_delayed.lock().contains("peer-a"));
    }

    #[tokio::test]
    async fn data_object_new_queues_a_send_to_a_matching_neighbour() {
        let (mgr, handle, nodes, store) = fixture();
        let mut interests = AttributeSet::new();
        interests.insert(Attribute::new("Topic", "weather"));
        let mut peer = Node::new(NodeType::Peer, "peer-a", interests);
        let mut iface = Interface::new(InterfaceType::Ethernet, "peer-a");
        iface.set_status(InterfaceStatus::Up);
        peer.add_interface(iface);
        store.insert_node(peer.clone()).unwrap();
        nodes.upsert(peer);

        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", "weather"));
        let object = Arc::new(DataObject::new(attrs, Payload::None));

        let mut send_rx = handle.subscribe(&[EventKind::SendRequest]);
        mgr.handle_data_object_new(&object);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), send_rx.recv()).await.unwrap().unwrap();
        match event {
            Event::SendRequest { node_id, .. } => assert_eq!(node_id, "peer-a"),
            _ => panic!("expected SendRequest"),
        }
    }

    #[tokio::test]
    async fn send_failure_is_retried_once_then_dropped() {
        let (mgr, _handle, _nodes, store) = fixture();
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", "weather"));
        let object = DataObject::new(attrs, Payload::None);
        let object_id = *object.id();
        store.insert_dataobject(object.clone()).unwrap();

        mgr.queue_forward(Arc::new(object), "peer-a".to_string());
        assert!(mgr.forwarded.lock().contains_key(&(object_id, "peer-a".to_string())));

        mgr.handle_send_failure(object_id, "peer-a");
        assert!(mgr.forwarded.lock().contains_key(&(object_id, "peer-a".to_string())));

        mgr.handle_send_failure(object_id, "peer-a");
        assert!(!mgr.forwarded.lock().contains_key(&(object_id, "peer-a".to_string())));
    }

    #[test]
    fn routing_information_updates_the_forwarder() {
        let (mgr, _handle, nodes, _store) = fixture();
        nodes.upsert(peer_with_up_interface("peer-b"));
        mgr.forwarder.lock().new_neighbor("peer-b", 100);

        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new(FORWARDING_ATTR, "Prophet"));
        let payload = RibPayload {
            node_id: "peer-b".to_string(),
            metrics: vec![("target".to_string(), 0.9)],
        };
        let bytes = postcard::to_allocvec(&payload).unwrap();
        let object = DataObject::new(attrs, Payload::Inline(bytes));

        mgr.handle_routing_information(&object);
        let delegates = mgr.forwarder.lock().delegates_for("target", &["peer-b".to_string()], 100);
        assert_eq!(delegates.len(), 1);
    }
}
