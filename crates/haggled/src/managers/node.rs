//! Node Manager (spec §4.4): owns `thisNode` and the node-description
//! exchange protocol.
//!
//! Grounded on `NodeManager.cpp`'s push-on-contact / push-on-interest-change
//! behaviour and its retry-tracked send queue. The full node record (id,
//! name, interfaces, attributes, Bloom filter) travels as the description
//! object's payload (postcard bytes) rather than as a metadata tree the way
//! the original's XML encoding does; the receiver-side match still goes
//! through the `NodeDescription=<id>` attribute spec §6 names, the same
//! thing an XML-based receiver would filter on.
//!
//! Direct-vs-third-party classification (spec §4.4 step 2) normally reads
//! "did this arrive on one of the described node's own advertised
//! interfaces"; here it reads "did `DataObjectVerified` carry a `from_node`
//! equal to the node being described" — the two checks answer the same
//! question (did we get this straight from the node itself, or did someone
//! else relay it), and `from_node` is what the protocol engine can actually
//! tell us without extra interface bookkeeping this crate hasn't wired up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use haggle_core::{Attribute, AttributeSet, BloomfilterParams, CountingBloomfilter, DataObject, Node, NodeType, Payload};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::NodeState;
use crate::event::{Event, EventKind, Phase};
use crate::kernel::KernelHandle;
use crate::managers::security::SecurityManager;
use crate::node_store::NodeStore;
use crate::store::DataStore;

pub const NODE_DESCRIPTION_ATTR: &str = "NodeDescription";
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(10);
const MANAGER_NAME: &str = "NodeManager";

struct PendingPush {
    attempts: u32,
    object: Arc<DataObject>,
}

pub struct NodeManager {
    handle: KernelHandle,
    store: Arc<dyn DataStore>,
    nodes: Arc<NodeStore>,
    security: Arc<SecurityManager>,
    this_node: RwLock<Node>,
    /// The carried-objects filter thisNode advertises to peers. Kept as a
    /// counting filter locally (aging needs to remove an id again, which a
    /// plain OR-only filter can't do) and projected to a plain `Bloomfilter`
    /// only when a description object is actually built for the wire.
    local_filter: Mutex<CountingBloomfilter>,
    inflight: Mutex<HashMap<(String, [u8; 20]), PendingPush>>,
    retries: u32,
    retry_wait: Duration,
}

fn bloomfilter_salts(k: u32) -> Vec<u64> {
    (0..k).map(|i| 0x9E3779B97F4A7C15u64.wrapping_mul(i as u64 + 1)).collect()
}

fn fresh_counting_filter() -> CountingBloomfilter {
    let params = BloomfilterParams::default();
    let (_, k) = params.optimize();
    CountingBloomfilter::new(params, bloomfilter_salts(k)).expect("default bloomfilter params are always valid")
}

impl NodeManager {
    pub fn new(handle: KernelHandle, store: Arc<dyn DataStore>, nodes: Arc<NodeStore>, security: Arc<SecurityManager>, state: NodeState) -> Arc<Self> {
        let mut this_node = Node::with_id(security.node_id(), NodeType::ThisNode, state.name, AttributeSet::new());
        this_node.set_matching_threshold(state.matching_threshold);
        this_node.set_max_objects_per_match(state.max_objects_per_match);

        Arc::new(Self {
            handle,
            store,
            nodes,
            security,
            this_node: RwLock::new(this_node),
            local_filter: Mutex::new(fresh_counting_filter()),
            inflight: Mutex::new(HashMap::new()),
            retries: DEFAULT_RETRIES,
            retry_wait: DEFAULT_RETRY_WAIT,
        })
    }

    /// Whether `id` is already reflected in the carried-objects filter
    /// thisNode advertises (the data manager calls this before deciding
    /// whether an insert needs to update it).
    pub fn local_filter_has(&self, id: &[u8]) -> bool {
        self.local_filter.lock().has(id)
    }

    pub fn add_to_local_filter(&self, id: &[u8]) {
        self.local_filter.lock().add(id);
    }

    pub fn remove_from_local_filter(&self, id: &[u8]) {
        self.local_filter.lock().remove(id);
    }

    /// Advance thisNode's description version without changing anything
    /// else (spec §4.4/§4.5 `-c` flag: some deployments want every Bloom
    /// filter update to count as a new, strictly-newer description).
    pub fn bump_create_time(&self) {
        let mut node = self.this_node.write();
        let t = node.create_time() + 1;
        node.set_create_time(t);
    }

    pub fn this_node(&self) -> Node {
        self.this_node.read().clone()
    }

    pub fn id_hex(&self) -> String {
        self.this_node.read().id_hex()
    }

    /// Replace thisNode's attribute set (the Application Manager calls this
    /// when an app's interests change). Returns whether anything changed,
    /// so the caller can decide whether a broadcast is warranted.
    pub fn set_attributes(&self, attributes: AttributeSet) -> bool {
        let mut node = self.this_node.write();
        if node.attributes() == &attributes {
            return false;
        }
        let next_create_time = node.create_time() + 1;
        // ThisNode's id is a stable, key-derived identity (see `NodeManager::new`)
        // and must never be recomputed from the new attribute set.
        let mut updated = Node::with_id(*node.id(), node.node_type(), node.name(), attributes);
        updated.set_matching_threshold(node.matching_threshold());
        updated.set_max_objects_per_match(node.max_objects_per_match());
        updated.set_create_time(next_create_time);
        if let Some(bf) = node.bloomfilter() {
            updated.set_bloomfilter(bf.clone());
        }
        for iface in node.interfaces() {
            updated.add_interface(iface.clone());
        }
        *node = updated;
        true
    }

    fn build_description(&self) -> DataObject {
        let mut node = self.this_node.read().clone();
        node.set_bloomfilter(self.local_filter.lock().to_noncounting());
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new(NODE_DESCRIPTION_ATTR, node.id_hex()));
        let payload = postcard::to_allocvec(&node).expect("node always serializes");
        let mut obj = DataObject::new(attrs, Payload::Inline(payload));
        obj.bookkeeping.is_node_description = true;
        obj.bookkeeping.persistent = false;
        self.security.sign_if_needed(&mut obj);
        self.security.attach_certificate_if_description(&mut obj);
        obj
    }

    fn queue_send(&self, node_id: &str) {
        let object = self.build_description();
        self.queue_send_object(node_id, object);
    }

    fn queue_send_object(&self, node_id: &str, object: DataObject) {
        let key = (node_id.to_string(), *object.id());
        let mut inflight = self.inflight.lock();
        if inflight.contains_key(&key) {
            debug!(node_id, "node: description push already in flight, skipping");
            return;
        }
        let object = Arc::new(object);
        inflight.insert(key, PendingPush { attempts: 1, object: object.clone() });
        drop(inflight);
        self.handle.publish(Event::SendRequest { object, node_id: node_id.to_string() });
    }

    fn handle_sent(&self, object_id: [u8; 20], node_id: &str) {
        self.inflight.lock().remove(&(node_id.to_string(), object_id));
    }

    fn handle_send_failure(&self, object_id: [u8; 20], node_id: &str) {
        let key = (node_id.to_string(), object_id);
        let mut inflight = self.inflight.lock();
        let Some(mut pending) = inflight.remove(&key) else {
            return;
        };
        if pending.attempts >= self.retries {
            debug!(node_id, attempts = pending.attempts, "node: description push exhausted retries, giving up");
            return;
        }
        pending.attempts += 1;
        let attempt = pending.attempts;
        let object = pending.object.clone();
        inflight.insert(key, pending);
        drop(inflight);
        self.handle.schedule_after(
            self.retry_wait,
            Event::NodeDescriptionRetry { node_id: node_id.to_string(), object, attempt },
        );
    }

    fn retry_send(&self, node_id: &str, object: Arc<DataObject>) {
        self.handle.publish(Event::SendRequest { object, node_id: node_id.to_string() });
    }

    /// Whether `node`'s Bloom filter (the data-object ids it's known to
    /// already hold) already contains our current description's id, so
    /// pushing it again would be redundant (spec §4.4 step 1).
    fn neighbour_already_has_description(&self, node: &Node, description: &DataObject) -> bool {
        node.bloomfilter().map(|bf| bf.has(description.id())).unwrap_or(false)
    }

    fn after_update(&self, node_id: &str, transition: crate::node_store::ActivityTransition) {
        self.handle.publish(Event::NodeUpdated { node_id: node_id.to_string() });
        if transition.became_neighbour() {
            self.handle.publish(Event::NodeContactNew { node_id: node_id.to_string() });
        } else if transition.lost_neighbour() {
            self.handle.publish(Event::NodeContactEnd { node_id: node_id.to_string() });
        }
    }

    fn handle_incoming_description(&self, object: &DataObject, from_node: Option<String>) {
        let Some(payload) = object.payload().inline_bytes() else {
            warn!("node: description object carried no payload");
            return;
        };
        let Ok(described) = postcard::from_bytes::<Node>(payload) else {
            warn!("node: description payload did not decode");
            return;
        };
        let described_id = described.id_hex();

        if described_id == self.id_hex() {
            let _ = self.store.delete_dataobject(object.id());
            return;
        }

        let mut described = described;
        described.set_node_type(NodeType::Peer);

        let direct = from_node.as_deref() == Some(described_id.as_str());
        if direct {
            let transition = self.nodes.upsert(described.clone());
            let _ = self.store.insert_node(described);
            self.after_update(&described_id, transition);
            return;
        }

        match self.nodes.get(&described_id) {
            Some(existing) if existing.is_active() => {
                // We trust a live neighbour to describe itself; a relayed
                // third-party copy adds nothing here.
            }
            Some(mut existing) => {
                if existing.create_time() > described.create_time() {
                    let _ = self.store.delete_dataobject(object.id());
                    return;
                }
                if existing.merge_description(&described) {
                    let transition = self.nodes.upsert(existing.clone());
                    let _ = self.store.insert_node(existing);
                    self.after_update(&described_id, transition);
                }
            }
            None => {
                let transition = self.nodes.upsert(described.clone());
                let _ = self.store.insert_node(described);
                self.after_update(&described_id, transition);
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.handle.subscribe(&[
            EventKind::NeighbourUp,
            EventKind::NodeDescriptionSend,
            EventKind::NodeDescriptionRetry,
            EventKind::DataObjectVerified,
            EventKind::DataObjectSent,
            EventKind::DataObjectSendFailure,
            EventKind::PrepareShutdown,
            EventKind::Shutdown,
        ]);

        while let Some(event) = rx.recv().await {
            match event {
                Event::NeighbourUp { node_id, .. } => {
                    if let Some(node) = self.nodes.get(&node_id) {
                        let description = self.build_description();
                        if !self.neighbour_already_has_description(&node, &description) {
                            self.queue_send_object(&node_id, description);
                        }
                    }
                }
                Event::NodeDescriptionSend => {
                    for node in self.nodes.neighbours() {
                        self.queue_send(&node.id_hex());
                    }
                }
                Event::NodeDescriptionRetry { node_id, object, .. } => {
                    self.retry_send(&node_id, object);
                }
                Event::DataObjectVerified { object, from_node } => {
                    if object.bookkeeping.is_node_description {
                        self.handle_incoming_description(&object, from_node);
                    }
                }
                Event::DataObjectSent { object_id, node_id } => {
                    self.handle_sent(object_id, &node_id);
                }
                Event::DataObjectSendFailure { object_id, node_id, .. } => {
                    self.handle_send_failure(object_id, &node_id);
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
