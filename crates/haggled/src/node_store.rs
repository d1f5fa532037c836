//! In-memory node and interface stores (spec §5 "Shared resources": "The
//! node store and interface store are mutexed containers"). Both cache what
//! `SledDataStore` persists so managers can look a neighbour up without a
//! round trip through `run_blocking` on every packet; writes go through to
//! the data store separately wherever persistence actually matters (spec
//! §1: "no persistent subscription semantics beyond what is rebuilt from
//! the local store at startup" — the cache itself is disposable).

use std::collections::HashMap;

use haggle_core::{Bloomfilter, BloomfilterParams, Interface, InterfaceStatus, Node};
use parking_lot::RwLock;

fn fresh_peer_bloomfilter() -> Bloomfilter {
    let params = BloomfilterParams::default();
    let (m, k) = params.optimize();
    let salts = (0..k).map(|i| 0x5DEECE66Du64.wrapping_mul(i as u64 + 1)).collect();
    Bloomfilter::with_shape(m, k, salts).expect("default bloomfilter params are always valid")
}

/// Before/after activity, so a caller can tell whether an upsert just made a
/// node a neighbour, just lost one, or changed nothing about reachability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivityTransition {
    pub was_active: bool,
    pub is_active: bool,
}

impl ActivityTransition {
    pub fn became_neighbour(&self) -> bool {
        !self.was_active && self.is_active
    }
    pub fn lost_neighbour(&self) -> bool {
        self.was_active && !self.is_active
    }
}

#[derive(Default)]
pub struct NodeStore {
    nodes: RwLock<HashMap<String, Node>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the node store's initial contents at startup (spec §4.3
    /// "Startup: after the data store replays stored application nodes...").
    pub fn seed(&self, nodes: Vec<Node>) {
        let mut map = self.nodes.write();
        for node in nodes {
            map.insert(node.id_hex(), node);
        }
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.nodes.read().get(id).cloned()
    }

    pub fn get_by_interface(&self, interface_id: &str) -> Option<Node> {
        self.nodes
            .read()
            .values()
            .find(|n| n.interfaces().iter().any(|i| i.identifier() == interface_id))
            .cloned()
    }

    pub fn by_type(&self, node_type: haggle_core::NodeType) -> Vec<Node> {
        self.nodes.read().values().filter(|n| n.node_type() == node_type).cloned().collect()
    }

    /// Insert or replace a node record, reporting the activity transition
    /// this causes so the caller can decide whether to raise
    /// `NeighbourUp`/`NeighbourDown`.
    pub fn upsert(&self, node: Node) -> ActivityTransition {
        let mut map = self.nodes.write();
        let was_active = map.get(&node.id_hex()).map(|n| n.is_active()).unwrap_or(false);
        let is_active = node.is_active();
        map.insert(node.id_hex(), node);
        ActivityTransition { was_active, is_active }
    }

    pub fn remove(&self, id: &str) -> Option<Node> {
        self.nodes.write().remove(id)
    }

    /// Record that `node_id` is now known to hold `object_id` (spec §4.5
    /// step 1: "if the sender is a non-application peer, add the object id
    /// to that peer's Bloom filter"). A no-op if the node isn't cached.
    pub fn note_object_held(&self, node_id: &str, object_id: &[u8; 20]) {
        let mut map = self.nodes.write();
        if let Some(node) = map.get_mut(node_id) {
            if node.bloomfilter().is_none() {
                node.set_bloomfilter(fresh_peer_bloomfilter());
            }
            if let Some(bf) = node.bloomfilter_mut() {
                bf.add(object_id);
            }
        }
    }

    pub fn neighbours(&self) -> Vec<Node> {
        self.nodes.read().values().filter(|n| n.is_active()).cloned().collect()
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

/// Maps a local or remote interface identifier to the node it belongs to,
/// letting the protocol engine and node manager ask "who is on the other
/// end of this socket" without scanning every node.
#[derive(Default)]
pub struct InterfaceStore {
    owners: RwLock<HashMap<String, String>>,
    local: RwLock<HashMap<String, Interface>>,
}

impl InterfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_owner(&self, interface_id: impl Into<String>, node_id: impl Into<String>) {
        self.owners.write().insert(interface_id.into(), node_id.into());
    }

    pub fn owner_of(&self, interface_id: &str) -> Option<String> {
        self.owners.read().get(interface_id).cloned()
    }

    pub fn forget(&self, interface_id: &str) {
        self.owners.write().remove(interface_id);
    }

    pub fn add_local(&self, iface: Interface) {
        self.local.write().insert(iface.identifier().to_string(), iface);
    }

    pub fn set_local_status(&self, identifier: &str, status: InterfaceStatus) {
        if let Some(iface) = self.local.write().get_mut(identifier) {
            iface.set_status(status);
        }
    }

    pub fn local_interfaces(&self) -> Vec<Interface> {
        self.local.read().values().cloned().collect()
    }

    pub fn is_local(&self, identifier: &str) -> bool {
        self.local.read().contains_key(identifier)
    }
}
