//! Node: this daemon's view of itself, an application, or a peer
//! (spec §3 "Node", §4.4 Node Manager).

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeSet;
use crate::bloomfilter::Bloomfilter;
use crate::canonical::{self, Sha1Id};
use crate::dataobject::DataObject;
use crate::interface::Interface;

/// Default resolution threshold: how many matching attributes a data object
/// needs before it resolves against a node's interests (`NodeManager.cpp`).
pub const DEFAULT_MATCHING_THRESHOLD: u32 = 1;
/// Default cap on data objects delivered per resolution pass
/// (`ForwardingManager.cpp`).
pub const DEFAULT_MAX_OBJECTS_PER_MATCH: u32 = 5;

/// What role a `Node` record plays (`NodeType_t` in the original).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeType {
    /// This daemon's own identity.
    ThisNode,
    /// A locally registered application.
    Application,
    /// A remote peer reached over a network interface.
    Peer,
    /// A remote peer reached only through another peer (no direct
    /// interface), kept distinct so forwarding can target it without
    /// expecting a direct connection.
    Gateway,
}

/// This daemon's, an application's, or a peer's identity and state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    id: Sha1Id,
    node_type: NodeType,
    name: String,
    attributes: AttributeSet,
    interfaces: Vec<Interface>,
    bloomfilter: Option<Bloomfilter>,
    matching_threshold: u32,
    max_objects_per_match: u32,
    /// Monotonically increasing version of this node's description;
    /// compared on merge so older third-party descriptions never overwrite
    /// newer local knowledge.
    create_time: u64,
}

impl Node {
    pub fn new(node_type: NodeType, name: impl Into<String>, attributes: AttributeSet) -> Self {
        let id = canonical::hash_attributes_sha1(&attributes);
        Self {
            id,
            node_type,
            name: name.into(),
            attributes,
            interfaces: Vec::new(),
            bloomfilter: None,
            matching_threshold: DEFAULT_MATCHING_THRESHOLD,
            max_objects_per_match: DEFAULT_MAX_OBJECTS_PER_MATCH,
            create_time: 0,
        }
    }

    /// Construct a node with a caller-supplied, explicit id rather than one
    /// derived from its attributes. `ThisNode`'s identity must stay stable
    /// across interest changes, so it is built from the security manager's
    /// key-derived id instead of going through `Node::new`.
    pub fn with_id(id: Sha1Id, node_type: NodeType, name: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            id,
            node_type,
            name: name.into(),
            attributes,
            interfaces: Vec::new(),
            bloomfilter: None,
            matching_threshold: DEFAULT_MATCHING_THRESHOLD,
            max_objects_per_match: DEFAULT_MAX_OBJECTS_PER_MATCH,
            create_time: 0,
        }
    }

    pub fn id(&self) -> &Sha1Id {
        &self.id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.node_type = node_type;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn create_time(&self) -> u64 {
        self.create_time
    }

    pub fn set_create_time(&mut self, t: u64) {
        self.create_time = t;
    }

    pub fn matching_threshold(&self) -> u32 {
        self.matching_threshold
    }

    pub fn set_matching_threshold(&mut self, n: u32) {
        self.matching_threshold = n;
    }

    pub fn max_objects_per_match(&self) -> u32 {
        self.max_objects_per_match
    }

    pub fn set_max_objects_per_match(&mut self, n: u32) {
        self.max_objects_per_match = n;
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn add_interface(&mut self, iface: Interface) {
        if !self.interfaces.iter().any(|i| i.id() == iface.id()) {
            self.interfaces.push(iface);
        }
    }

    pub fn bloomfilter(&self) -> Option<&Bloomfilter> {
        self.bloomfilter.as_ref()
    }

    pub fn bloomfilter_mut(&mut self) -> Option<&mut Bloomfilter> {
        self.bloomfilter.as_mut()
    }

    pub fn set_bloomfilter(&mut self, bf: Bloomfilter) {
        self.bloomfilter = Some(bf);
    }

    /// A node is active if at least one of its interfaces is up.
    pub fn is_active(&self) -> bool {
        self.interfaces.iter().any(|i| i.is_up())
    }

    /// Count of attributes in `object` that resolve against this node's
    /// interests.
    pub fn matches(&self, object: &DataObject) -> u32 {
        object
            .attributes()
            .iter()
            .filter(|a| self.attributes.iter().any(|interest| interest.matches(a)))
            .count() as u32
    }

    /// Whether `object` resolves against this node (match count at or above
    /// the threshold).
    pub fn resolves(&self, object: &DataObject) -> bool {
        self.matches(object) >= self.matching_threshold
    }

    /// Merge a third-party node description into this record. Equal create
    /// times carry no new information and are rejected (strict `>`, per the
    /// REDESIGN FLAGS note): only a description strictly newer than what we
    /// already have replaces attributes, interfaces, and the Bloom filter.
    pub fn merge_description(&mut self, other: &Node) -> bool {
        if other.create_time <= self.create_time {
            return false;
        }
        self.attributes = other.attributes.clone();
        self.create_time = other.create_time;
        for iface in &other.interfaces {
            self.add_interface(iface.clone());
        }
        if let Some(incoming_bf) = &other.bloomfilter {
            match &mut self.bloomfilter {
                // Same shape: OR the incoming bits in rather than discarding
                // what we already knew the node held (spec §4.4: a merge
                // never loses bits the existing record already had).
                Some(existing) if existing.merge(incoming_bf).is_ok() => {}
                _ => self.bloomfilter = Some(incoming_bf.clone()),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::interface::InterfaceType;

    fn node_with(topic: &str) -> Node {
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", topic));
        Node::new(NodeType::Peer, "peer-a", attrs)
    }

    #[test]
    fn matches_counts_overlap() {
        let mut node = node_with("weather");
        node.set_matching_threshold(1);
        let mut obj_attrs = AttributeSet::new();
        obj_attrs.insert(Attribute::new("Topic", "weather"));
        let object = DataObject::new(obj_attrs, crate::dataobject::Payload::None);
        assert!(node.resolves(&object));
    }

    #[test]
    fn merge_rejects_equal_create_time() {
        let mut local = node_with("weather");
        local.set_create_time(10);
        let mut incoming = node_with("sports");
        incoming.set_create_time(10);
        assert!(!local.merge_description(&incoming));
        assert!(local.attributes().iter().any(|a| a.value == "weather"));
    }

    #[test]
    fn merge_accepts_strictly_newer() {
        let mut local = node_with("weather");
        local.set_create_time(10);
        let mut incoming = node_with("sports");
        incoming.set_create_time(11);
        assert!(local.merge_description(&incoming));
        assert!(local.attributes().iter().any(|a| a.value == "sports"));
    }

    #[test]
    fn merge_unions_bloomfilter_bits_instead_of_replacing() {
        use crate::bloomfilter::{Bloomfilter, BloomfilterParams};

        let mut local = node_with("weather");
        local.set_create_time(10);
        let mut local_bf = Bloomfilter::new(BloomfilterParams { error_rate: 0.01, capacity: 100 }, vec![1, 2, 3]).unwrap();
        local_bf.add(b"x");
        local.set_bloomfilter(local_bf);

        let mut incoming = node_with("sports");
        incoming.set_create_time(11);
        let mut incoming_bf = Bloomfilter::with_shape(local.bloomfilter().unwrap().m(), local.bloomfilter().unwrap().k(), vec![1, 2, 3]).unwrap();
        incoming_bf.add(b"y");
        incoming.set_bloomfilter(incoming_bf);

        assert!(local.merge_description(&incoming));
        let merged = local.bloomfilter().unwrap();
        assert!(merged.has(b"x"));
        assert!(merged.has(b"y"));
    }

    #[test]
    fn active_requires_an_up_interface() {
        let mut node = node_with("x");
        assert!(!node.is_active());
        let mut iface = Interface::new(InterfaceType::Ethernet, "eth0");
        iface.set_status(crate::interface::InterfaceStatus::Up);
        node.add_interface(iface);
        assert!(node.is_active());
    }
}
