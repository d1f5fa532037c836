//! Metadata trees (spec §3 "Metadata")
//!
//! `Metadata` is the wire-independent intermediate form every on-wire object
//! (node descriptions, data object headers, control dictionaries) is built
//! from: an ordered tree of named nodes, each carrying optional text content,
//! a set of `(key, value)` parameters with unique keys, and an ordered list
//! of children. The original encodes this tree as XML; that encoder is out
//! of scope here (spec Non-goals), so `MetadataCodec` is the pluggable seam
//! and `PostcardCodec` is the concrete substitute that ships in this crate,
//! satisfying the round-trip property of spec §8 without claiming to be a
//! production XML codec.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known node names for the shapes this daemon builds and reads
/// (§6's node-description table): `NodeDescription`'s children.
pub mod names {
    pub const NODE: &str = "Node";
    pub const INTERFACE: &str = "Interface";
    pub const ATTR: &str = "Attr";
    pub const BLOOMFILTER: &str = "Bloomfilter";
}

/// A single node in a metadata tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    name: String,
    content: Option<String>,
    parameters: HashMap<String, String>,
    children: Vec<Metadata>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            parameters: HashMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::new(name);
        m.content = Some(content.into());
        m
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
    }

    /// Set a parameter. Parameter keys are unique per node: a second call
    /// with the same key overwrites, matching the original's attribute-map
    /// semantics (no duplicate-key error surfaces here, only at decode time
    /// for malformed wire data).
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn add_child(&mut self, child: Metadata) {
        self.children.push(child);
    }

    pub fn children(&self) -> &[Metadata] {
        &self.children
    }

    /// First child with the given name, if any.
    pub fn child(&self, name: &str) -> Option<&Metadata> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name, in tree order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Metadata> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// A node is complete if it has content or at least one child (spec §3:
    /// a `Metadata` with neither is malformed).
    pub fn is_complete(&self) -> bool {
        self.content.is_some() || !self.children.is_empty()
    }

    pub fn require_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(Error::MetadataIncomplete(self.name.clone()))
        }
    }
}

/// A pluggable wire encoding for `Metadata`. The production daemon's XML
/// encoder lives outside this crate's scope; implement this trait to plug
/// one in.
pub trait MetadataCodec {
    fn encode(&self, metadata: &Metadata) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Metadata>;
}

/// The in-repo codec: deterministic, self-describing postcard bytes. Not the
/// production XML wire form, but round-trips exactly, which is all spec §8
/// requires of a codec at this seam.
#[derive(Clone, Copy, Debug, Default)]
pub struct PostcardCodec;

impl MetadataCodec for PostcardCodec {
    fn encode(&self, metadata: &Metadata) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(metadata)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Metadata> {
        postcard::from_bytes(bytes).map_err(|e| Error::MetadataDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_postcard_codec() {
        let mut root = Metadata::new(names::NODE);
        root.set_parameter("id", "abc123");
        let mut iface = Metadata::with_content(names::INTERFACE, "eth0");
        iface.set_parameter("type", "ethernet");
        root.add_child(iface);
        root.add_child(Metadata::with_content(names::ATTR, "Topic=weather"));

        let codec = PostcardCodec;
        let bytes = codec.encode(&root).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(root, decoded);
    }

    #[test]
    fn incomplete_node_rejected() {
        let empty = Metadata::new("Empty");
        assert!(!empty.is_complete());
        assert!(empty.require_complete().is_err());
    }

    #[test]
    fn child_lookup_by_name() {
        let mut root = Metadata::new(names::NODE);
        root.add_child(Metadata::with_content(names::ATTR, "a=1"));
        root.add_child(Metadata::with_content(names::ATTR, "a=2"));
        assert_eq!(root.children_named(names::ATTR).count(), 2);
        assert_eq!(root.child(names::ATTR).unwrap().content(), Some("a=1"));
    }

    #[test]
    fn parameter_set_overwrites() {
        let mut node = Metadata::new("x");
        node.set_parameter("k", "1");
        node.set_parameter("k", "2");
        assert_eq!(node.parameter("k"), Some("2"));
    }
}
