//! DataObject: the unit of dissemination (spec §3 "DataObject").

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeSet;
use crate::canonical::{self, Sha1Id};
use crate::certificate::Certificate;

/// Where the object's body lives, if it has one. Objects can be metadata-only
/// (e.g. node descriptions carry no payload).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    None,
    /// Body held inline (small objects, or objects still in flight).
    Inline(Vec<u8>),
    /// Body stored externally; only the path and length travel with the
    /// object record (spec §3: "optional external payload file").
    External { path: PathBuf, length: u64 },
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::None => 0,
            Payload::Inline(bytes) => bytes.len() as u64,
            Payload::External { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Signature verification state of a data object (spec §3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Object carries no signature at all.
    Missing,
    /// Signed, but not yet checked against a trusted key.
    Unverified,
    /// Verified against a trusted signer.
    Valid,
    /// Verification failed: signature present but does not check out.
    Invalid,
}

/// Local bookkeeping carried alongside a `DataObject` but not part of its
/// content-addressed identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bookkeeping {
    /// Seen this exact object id before (duplicate of something already
    /// stored).
    pub is_duplicate: bool,
    /// Matches a registered local application's interest set.
    pub for_local_app: bool,
    /// Wall-clock time this node first received the object, seconds since
    /// epoch. `None` for objects not yet received (e.g. freshly created
    /// locally and not yet inserted into the store).
    pub receive_time: Option<u64>,
    /// Interfaces this object arrived on, accumulated across duplicate
    /// receptions on different links.
    pub origin_interfaces: Vec<String>,
    /// True for the synthetic data objects that carry a node description.
    pub is_node_description: bool,
    /// Whether the store should save this object at all (spec §3: objects
    /// with `persistent=false` are not saved and never added to the local
    /// Bloom filter). Node descriptions and PRoPHET routing-information
    /// objects are the two cases this daemon creates non-persistent.
    pub persistent: bool,
}

impl Default for Bookkeeping {
    fn default() -> Self {
        Self {
            is_duplicate: false,
            for_local_app: false,
            receive_time: None,
            origin_interfaces: Vec::new(),
            is_node_description: false,
            persistent: true,
        }
    }
}

impl Bookkeeping {
    pub fn mark_received(&mut self, interface_id: impl Into<String>) {
        if self.receive_time.is_none() {
            self.receive_time = Some(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            );
        }
        let interface_id = interface_id.into();
        if !self.origin_interfaces.contains(&interface_id) {
            self.origin_interfaces.push(interface_id);
        }
    }
}

/// A unit of dissemination: a content-addressed attribute set with an
/// optional payload. The id is a pure function of the attributes and never
/// changes once created, regardless of payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataObject {
    id: Sha1Id,
    attributes: AttributeSet,
    payload: Payload,
    signature: SignatureStatus,
    /// Raw signature bytes, if `signature != Missing`.
    signature_bytes: Option<Vec<u8>>,
    /// Id of the node that signed this object, if known.
    signed_by: Option<String>,
    /// A certificate travelling alongside the object (spec §4.9: attached
    /// to thisNode's description before sending). Kept out of `attributes`
    /// so attaching or swapping it never perturbs the content-addressed id.
    certificate: Option<Certificate>,
    pub bookkeeping: Bookkeeping,
}

impl DataObject {
    /// Build a new data object. The id is computed immediately from the
    /// attributes alone and is immutable thereafter, independent of payload.
    pub fn new(attributes: AttributeSet, payload: Payload) -> Self {
        let id = canonical::hash_attributes_sha1(&attributes);
        Self {
            id,
            attributes,
            payload,
            signature: SignatureStatus::Missing,
            signature_bytes: None,
            signed_by: None,
            certificate: None,
            bookkeeping: Bookkeeping::default(),
        }
    }

    /// A node-description data object: metadata-only, flagged accordingly,
    /// and non-persistent (spec §4.4: "Node description = a non-persistent
    /// data object").
    pub fn node_description(attributes: AttributeSet) -> Self {
        let mut obj = Self::new(attributes, Payload::None);
        obj.bookkeeping.is_node_description = true;
        obj.bookkeeping.persistent = false;
        obj
    }

    pub fn id(&self) -> &Sha1Id {
        &self.id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn signature_status(&self) -> SignatureStatus {
        self.signature
    }

    pub fn signed_by(&self) -> Option<&str> {
        self.signed_by.as_deref()
    }

    pub fn signature_bytes(&self) -> Option<&[u8]> {
        self.signature_bytes.as_deref()
    }

    /// Attach a signature, moving the object to `Unverified` until a
    /// security manager checks it against a trusted key.
    pub fn set_signature(&mut self, signer: impl Into<String>, bytes: Vec<u8>) {
        self.signed_by = Some(signer.into());
        self.signature_bytes = Some(bytes);
        self.signature = SignatureStatus::Unverified;
    }

    pub fn mark_verified(&mut self, valid: bool) {
        self.signature = if valid {
            SignatureStatus::Valid
        } else {
            SignatureStatus::Invalid
        };
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn attach_certificate(&mut self, certificate: Certificate) {
        self.certificate = Some(certificate);
    }

    /// A copy of this object with any inline payload bytes stripped, keeping
    /// only the declared length (spec §4.7: the protocol engine sends
    /// metadata first and the peer may reject before the payload itself ever
    /// goes over the wire).
    pub fn header_only(&self) -> DataObject {
        let mut header = self.clone();
        if let Payload::Inline(bytes) = &header.payload {
            let length = bytes.len() as u64;
            header.payload = Payload::External { path: PathBuf::new(), length };
        }
        header
    }

    /// Reattach payload bytes received after the peer accepted this
    /// object's header.
    pub fn attach_payload_bytes(&mut self, bytes: Vec<u8>) {
        self.payload = Payload::Inline(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;

    fn attrs() -> AttributeSet {
        let mut a = AttributeSet::new();
        a.insert(Attribute::new("Topic", "weather"));
        a
    }

    #[test]
    fn id_is_pure_function_of_attributes() {
        let a = DataObject::new(attrs(), Payload::None);
        let b = DataObject::new(attrs(), Payload::None);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn payload_does_not_change_id() {
        let a = DataObject::new(attrs(), Payload::None);
        let b = DataObject::new(attrs(), Payload::Inline(b"hi".to_vec()));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn signature_lifecycle() {
        let mut obj = DataObject::new(attrs(), Payload::None);
        assert_eq!(obj.signature_status(), SignatureStatus::Missing);
        obj.set_signature("node-a", vec![1, 2, 3]);
        assert_eq!(obj.signature_status(), SignatureStatus::Unverified);
        obj.mark_verified(true);
        assert_eq!(obj.signature_status(), SignatureStatus::Valid);
    }

    #[test]
    fn mark_received_is_idempotent_on_time_but_accumulates_interfaces() {
        let mut bk = Bookkeeping::default();
        bk.mark_received("eth0");
        let first_time = bk.receive_time;
        bk.mark_received("bt0");
        assert_eq!(bk.receive_time, first_time);
        assert_eq!(bk.origin_interfaces, vec!["eth0", "bt0"]);
    }
}
