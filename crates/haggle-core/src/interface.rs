//! Interface: a network attachment point a node can be reached on
//! (spec §3 "Interface"). Detecting interfaces (platform sockets,
//! connectivity probing) is out of scope here; this module only models the
//! record once something else has discovered it.

use serde::{Deserialize, Serialize};

use crate::canonical::{self, Blake3Id, DOMAIN_INTERFACE};

/// The transport family an interface represents. `NODE_METADATA_INTERFACE_TYPE_PARAM`
/// in the original carries the same distinction as a free-form string;
/// here it's a closed enum since the daemon only ever drives these three.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Ethernet,
    Bluetooth,
    Application,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Ethernet => "ethernet",
            InterfaceType::Bluetooth => "bluetooth",
            InterfaceType::Application => "application",
        }
    }
}

/// Up/down status of an interface. A node is active if it has at least one
/// interface `Up`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum InterfaceStatus {
    Up,
    Down,
}

/// A network attachment point: a type plus an opaque address identifier
/// (MAC, Bluetooth address, local socket path).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    id: Blake3Id,
    kind: InterfaceType,
    identifier: String,
    status: InterfaceStatus,
}

impl Interface {
    pub fn new(kind: InterfaceType, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let id = canonical::blake3_domain(
            DOMAIN_INTERFACE,
            format!("{}:{identifier}", kind.as_str()).as_bytes(),
        );
        Self {
            id,
            kind,
            identifier,
            status: InterfaceStatus::Down,
        }
    }

    pub fn id(&self) -> &Blake3Id {
        &self.id
    }

    pub fn kind(&self) -> InterfaceType {
        self.kind
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn status(&self) -> InterfaceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: InterfaceStatus) {
        self.status = status;
    }

    pub fn is_up(&self) -> bool {
        self.status == InterfaceStatus::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_and_identifier_produce_same_id() {
        let a = Interface::new(InterfaceType::Ethernet, "aa:bb:cc:dd:ee:ff");
        let b = Interface::new(InterfaceType::Ethernet, "aa:bb:cc:dd:ee:ff");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn different_type_changes_id_even_with_same_identifier() {
        let a = Interface::new(InterfaceType::Ethernet, "x");
        let b = Interface::new(InterfaceType::Bluetooth, "x");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn starts_down() {
        let iface = Interface::new(InterfaceType::Application, "app:42");
        assert!(!iface.is_up());
    }
}
