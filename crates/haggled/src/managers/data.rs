//! Data Manager (spec §4.5): the verified-object ingest pipeline and the
//! periodic aging pass.
//!
//! Grounded on `DataManager.cpp`'s `DATAOBJECT_VERIFIED` handler: credit the
//! sender's Bloom filter, insert (duplicates flagged, never overwritten, per
//! the store contract), raise `DATAOBJECT_NEW` for anything new, and fold
//! persistent inserts into thisNode's own carried-objects filter. Aging
//! reuses the same filter bookkeeping in reverse: objects the store expires
//! come back out of the local filter too, so thisNode's next description
//! doesn't keep advertising objects it no longer holds.

use std::sync::Arc;
use std::time::Duration;

use haggle_core::{DataObject, NodeType};
use tracing::warn;

use crate::event::{now_unix, Event, EventKind, Phase};
use crate::kernel::KernelHandle;
use crate::managers::node::NodeManager;
use crate::node_store::NodeStore;
use crate::store::DataStore;

const MANAGER_NAME: &str = "DataManager";
const DEFAULT_AGE_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_MAX_AGE_SECS: u64 = 24 * 3600;
const DEFAULT_AGE_BATCH_CAP: usize = 256;

pub struct DataManager {
    handle: KernelHandle,
    store: Arc<dyn DataStore>,
    nodes: Arc<NodeStore>,
    node_manager: Arc<NodeManager>,
    /// `-c`: advance thisNode's create time on every local Bloom filter
    /// update, not just on interest changes (spec §6 CLI flags).
    bump_create_time_on_update: bool,
    age_period: Duration,
    max_age_secs: u64,
    age_batch_cap: usize,
}

impl DataManager {
    pub fn new(
        handle: KernelHandle,
        store: Arc<dyn DataStore>,
        nodes: Arc<NodeStore>,
        node_manager: Arc<NodeManager>,
        bump_create_time_on_update: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            store,
            nodes,
            node_manager,
            bump_create_time_on_update,
            age_period: DEFAULT_AGE_PERIOD,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            age_batch_cap: DEFAULT_AGE_BATCH_CAP,
        })
    }

    fn credit_sender(&self, from_node: &str, object: &DataObject) {
        let Some(sender) = self.nodes.get(from_node) else {
            return;
        };
        if sender.node_type() == NodeType::Application {
            return;
        }
        self.nodes.note_object_held(from_node, object.id());
        if let Some(updated) = self.nodes.get(from_node) {
            let _ = self.store.insert_node(updated);
        }
    }

    fn handle_verified(&self, object: Arc<DataObject>, from_node: Option<String>) {
        if let Some(from_node) = &from_node {
            self.credit_sender(from_node, &object);
        }

        let outcome = match self.store.insert_dataobject(object.as_ref().clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "data: insert failed");
                return;
            }
        };

        let is_duplicate = outcome.object.bookkeeping.is_duplicate;
        let persistent = outcome.object.bookkeeping.persistent;
        let id = *outcome.object.id();
        let stored = Arc::new(outcome.object);

        if !is_duplicate {
            self.handle.publish(Event::DataObjectNew { object: stored.clone() });
        }

        if persistent && !self.node_manager.local_filter_has(&id) {
            self.node_manager.add_to_local_filter(&id);
            if self.bump_create_time_on_update {
                self.node_manager.bump_create_time();
            }
        }
    }

    fn run_aging_pass(&self) {
        let interest = self.node_manager.this_node().attributes().clone();
        let now = now_unix();
        match self.store.age_dataobjects(&interest, self.max_age_secs, self.age_batch_cap, now) {
            Ok(result) => {
                if result.deleted > 0 {
                    for id in &result.deleted_ids {
                        self.node_manager.remove_from_local_filter(id);
                    }
                    self.handle.publish(Event::NodeDescriptionSend);
                }
                let next = if result.hit_batch_cap { Duration::from_millis(0) } else { self.age_period };
                self.handle.schedule_after(next, Event::AgingTick);
            }
            Err(e) => {
                warn!(error = %e, "data: aging pass failed");
                self.handle.schedule_after(self.age_period, Event::AgingTick);
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.handle.subscribe(&[
            EventKind::DataObjectVerified,
            EventKind::AgingTick,
            EventKind::PrepareShutdown,
            EventKind::Shutdown,
        ]);
        self.handle.schedule_after(self.age_period, Event::AgingTick);

        while let Some(event) = rx.recv().await {
            match event {
                Event::DataObjectVerified { object, from_node } => self.handle_verified(object, from_node),
                Event::AgingTick => self.run_aging_pass(),
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
    use crate::store::SledDataStore;
    use haggle_core::{Attribute, AttributeSet, Interface, InterfaceStatus, InterfaceType, Node, Payload};
    use tempfile::tempdir;

    fn fixture() -> (Arc<DataManager>, KernelHandle, Arc<dyn DataStore>, Arc<NodeStore>, Arc<NodeManager>) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let security = SecurityManager::load_or_create(handle.clone(), store.clone(), SecurityLevel::Low).unwrap();
        let nodes = Arc::new(NodeStore::new());
        let node_manager = NodeManager::new(handle.clone(), store.clone(), nodes.clone(), security, NodeState::default());
        let data_manager = DataManager::new(handle.clone(), store.clone(), nodes.clone(), node_manager.clone(), false);
        (data_manager, handle, store, nodes, node_manager)
    }

    fn object_with_topic(topic: &str) -> Arc<DataObject> {
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", topic));
        Arc::new(DataObject::new(attrs, Payload::None))
    }

    #[test]
    fn new_persistent_object_raises_new_and_updates_local_filter() {
        let (mgr, handle, _store, _nodes, node_manager) = fixture();
        let mut rx = handle.subscribe(&[EventKind::DataObjectNew]);
        let obj = object_with_topic("weather");
        let id = *obj.id();

        mgr.handle_verified(obj, None);

        assert!(node_manager.local_filter_has(&id));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn duplicate_insert_does_not_raise_new_twice() {
        let (mgr, handle, _store, _nodes, _node_manager) = fixture();
        let mut rx = handle.subscribe(&[EventKind::DataObjectNew]);
        let obj = object_with_topic("weather");

        mgr.handle_verified(obj.clone(), None);
        assert!(rx.try_recv().is_ok());

        mgr.handle_verified(obj, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_persistent_object_never_enters_local_filter() {
        let (mgr, _handle, _store, _nodes, node_manager) = fixture();
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("NodeDescription", "abc"));
        let obj = Arc::new(DataObject::node_description(attrs));
        let id = *obj.id();

        mgr.handle_verified(obj, None);
        assert!(!node_manager.local_filter_has(&id));
    }

    #[test]
    fn receiving_from_a_peer_credits_its_bloomfilter() {
        let (mgr, _handle, store, nodes, _node_manager) = fixture();
        let mut peer = Node::new(NodeType::Peer, "peer-a", AttributeSet::new());
        let mut iface = Interface::new(InterfaceType::Ethernet, "peer-a");
        iface.set_status(InterfaceStatus::Up);
        peer.add_interface(iface);
        let peer_id = peer.id_hex();
        nodes.upsert(peer);

        let obj = object_with_topic("weather");
        let object_id = *obj.id();
        mgr.handle_verified(obj, Some(peer_id.clone()));

        let cached = nodes.get(&peer_id).unwrap();
        assert!(cached.bloomfilter().unwrap().has(&object_id));
        let persisted = store.retrieve_node_by_id(&peer_id).unwrap().unwrap();
        assert!(persisted.bloomfilter().unwrap().has(&object_id));
    }

    #[test]
    fn aging_pass_removes_ids_from_local_filter() {
        let (mgr, _handle, store, _nodes, node_manager) = fixture();
        let mut obj = object_with_topic("gossip").as_ref().clone();
        obj.bookkeeping.mark_received("eth0");
        obj.bookkeeping.receive_time = Some(0);
        let id = *obj.id();
        store.insert_dataobject(obj).unwrap();
        node_manager.add_to_local_filter(&id);
        assert!(node_manager.local_filter_has(&id));

        mgr.run_aging_pass();
        assert!(!node_manager.local_filter_has(&id));
    }
}
