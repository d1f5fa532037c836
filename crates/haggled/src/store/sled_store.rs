//! `sled`-backed `DataStore` implementation (spec §4.2).

use std::path::Path;

use haggle_core::{AttributeSet, DataObject, Node, NodeType};
use parking_lot::RwLock;
use sled::Db;
use std::collections::HashMap;

use super::{AgeResult, DataStore, InsertOutcome, RepositoryEntry, StoreError, StoreResult};

/// Weighted match score between a node's interests and an object's
/// attributes: sum of interest weights for every attribute of `object` that
/// resolves against one of `node`'s interests. Mirrors the original
/// `DataManager`'s match-ranking, used to order `do_dataobject_query`
/// results "weighted-match descending" (spec §4.2 invariant 3).
fn match_weight(interests: &AttributeSet, object: &DataObject) -> u32 {
    object
        .attributes()
        .iter()
        .filter_map(|attr| {
            interests
                .iter()
                .find(|interest| interest.matches(attr))
                .map(|interest| interest.weight)
        })
        .sum()
}

pub struct SledDataStore {
    db: Db,
    dataobjects: sled::Tree,
    nodes: sled::Tree,
    repository: sled::Tree,
    filters: RwLock<HashMap<String, AttributeSet>>,
}

impl SledDataStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        let dataobjects = db.open_tree("dataobjects")?;
        let nodes = db.open_tree("nodes")?;
        let repository = db.open_tree("repository")?;
        Ok(Self {
            db,
            dataobjects,
            nodes,
            repository,
            filters: RwLock::new(HashMap::new()),
        })
    }

    /// Open a fresh, empty store at `path`, clearing anything already
    /// there (CLI's `-dd`, spec §6).
    pub fn recreate(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
        Self::open(path)
    }

    fn decode_object(bytes: &[u8]) -> StoreResult<DataObject> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn decode_node(bytes: &[u8]) -> StoreResult<Node> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn repository_key(authority: &str, key: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(authority.len() + key.len() + 1);
        buf.extend_from_slice(authority.as_bytes());
        buf.push(0);
        buf.extend_from_slice(key.as_bytes());
        buf
    }
}

impl DataStore for SledDataStore {
    fn insert_dataobject(&self, mut object: DataObject) -> StoreResult<InsertOutcome> {
        let key = *object.id();
        if self.dataobjects.contains_key(key)? {
            // Spec §4.2 invariant 2: a colliding insert never replaces the
            // stored copy, it's flagged a duplicate and handed back as-is.
            object.bookkeeping.is_duplicate = true;
            return Ok(InsertOutcome { object });
        }
        if object.bookkeeping.persistent {
            let bytes = postcard::to_allocvec(&object)?;
            self.dataobjects.insert(key, bytes)?;
        }
        Ok(InsertOutcome { object })
    }

    fn delete_dataobject(&self, id: &[u8; 20]) -> StoreResult<()> {
        self.dataobjects.remove(id)?;
        Ok(())
    }

    fn get_dataobject(&self, id: &[u8; 20]) -> StoreResult<Option<DataObject>> {
        match self.dataobjects.get(id)? {
            Some(bytes) => Ok(Some(Self::decode_object(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_node(&self, node: Node) -> StoreResult<()> {
        let bytes = postcard::to_allocvec(&node)?;
        self.nodes.insert(node.id_hex(), bytes)?;
        Ok(())
    }

    fn retrieve_node_by_id(&self, id: &str) -> StoreResult<Option<Node>> {
        match self.nodes.get(id)? {
            Some(bytes) => Ok(Some(Self::decode_node(&bytes)?)),
            None => Ok(None),
        }
    }

    fn retrieve_node_by_interface(&self, interface_id: &str) -> StoreResult<Option<Node>> {
        for result in self.nodes.iter() {
            let (_, bytes) = result?;
            let node = Self::decode_node(&bytes)?;
            if node.interfaces().iter().any(|i| i.identifier() == interface_id) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    fn retrieve_nodes_by_type(&self, node_type: NodeType) -> StoreResult<Vec<Node>> {
        let mut out = Vec::new();
        for result in self.nodes.iter() {
            let (_, bytes) = result?;
            let node = Self::decode_node(&bytes)?;
            if node.node_type() == node_type {
                out.push(node);
            }
        }
        Ok(out)
    }

    fn all_nodes(&self) -> StoreResult<Vec<Node>> {
        let mut out = Vec::new();
        for result in self.nodes.iter() {
            let (_, bytes) = result?;
            out.push(Self::decode_node(&bytes)?);
        }
        Ok(out)
    }

    fn insert_filter(&self, owner: &str, attrs: AttributeSet, match_immediately: bool) -> StoreResult<Vec<DataObject>> {
        self.filters.write().insert(owner.to_string(), attrs.clone());
        if !match_immediately {
            return Ok(Vec::new());
        }
        let mut matches = Vec::new();
        for result in self.dataobjects.iter() {
            let (_, bytes) = result?;
            let object = Self::decode_object(&bytes)?;
            if object.attributes().matches_any(&attrs) {
                matches.push(object);
            }
        }
        Ok(matches)
    }

    fn delete_filter(&self, owner: &str) {
        self.filters.write().remove(owner);
    }

    fn do_dataobject_query(&self, node: &Node, max: u32) -> StoreResult<Vec<DataObject>> {
        let mut scored: Vec<(u32, DataObject)> = Vec::new();
        for result in self.dataobjects.iter() {
            let (_, bytes) = result?;
            let object = Self::decode_object(&bytes)?;
            if node.resolves(&object) {
                let weight = match_weight(node.attributes(), &object);
                scored.push((weight, object));
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(max as usize);
        Ok(scored.into_iter().map(|(_, o)| o).collect())
    }

    fn do_node_query(&self, object: &DataObject, max_nodes: u32) -> StoreResult<Vec<Node>> {
        let mut out = Vec::new();
        for result in self.nodes.iter() {
            let (_, bytes) = result?;
            let node = Self::decode_node(&bytes)?;
            if node.resolves(object) {
                out.push(node);
                if out.len() >= max_nodes as usize {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn do_dataobject_for_nodes_query(&self, delegate: &Node, targets: &[Node]) -> StoreResult<Vec<DataObject>> {
        let mut out = Vec::new();
        for result in self.dataobjects.iter() {
            let (_, bytes) = result?;
            let object = Self::decode_object(&bytes)?;
            if targets.iter().any(|t| t.resolves(&object)) && delegate.resolves(&object) {
                out.push(object);
            }
        }
        Ok(out)
    }

    fn age_dataobjects(&self, interest: &AttributeSet, max_age_secs: u64, batch_cap: usize, now: u64) -> StoreResult<AgeResult> {
        let mut result = AgeResult::default();
        let mut to_delete = Vec::new();
        for entry in self.dataobjects.iter() {
            let (key, bytes) = entry?;
            let object = Self::decode_object(&bytes)?;
            let age = object
                .bookkeeping
                .receive_time
                .map(|t| now.saturating_sub(t))
                .unwrap_or(0);
            let still_wanted = object.attributes().matches_any(interest);
            if age > max_age_secs && !still_wanted {
                to_delete.push((key.to_vec(), *object.id()));
                if to_delete.len() >= batch_cap {
                    result.hit_batch_cap = true;
                    break;
                }
            }
        }
        for (key, _id) in &to_delete {
            self.dataobjects.remove(key)?;
        }
        result.deleted = to_delete.len();
        result.deleted_ids = to_delete.into_iter().map(|(_, id)| id).collect();
        Ok(result)
    }

    fn insert_repository(&self, authority: &str, key: &str, value: &str) -> StoreResult<()> {
        self.repository.insert(Self::repository_key(authority, key), value.as_bytes())?;
        Ok(())
    }

    fn read_repository(&self, authority: &str) -> StoreResult<Vec<RepositoryEntry>> {
        let mut prefix = authority.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for entry in self.repository.scan_prefix(&prefix) {
            let (full_key, value) = entry?;
            let key = String::from_utf8_lossy(&full_key[prefix.len()..]).to_string();
            let value = String::from_utf8_lossy(&value).to_string();
            out.push(RepositoryEntry {
                authority: authority.to_string(),
                key,
                value,
            });
        }
        Ok(out)
    }

    fn delete_repository(&self, authority: &str, key: &str) -> StoreResult<()> {
        self.repository.remove(Self::repository_key(authority, key))?;
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::{Attribute, Payload};
    use tempfile::tempdir;

    fn obj(topic: &str) -> DataObject {
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("Topic", topic));
        DataObject::new(attrs, Payload::None)
    }

    #[test]
    fn duplicate_insert_is_flagged_not_replaced() {
        let dir = tempdir().unwrap();
        let store = SledDataStore::open(dir.path()).unwrap();
        let a = obj("weather");
        let outcome1 = store.insert_dataobject(a.clone()).unwrap();
        assert!(!outcome1.object.bookkeeping.is_duplicate);
        let outcome2 = store.insert_dataobject(a).unwrap();
        assert!(outcome2.object.bookkeeping.is_duplicate);
    }

    #[test]
    fn non_persistent_object_is_not_saved() {
        let dir = tempdir().unwrap();
        let store = SledDataStore::open(dir.path()).unwrap();
        let mut attrs = AttributeSet::new();
        attrs.insert(Attribute::new("NodeDescription", "abc"));
        let nd = DataObject::node_description(attrs);
        let id = *nd.id();
        store.insert_dataobject(nd).unwrap();
        assert!(store.get_dataobject(&id).unwrap().is_none());
    }

    #[test]
    fn filter_match_immediately_returns_existing_matches() {
        let dir = tempdir().unwrap();
        let store = SledDataStore::open(dir.path()).unwrap();
        store.insert_dataobject(obj("weather")).unwrap();
        store.insert_dataobject(obj("sports")).unwrap();

        let mut interest = AttributeSet::new();
        interest.insert(Attribute::wildcard("Topic"));
        let matches = store.insert_filter("app-1", interest, true).unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn repository_round_trip_scoped_by_authority() {
        let dir = tempdir().unwrap();
        let store = SledDataStore::open(dir.path()).unwrap();
        store.insert_repository("SecurityManager", "privkey", "abc").unwrap();
        store.insert_repository("Prophet", "peer-b", "0.75:100").unwrap();

        let sec = store.read_repository("SecurityManager").unwrap();
        assert_eq!(sec.len(), 1);
        assert_eq!(sec[0].key, "privkey");

        let prophet = store.read_repository("Prophet").unwrap();
        assert_eq!(prophet.len(), 1);
    }

    #[test]
    fn aging_deletes_stale_uninteresting_objects() {
        let dir = tempdir().unwrap();
        let store = SledDataStore::open(dir.path()).unwrap();
        let mut stale = obj("gossip");
        stale.bookkeeping.mark_received("eth0");
        stale.bookkeeping.receive_time = Some(0);
        store.insert_dataobject(stale).unwrap();

        let empty_interest = AttributeSet::new();
        let result = store.age_dataobjects(&empty_interest, 10, 100, 1_000_000).unwrap();
        assert_eq!(result.deleted, 1);
    }
}
