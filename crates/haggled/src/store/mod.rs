//! The data-store contract (spec §4.2 "Data Store"): asynchronous
//! persistence and matching, consumed by every manager. The production
//! SQL-backed store is an explicit Non-goal; `SledDataStore` is this
//! daemon's concrete substitute, built the way `gossipd::storage::Storage`
//! wraps `sled` — one tree per concern, postcard-encoded values.

mod sled_store;

use haggle_core::{AttributeSet, DataObject, Node, NodeType};
use thiserror::Error;

pub use sled_store::SledDataStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("core error: {0}")]
    Core(#[from] haggle_core::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A `(authority, key, value)` triple (spec §4.2/§6). `authority` is
/// typically a manager name (`SecurityManager`, `DataManager`) or a
/// forwarding module name, scoping keys the way the original's repository
/// does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub authority: String,
    pub key: String,
    pub value: String,
}

/// Result of an aging pass (spec §4.5): how many objects were deleted, their
/// ids (so the caller can drop them from the local Bloom filter and
/// republish thisNode), and whether the store's own batch cap was the
/// reason the pass stopped short (the data manager re-arms immediately
/// rather than waiting a full period when this is `true`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgeResult {
    pub deleted: usize,
    pub deleted_ids: Vec<[u8; 20]>,
    pub hit_batch_cap: bool,
}

/// Outcome of a single-object insert: the object as stored, with
/// `bookkeeping.is_duplicate` set if an object with the same id already
/// existed (spec §4.2 invariant 2: a colliding insert never replaces the
/// stored copy).
pub struct InsertOutcome {
    pub object: DataObject,
}

/// The asynchronous persistence and matching contract every manager talks
/// to. Implemented synchronously by `SledDataStore` (sled calls are local
/// and fast, matching the teacher's direct-call pattern); callers that want
/// the original's off-thread semantics run these through
/// `KernelHandle::run_blocking`.
pub trait DataStore: Send + Sync {
    fn insert_dataobject(&self, object: DataObject) -> StoreResult<InsertOutcome>;
    fn delete_dataobject(&self, id: &[u8; 20]) -> StoreResult<()>;
    fn get_dataobject(&self, id: &[u8; 20]) -> StoreResult<Option<DataObject>>;

    fn insert_node(&self, node: Node) -> StoreResult<()>;
    fn retrieve_node_by_id(&self, id: &str) -> StoreResult<Option<Node>>;
    fn retrieve_node_by_interface(&self, interface_id: &str) -> StoreResult<Option<Node>>;
    fn retrieve_nodes_by_type(&self, node_type: NodeType) -> StoreResult<Vec<Node>>;
    fn all_nodes(&self) -> StoreResult<Vec<Node>>;

    /// Register (or replace) `owner`'s interest filter. If
    /// `match_immediately`, returns every currently stored persistent object
    /// that resolves against `attrs` right now (spec §4.2 invariant 1); the
    /// filter then continues to apply to objects inserted afterwards via
    /// whatever mechanism the caller uses to notice new inserts (here, the
    /// `DataObjectNew`/`DataObjectVerified` events on the kernel bus).
    fn insert_filter(&self, owner: &str, attrs: AttributeSet, match_immediately: bool) -> StoreResult<Vec<DataObject>>;
    fn delete_filter(&self, owner: &str);

    /// Objects resolving against `node`'s interests, weighted-match
    /// descending, capped at `node.max_objects_per_match()` (spec §4.2
    /// invariant 3).
    fn do_dataobject_query(&self, node: &Node, max: u32) -> StoreResult<Vec<DataObject>>;
    /// Nodes whose interests `object` resolves against, capped at
    /// `max_nodes`.
    fn do_node_query(&self, object: &DataObject, max_nodes: u32) -> StoreResult<Vec<Node>>;
    /// Objects `delegate` is a plausible carrier for, restricted to ones
    /// that resolve against at least one of `targets`.
    fn do_dataobject_for_nodes_query(&self, delegate: &Node, targets: &[Node]) -> StoreResult<Vec<DataObject>>;

    /// Delete persistent objects older than `max_age_secs` that no longer
    /// resolve against `interest`, up to `batch_cap` deletions in one pass.
    fn age_dataobjects(&self, interest: &AttributeSet, max_age_secs: u64, batch_cap: usize, now: u64) -> StoreResult<AgeResult>;

    fn insert_repository(&self, authority: &str, key: &str, value: &str) -> StoreResult<()>;
    /// Every entry under `authority` (spec §4.2 invariant 4).
    fn read_repository(&self, authority: &str) -> StoreResult<Vec<RepositoryEntry>>;
    fn delete_repository(&self, authority: &str, key: &str) -> StoreResult<()>;

    fn flush(&self) -> StoreResult<()>;
}
