//! Narrow interfaces to the content-addressed object store and the local
//! reference database. The replication core never touches storage formats;
//! it inserts and reads opaque payloads by id and walks commit parent links.

mod memory;

pub use memory::{MemObjectStore, MemRefStore};

use crate::error::StoreError;
use ketch_types::{CommitData, ObjectId, RefTarget, RefUpdate};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

/// Kind tag of a stored object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Commit,
    Tree,
}

impl ObjectKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
        }
    }
}

/// Content-addressed object storage.
///
/// `insert` hashes the payload and returns its id; inserting identical
/// content is idempotent. Writes become durable (visible to readers who hold
/// only the id) no later than `flush`.
pub trait ObjectStore: Send + Sync {
    fn insert(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, StoreError>;

    fn read(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError>;

    fn contains(&self, id: &ObjectId) -> bool;

    fn flush(&self) -> Result<(), StoreError>;
}

/// The local repository's reference database.
pub trait RefStore: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<RefTarget>, StoreError>;

    /// Snapshot of all directly-valued references. Symbolic references are
    /// not advertised.
    fn advertised(&self) -> Result<BTreeMap<String, ObjectId>, StoreError>;

    /// Apply each command in order, recording a per-command result. Commands
    /// whose expected old value mismatches fail with `LockFailure` without
    /// affecting the others. Returns whether every command succeeded.
    fn update_batch(&self, commands: &mut [RefUpdate]) -> Result<bool, StoreError>;
}

/// A repository as seen by the replication core: objects plus references.
#[derive(Clone)]
pub struct Repository {
    pub objects: Arc<dyn ObjectStore>,
    pub refs: Arc<dyn RefStore>,
}

impl Repository {
    /// Fresh repository backed by the bundled in-memory stores.
    pub fn in_memory() -> Self {
        Repository {
            objects: Arc::new(MemObjectStore::new()),
            refs: Arc::new(MemRefStore::new()),
        }
    }
}

pub fn insert_commit(store: &dyn ObjectStore, commit: &CommitData) -> Result<ObjectId, StoreError> {
    store.insert(ObjectKind::Commit, &commit.encode())
}

pub fn read_commit(store: &dyn ObjectStore, id: &ObjectId) -> Result<CommitData, StoreError> {
    let (kind, data) = store.read(id)?;
    if kind != ObjectKind::Commit {
        return Err(StoreError::Corrupt(format!(
            "{} is a {}, expected a commit",
            id.short(),
            kind.tag()
        )));
    }
    Ok(CommitData::decode(&data)?)
}

/// Whether `ancestor` is reachable from `tip` through parent links
/// (inclusive: a commit is its own ancestor). Objects missing from the local
/// store terminate their branch of the walk.
pub fn is_ancestor(store: &dyn ObjectStore, ancestor: &ObjectId, tip: &ObjectId) -> bool {
    if ancestor.is_zero() || tip.is_zero() {
        return false;
    }
    let mut seen = HashSet::new();
    let mut frontier = VecDeque::new();
    frontier.push_back(*tip);
    while let Some(id) = frontier.pop_front() {
        if id == *ancestor {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Ok(commit) = read_commit(store, &id) {
            frontier.extend(commit.parents);
        }
    }
    false
}

/// Reduce a set of commit ids to its tips: the commits not reachable from
/// any other commit in the set.
pub fn reduce_to_tips(store: &dyn ObjectStore, ids: &[ObjectId]) -> Vec<ObjectId> {
    let mut covered = HashSet::new();
    for id in ids {
        let mut frontier: VecDeque<ObjectId> = match read_commit(store, id) {
            Ok(commit) => commit.parents.into(),
            Err(_) => continue,
        };
        let mut seen = HashSet::new();
        while let Some(next) = frontier.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            covered.insert(next);
            if let Ok(commit) = read_commit(store, &next) {
                frontier.extend(commit.parents);
            }
        }
    }
    ids.iter()
        .filter(|id| !covered.contains(*id))
        .copied()
        .collect()
}
