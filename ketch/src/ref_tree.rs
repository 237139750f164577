use crate::error::StoreError;
use crate::store::{ObjectKind, ObjectStore};
use ketch_types::{ObjectId, RefTarget, RefUpdate, UpdateResult};
use std::collections::{BTreeMap, HashSet};

/// In-memory view of every reference in the repository.
///
/// The tree is the unit of replication: each accepted commit's tree object is
/// the serialized form of one of these. `apply` is all-or-nothing: on any
/// rejected command the tree is left untouched and the offending command
/// carries the reason in its result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefTree {
    refs: BTreeMap<String, RefTarget>,
}

impl RefTree {
    pub fn empty() -> Self {
        RefTree::default()
    }

    /// Load the tree object at `tree_id`.
    pub fn read_from(store: &dyn ObjectStore, tree_id: &ObjectId) -> Result<Self, StoreError> {
        let (kind, data) = store.read(tree_id)?;
        if kind != ObjectKind::Tree {
            return Err(StoreError::Corrupt(format!(
                "{} is a {}, expected a tree",
                tree_id.short(),
                kind.tag()
            )));
        }
        let text = std::str::from_utf8(&data)
            .map_err(|_| StoreError::Corrupt("tree is not utf-8".to_string()))?;
        let mut refs = BTreeMap::new();
        for line in text.lines() {
            let target = if let Some(rest) = line.strip_prefix("ref ") {
                let (hex, name) = rest
                    .split_once(' ')
                    .ok_or_else(|| StoreError::Corrupt(format!("bad tree line: {line}")))?;
                (name, RefTarget::Id(ObjectId::from_hex(hex)?))
            } else if let Some(rest) = line.strip_prefix("sym ") {
                let (dest, name) = rest
                    .split_once(' ')
                    .ok_or_else(|| StoreError::Corrupt(format!("bad tree line: {line}")))?;
                (name, RefTarget::Symbolic(dest.to_string()))
            } else {
                return Err(StoreError::Corrupt(format!("bad tree line: {line}")));
            };
            refs.insert(target.0.to_string(), target.1);
        }
        Ok(RefTree { refs })
    }

    /// Deep snapshot.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn get(&self, name: &str) -> Option<&RefTarget> {
        self.refs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RefTarget)> {
        self.refs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Transactionally apply `commands`.
    ///
    /// Either every command applies and the call returns true, or the tree is
    /// unchanged, the first offending command carries a failure result, and
    /// the call returns false. Rejections: stale old value (`LockFailure`),
    /// duplicate names in the batch, and directory/file name conflicts with
    /// surviving references (`RejectedOtherReason`).
    pub fn apply(&mut self, commands: &mut [RefUpdate]) -> bool {
        let mut names = HashSet::new();
        for cmd in commands.iter_mut() {
            if !names.insert(cmd.name.clone()) {
                cmd.set_result_with_message(
                    UpdateResult::RejectedOtherReason,
                    "duplicate name in batch",
                );
                return false;
            }
        }

        let mut scratch = self.refs.clone();
        for cmd in commands.iter_mut() {
            if !old_value_matches(scratch.get(&cmd.name), cmd) {
                cmd.set_result(UpdateResult::LockFailure);
                return false;
            }
            if cmd.is_delete() {
                scratch.remove(&cmd.name);
            } else {
                if let Some(existing) = name_conflict(&scratch, &cmd.name) {
                    cmd.set_result_with_message(
                        UpdateResult::RejectedOtherReason,
                        format!("name conflicts with {existing}"),
                    );
                    return false;
                }
                scratch.insert(cmd.name.clone(), cmd.new.clone());
            }
        }

        self.refs = scratch;
        true
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, target) in &self.refs {
            match target {
                RefTarget::Id(id) => {
                    out.push_str("ref ");
                    out.push_str(&id.to_hex());
                }
                RefTarget::Symbolic(dest) => {
                    out.push_str("sym ");
                    out.push_str(dest);
                }
            }
            out.push(' ');
            out.push_str(name);
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Id this tree would receive from the store, without inserting it.
    pub fn tree_id(&self) -> ObjectId {
        ObjectId::hash_content(ObjectKind::Tree.tag(), &self.encode())
    }

    /// Persist the tree, returning its id.
    pub fn write_tree(&self, store: &dyn ObjectStore) -> Result<ObjectId, StoreError> {
        store.insert(ObjectKind::Tree, &self.encode())
    }
}

fn old_value_matches(current: Option<&RefTarget>, cmd: &RefUpdate) -> bool {
    match current {
        None => cmd.old_id.is_zero(),
        Some(RefTarget::Id(id)) => *id == cmd.old_id,
        // Symbolic references carry no old-id expectation.
        Some(RefTarget::Symbolic(_)) => cmd.old_id.is_zero(),
    }
}

/// A reference name conflicts with an existing one when either is a
/// path-prefix of the other: `a` blocks `a/b`, and `a/b` blocks `a`.
fn name_conflict(refs: &BTreeMap<String, RefTarget>, name: &str) -> Option<String> {
    let mut prefix = String::new();
    for segment in name.split('/') {
        if !prefix.is_empty() {
            if refs.contains_key(&prefix) {
                return Some(prefix);
            }
            prefix.push('/');
        }
        prefix.push_str(segment);
    }
    let dir = format!("{name}/");
    refs.range(dir.clone()..)
        .next()
        .filter(|(k, _)| k.starts_with(&dir))
        .map(|(k, _)| k.clone())
}
