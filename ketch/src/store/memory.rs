use super::{ObjectKind, ObjectStore, RefStore};
use crate::error::StoreError;
use ketch_types::{ObjectId, RefTarget, RefUpdate, UpdateResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// In-memory object store. Backs the local repository in tests and in
/// embedders that replicate purely transient state.
pub struct MemObjectStore {
    objects: RwLock<HashMap<ObjectId, (ObjectKind, Vec<u8>)>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        MemObjectStore {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemObjectStore {
    fn insert(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId, StoreError> {
        let id = ObjectId::hash_content(kind.tag(), data);
        self.objects
            .write()
            .expect("object store lock poisoned")
            .entry(id)
            .or_insert_with(|| (kind, data.to_vec()));
        Ok(id)
    }

    fn read(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError> {
        self.objects
            .read()
            .expect("object store lock poisoned")
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.objects
            .read()
            .expect("object store lock poisoned")
            .contains_key(id)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory reference database.
pub struct MemRefStore {
    refs: RwLock<BTreeMap<String, RefTarget>>,
}

impl MemRefStore {
    pub fn new() -> Self {
        MemRefStore {
            refs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Set a reference directly, bypassing old-value checks. Intended for
    /// seeding repositories.
    pub fn set(&self, name: impl Into<String>, target: RefTarget) {
        self.refs
            .write()
            .expect("ref store lock poisoned")
            .insert(name.into(), target);
    }
}

impl Default for MemRefStore {
    fn default() -> Self {
        Self::new()
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

impl RefStore for MemRefStore {
    fn lookup(&self, name: &str) -> Result<Option<RefTarget>, StoreError> {
        Ok(self
            .refs
            .read()
            .expect("ref store lock poisoned")
            .get(name)
            .cloned())
    }

    fn advertised(&self) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        Ok(self
            .refs
            .read()
            .expect("ref store lock poisoned")
            .iter()
            .filter_map(|(name, target)| target.id().map(|id| (name.clone(), id)))
            .collect())
    }

    fn update_batch(&self, commands: &mut [RefUpdate]) -> Result<bool, StoreError> {
        let mut refs = self.refs.write().expect("ref store lock poisoned");
        let mut all_ok = true;
        for cmd in commands {
            if !old_value_matches(refs.get(&cmd.name), cmd) {
                cmd.set_result(UpdateResult::LockFailure);
                all_ok = false;
                continue;
            }
            if cmd.is_delete() {
                refs.remove(&cmd.name);
            } else {
                refs.insert(cmd.name.clone(), cmd.new.clone());
            }
            cmd.set_result(UpdateResult::Ok);
        }
        Ok(all_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ObjectId {
        ObjectId::hash_content("commit", &[n])
    }

    #[test]
    fn batch_applies_independent_commands() {
        let refs = MemRefStore::new();
        let mut cmds = vec![
            RefUpdate::create("refs/heads/a", id(1)),
            RefUpdate::create("refs/heads/b", id(2)),
        ];
        assert!(refs.update_batch(&mut cmds).unwrap());
        assert_eq!(cmds[0].result(), UpdateResult::Ok);
        assert_eq!(
            refs.lookup("refs/heads/b").unwrap(),
            Some(RefTarget::Id(id(2)))
        );
    }

    #[test]
    fn stale_old_value_is_lock_failure() {
        let refs = MemRefStore::new();
        refs.set("refs/heads/a", RefTarget::Id(id(1)));
        let mut cmds = vec![RefUpdate::update("refs/heads/a", id(9), id(2))];
        assert!(!refs.update_batch(&mut cmds).unwrap());
        assert_eq!(cmds[0].result(), UpdateResult::LockFailure);
        // The reference is untouched.
        assert_eq!(
            refs.lookup("refs/heads/a").unwrap(),
            Some(RefTarget::Id(id(1)))
        );
    }

    #[test]
    fn delete_removes_ref() {
        let refs = MemRefStore::new();
        refs.set("refs/heads/a", RefTarget::Id(id(1)));
        let mut cmds = vec![RefUpdate::delete("refs/heads/a", id(1))];
        assert!(refs.update_batch(&mut cmds).unwrap());
        assert_eq!(refs.lookup("refs/heads/a").unwrap(), None);
    }

    #[test]
    fn advertised_skips_symbolic_refs() {
        let refs = MemRefStore::new();
        refs.set("refs/heads/main", RefTarget::Id(id(1)));
        refs.set("HEAD", RefTarget::Symbolic("refs/heads/main".to_string()));
        let advertised = refs.advertised().unwrap();
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised.get("refs/heads/main"), Some(&id(1)));
    }
}
