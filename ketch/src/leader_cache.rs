use crate::error::KetchError;
use crate::leader::Leader;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Factory building the leader for a repository key on first access.
pub type LeaderFactory =
    dyn Fn(&str) -> Result<Arc<Leader>, KetchError> + Send + Sync + 'static;

/// Process-wide map from repository key (description name or canonical
/// directory URI) to its leader.
///
/// Creation happens lazily under a single start lock, so at most one leader
/// instance ever exists per repository key.
pub struct LeaderCache {
    factory: Box<LeaderFactory>,
    leaders: Mutex<HashMap<String, Arc<Leader>>>,
}

impl LeaderCache {
    pub fn new(factory: Box<LeaderFactory>) -> Self {
        LeaderCache {
            factory,
            leaders: Mutex::new(HashMap::new()),
        }
    }

    /// The leader for `key`, created on first use.
    pub fn get(&self, key: &str) -> Result<Arc<Leader>, KetchError> {
        let mut leaders = self.leaders.lock().expect("leader cache lock poisoned");
        if let Some(leader) = leaders.get(key) {
            return Ok(leader.clone());
        }
        let leader = (self.factory)(key)?;
        leaders.insert(key.to_string(), leader.clone());
        Ok(leader)
    }

    /// Shut down every cached leader.
    pub fn shutdown_all(&self) {
        let leaders = self.leaders.lock().expect("leader cache lock poisoned");
        for leader in leaders.values() {
            leader.shutdown();
        }
    }
}
