//! Shared helpers for the consensus tests: gated clocks, failing transports
//! and repository seeding.

use crate::config::KetchConfig;
use crate::error::KetchError;
use crate::replica::{RefAdvertisement, ReplicaTransport, TransportError};
use crate::store::{insert_commit, ObjectKind, Repository};
use crate::system::KetchSystem;
use crate::util::time_service::{ProposedTimestamp, SystemTimeSource, TimeSource};
use async_trait::async_trait;
use ketch_types::{CommitData, ObjectId, PersonIdent, RefTarget, RefUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn test_system() -> Arc<KetchSystem> {
    KetchSystem::new(KetchConfig::default(), Handle::current()).unwrap()
}

/// Transport standing in for an unreachable peer.
pub(crate) struct FailingTransport;

#[async_trait]
impl ReplicaTransport for FailingTransport {
    async fn push(
        &self,
        _commands: &mut Vec<RefUpdate>,
    ) -> Result<RefAdvertisement, TransportError> {
        Err(TransportError::Unreachable("connection refused".to_string()))
    }
}

/// Clock whose rounds block until the test opens the gate; lets a test queue
/// several proposals before the first round can finish.
pub(crate) struct GatedTime {
    inner: SystemTimeSource,
    gate: watch::Receiver<bool>,
}

impl GatedTime {
    pub(crate) fn new() -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Arc::new(GatedTime {
                inner: SystemTimeSource,
                gate: rx,
            }),
            tx,
        )
    }
}

#[async_trait]
impl TimeSource for GatedTime {
    fn propose(&self) -> ProposedTimestamp {
        self.inner.propose()
    }

    async fn sleep_until_past(
        &self,
        ts: ProposedTimestamp,
        max_wait: Duration,
    ) -> Result<(), KetchError> {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.sleep_until_past(ts, max_wait).await
    }
}

/// Insert a distinct commit object standing in for user content.
pub(crate) fn seed_commit(repo: &Repository, n: u8) -> ObjectId {
    let ident = PersonIdent::new("author", "author@test", 0);
    let commit = CommitData {
        tree: repo.objects.insert(ObjectKind::Tree, b"").unwrap(),
        parents: vec![],
        author: ident.clone(),
        committer: ident,
        message: format!("content {n}\n"),
    };
    insert_commit(repo.objects.as_ref(), &commit).unwrap()
}

/// Current direct target of a reference, if any.
pub(crate) fn ref_id(repo: &Repository, name: &str) -> Option<ObjectId> {
    match repo.refs.lookup(name).unwrap() {
        Some(RefTarget::Id(id)) => Some(id),
        _ => None,
    }
}

/// Poll until `condition` holds, failing the test after a few seconds.
pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
