//! Replica bookkeeping: participation and publication policies, push
//! transports, lag classification and retry backoff.
//!
//! A [`Replica`] describes one mirror of the repository. Its live state
//! (last-known positions, status, retry schedule) is owned by the leader and
//! guarded by the leader's lock; the transport here only moves batches of
//! reference updates to the peer.

mod local;
mod transport;

pub use local::LocalTransport;
pub use transport::{RefAdvertisement, ReplicaTransport, TransportError};

use crate::config::{KetchConfig, ReplicaConfig};
use crate::error::KetchError;
use crate::store::{is_ancestor, ObjectStore, Repository};
use ketch_types::{LogIndex, ObjectId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Whether the replica votes on rounds or only mirrors results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Participation {
    Full,
    FollowerOnly,
}

/// How committed state is published to the replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitMethod {
    /// Move only the transactional committed reference.
    TxnCommitted,
    /// Additionally expand the committed tree into each ordinary reference
    /// so readers unaware of the transaction namespace observe the state.
    AllRefs,
}

/// When committed state is published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitSpeed {
    /// Piggyback on the next round's push; push separately only when the
    /// leader has gone idle.
    Batched,
    /// Publish immediately after every accept.
    Fast,
}

/// Observed relationship between a replica and the leader's log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Unknown,
    Lagging,
    Current,
    Ahead,
    Divergent,
    Offline,
}

impl FromStr for Participation {
    type Err = KetchError;

    fn from_str(s: &str) -> Result<Self, KetchError> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(Participation::Full),
            "FOLLOWER_ONLY" => Ok(Participation::FollowerOnly),
            _ => Err(KetchError::InvalidConfig(format!(
                "unrecognized replica type: {s}"
            ))),
        }
    }
}

impl FromStr for CommitMethod {
    type Err = KetchError;

    fn from_str(s: &str) -> Result<Self, KetchError> {
        match s.to_ascii_uppercase().as_str() {
            "TXN_COMMITTED" => Ok(CommitMethod::TxnCommitted),
            "ALL_REFS" => Ok(CommitMethod::AllRefs),
            _ => Err(KetchError::InvalidConfig(format!(
                "unrecognized commit method: {s}"
            ))),
        }
    }
}

impl FromStr for CommitSpeed {
    type Err = KetchError;

    fn from_str(s: &str) -> Result<Self, KetchError> {
        match s.to_ascii_uppercase().as_str() {
            "BATCHED" => Ok(CommitSpeed::Batched),
            "FAST" => Ok(CommitSpeed::Fast),
            _ => Err(KetchError::InvalidConfig(format!(
                "unrecognized commit speed: {s}"
            ))),
        }
    }
}

/// Description of one replica, handed to the leader at construction.
pub struct Replica {
    pub(crate) name: String,
    pub(crate) config: ReplicaConfig,
    pub(crate) transport: Arc<dyn ReplicaTransport>,
    pub(crate) local: bool,
}

impl Replica {
    /// The leader-side replica applying through the in-process repository.
    pub fn local(
        name: impl Into<String>,
        config: ReplicaConfig,
        repo: &Repository,
        system: &KetchConfig,
    ) -> Self {
        let transport = Arc::new(LocalTransport::new(
            repo.clone(),
            system.accepted_ref_name(),
            system.committed_ref_name(),
        ));
        Replica {
            name: name.into(),
            config,
            transport,
            local: true,
        }
    }

    /// A remote mirror reached through `transport`.
    pub fn remote(
        name: impl Into<String>,
        config: ReplicaConfig,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        Replica {
            name: name.into(),
            config,
            transport,
            local: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Consistent view of one replica for observability.
#[derive(Clone, Debug, Serialize)]
pub struct ReplicaSnapshot {
    pub name: String,
    pub participation: Participation,
    pub accepted: Option<ObjectId>,
    pub committed: Option<ObjectId>,
    pub status: ReplicaStatus,
    pub error: Option<String>,
    /// Milliseconds until the next retry, if one is scheduled.
    pub retry_in_ms: Option<u64>,
}

/// Classify a peer's accepted position against the leader's head.
pub(crate) fn classify(
    store: &dyn ObjectStore,
    head: LogIndex,
    peer_accepted: Option<ObjectId>,
) -> ReplicaStatus {
    let Some(peer) = peer_accepted else {
        return ReplicaStatus::Lagging;
    };
    if head.id.is_zero() {
        return ReplicaStatus::Unknown;
    }
    if peer == head.id {
        ReplicaStatus::Current
    } else if is_ancestor(store, &peer, &head.id) {
        ReplicaStatus::Lagging
    } else if is_ancestor(store, &head.id, &peer) {
        ReplicaStatus::Ahead
    } else {
        ReplicaStatus::Divergent
    }
}

/// Next retry delay: the first retry waits `min`; afterwards the delay grows
/// to a jittered value in `[min, last*3]`, clamped to `max`.
pub(crate) fn next_retry_delay(min: Duration, max: Duration, last: Option<Duration>) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let last_ms = match last {
        None => return Duration::from_millis(min_ms.min(max_ms)),
        Some(last) => last.as_millis() as u64,
    };
    let span = last_ms.saturating_mul(3).saturating_sub(min_ms);
    let jitter = if span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0, span)
    };
    Duration::from_millis((min_ms + jitter).min(max_ms))
}
