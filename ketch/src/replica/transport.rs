use async_trait::async_trait;
use ketch_types::{ObjectId, RefUpdate};
use std::collections::BTreeMap;
use thiserror::Error;

/// Reference listing a peer reports after a push attempt: every
/// directly-valued reference and its current target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefAdvertisement {
    pub refs: BTreeMap<String, ObjectId>,
}

impl RefAdvertisement {
    pub fn get(&self, name: &str) -> Option<ObjectId> {
        self.refs.get(name).copied()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The expected old value of a transactional reference did not match the
    /// peer's advertisement; none of the batch was applied beyond the point
    /// of failure. The advertisement reports where the peer actually is.
    #[error("expected old value mismatched the peer's advertisement")]
    LockFailure { advertised: RefAdvertisement },

    #[error("replica unreachable: {0}")]
    Unreachable(String),
}

/// Moves a batch of reference updates to one replica.
///
/// Implementations validate each command's expected old value against the
/// peer's current references and apply the batch atomically (or, for the
/// local replica, in the ordinary→accepted→committed order that keeps a
/// partial failure safe). Per-command results are recorded on the commands;
/// the returned advertisement reflects the peer after the attempt.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn push(&self, commands: &mut Vec<RefUpdate>) -> Result<RefAdvertisement, TransportError>;
}
