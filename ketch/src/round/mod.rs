//! One unit of consensus work: construct a candidate log entry in the local
//! object store and hand it to the leader for replication.

mod election;
mod proposal_round;
mod stage;

pub(crate) use election::ElectionRound;
pub(crate) use proposal_round::ProposalRound;

use crate::error::StoreError;
use crate::proposal::Proposal;
use ketch_types::{LogIndex, ParseError, RefUpdate};
use std::sync::Arc;
use thiserror::Error;

/// What the round was about; consumed by the leader when the round wins its
/// quorum.
pub(crate) enum RoundKind {
    Election { new_term: u64 },
    Proposals { proposals: Vec<Arc<Proposal>> },
}

/// A round whose candidate entry has been written locally and is ready to be
/// offered to the replicas.
pub(crate) struct StartedRound {
    pub accepted_old: LogIndex,
    pub accepted_new: LogIndex,
    pub stage: Vec<RefUpdate>,
    pub kind: RoundKind,
}

impl std::fmt::Debug for StartedRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedRound")
            .field("accepted_old", &self.accepted_old)
            .field("accepted_new", &self.accepted_new)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub(crate) enum RoundError {
    /// The round would not change the reference tree; its proposals succeed
    /// vacuously and no entry is written.
    #[error("round produced no change")]
    NoOp,

    #[error("time is not certain enough to proceed")]
    TimeUncertain,

    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("object format: {0}")]
    Format(#[from] ParseError),

    #[error("{0}")]
    Internal(String),
}
