//! Ketch: leader-driven quorum replication of reference updates across
//! replicas of a content-addressed object store.
//!
//! A [`Leader`] accepts [`Proposal`]s (batches of reference updates),
//! validates them against its in-memory [`RefTree`], and drives consensus
//! rounds: an election round to claim a term, then proposal rounds that
//! write new log commits and push them to every [`Replica`]. Once a majority
//! of voters holds a round's entry, the round commits, the proposals report
//! `Executed`, and the committed position is published.
//!
//! Object storage, wire transports and the reference database stay behind
//! the traits in [`store`] and [`replica`]; in-memory implementations are
//! bundled for the local replica and for tests.

pub mod config;
pub mod counters;
pub mod error;
pub mod leader;
pub mod leader_cache;
pub mod proposal;
pub mod ref_tree;
pub mod replica;
pub mod store;
pub mod system;
pub mod util;

pub(crate) mod round;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{KetchConfig, ReplicaConfig};
pub use error::{KetchError, StoreError};
pub use leader::{Leader, LeaderSnapshot, LeaderState};
pub use leader_cache::LeaderCache;
pub use proposal::{Proposal, ProposalState};
pub use ref_tree::RefTree;
pub use replica::{
    CommitMethod, CommitSpeed, LocalTransport, Participation, RefAdvertisement, Replica,
    ReplicaSnapshot, ReplicaStatus, ReplicaTransport, TransportError,
};
pub use store::{ObjectKind, ObjectStore, RefStore, Repository};
pub use system::KetchSystem;

pub use ketch_types::{
    CommitData, LogIndex, ObjectId, PersonIdent, RefTarget, RefUpdate, UpdateResult,
};
