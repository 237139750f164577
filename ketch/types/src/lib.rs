//! Value types shared by the Ketch replication core: content-addressed object
//! identifiers, reference-update commands, commit metadata and log positions.

pub mod command;
pub mod commit;
pub mod identity;
pub mod log_index;
pub mod object_id;

pub use command::{RefTarget, RefUpdate, UpdateResult};
pub use commit::CommitData;
pub use identity::PersonIdent;
pub use log_index::LogIndex;
pub use object_id::ObjectId;

use thiserror::Error;

/// Errors raised while parsing the wire/object formats in this crate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),
    #[error("malformed commit: {0}")]
    MalformedCommit(String),
    #[error("malformed identity: {0}")]
    MalformedIdentity(String),
    #[error("commit message carries no Term footer")]
    MissingTerm,
}
