use crate::object_id::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a leader's replication log: the commit at that position plus a
/// monotonically assigned sequence number.
///
/// Index 0 marks an unknown position (before the first election). Ordering is
/// only meaningful between positions assigned by the same leader instance;
/// indices from different leaders must never be compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIndex {
    pub id: ObjectId,
    pub index: u64,
}

impl LogIndex {
    /// Position before any accepted entry is known.
    pub fn unknown(id: ObjectId) -> Self {
        LogIndex { id, index: 0 }
    }

    /// The position following this one, holding `id`.
    pub fn next(&self, id: ObjectId) -> Self {
        LogIndex {
            id,
            index: self.index + 1,
        }
    }

    pub fn is_before(&self, other: &LogIndex) -> bool {
        self.index <= other.index
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.id.short())
    }
}
