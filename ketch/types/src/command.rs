use crate::object_id::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target of a reference: a direct object id or a symbolic pointer to
/// another reference name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefTarget {
    Id(ObjectId),
    Symbolic(String),
}

impl RefTarget {
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            RefTarget::Id(id) => Some(*id),
            RefTarget::Symbolic(_) => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RefTarget::Id(id) if id.is_zero())
    }
}

/// Terminal outcome of a single reference-update command.
///
/// `NotAttempted` is the only non-terminal value; when the enclosing proposal
/// reaches a terminal state it is rewritten to `Ok` (success) or `Aborted`
/// (failure).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResult {
    NotAttempted,
    Ok,
    RejectedMissingObject,
    RejectedNonFastForward,
    RejectedOtherReason,
    LockFailure,
    Aborted,
}

impl UpdateResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpdateResult::NotAttempted)
    }
}

/// One requested change to a single reference.
///
/// `old_id` is the expected current value; the zero id means the reference
/// must not exist yet. A new target of the zero id deletes the reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdate {
    pub name: String,
    pub old_id: ObjectId,
    pub new: RefTarget,
    result: UpdateResult,
    message: Option<String>,
}

impl RefUpdate {
    pub fn new(name: impl Into<String>, old_id: ObjectId, new: RefTarget) -> Self {
        RefUpdate {
            name: name.into(),
            old_id,
            new,
            result: UpdateResult::NotAttempted,
            message: None,
        }
    }

    /// Create a reference that must not exist yet.
    pub fn create(name: impl Into<String>, id: ObjectId) -> Self {
        Self::new(name, ObjectId::zero(), RefTarget::Id(id))
    }

    /// Replace `old` with `new`, failing if the current value differs.
    pub fn update(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self::new(name, old, RefTarget::Id(new))
    }

    /// Delete an existing reference.
    pub fn delete(name: impl Into<String>, old: ObjectId) -> Self {
        Self::new(name, old, RefTarget::Id(ObjectId::zero()))
    }

    /// Point the reference at another reference by name.
    pub fn symbolic(name: impl Into<String>, old: ObjectId, target: impl Into<String>) -> Self {
        Self::new(name, old, RefTarget::Symbolic(target.into()))
    }

    pub fn result(&self) -> UpdateResult {
        self.result
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_result(&mut self, result: UpdateResult) {
        self.result = result;
        self.message = None;
    }

    pub fn set_result_with_message(&mut self, result: UpdateResult, message: impl Into<String>) {
        self.result = result;
        self.message = Some(message.into());
    }

    pub fn new_id(&self) -> Option<ObjectId> {
        self.new.id()
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_delete()
    }
}

impl fmt::Display for RefUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.new {
            RefTarget::Id(id) => {
                write!(f, "{} {}..{}", self.name, self.old_id.short(), id.short())
            }
            RefTarget::Symbolic(target) => {
                write!(f, "{} {}..ref:{}", self.name, self.old_id.short(), target)
            }
        }
    }
}
