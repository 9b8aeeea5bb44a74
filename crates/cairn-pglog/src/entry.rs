//! Log entry types for placement-group reconciliation.

use cairn_core::{Eversion, ObjectId};
use serde::{Deserialize, Serialize};

/// The kind of mutation a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// The object was written (created or updated).
    Modify,
    /// The object was deleted.
    Delete,
}

/// A single object-mutation record in a placement-group log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgLogEntry {
    /// The recorded operation.
    pub op: LogOp,
    /// The object the operation applied to.
    pub object: ObjectId,
    /// Version assigned to this mutation.
    pub version: Eversion,
    /// Version of the object before this mutation, or
    /// [`Eversion::ZERO`] if the mutation created it.
    pub prior_version: Eversion,
}

impl PgLogEntry {
    /// Creates a modify entry.
    #[must_use]
    pub fn modify(object: ObjectId, version: Eversion, prior_version: Eversion) -> Self {
        Self { op: LogOp::Modify, object, version, prior_version }
    }

    /// Creates a delete entry.
    #[must_use]
    pub fn delete(object: ObjectId, version: Eversion, prior_version: Eversion) -> Self {
        Self { op: LogOp::Delete, object, version, prior_version }
    }

    /// Returns true if this entry deletes its object.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self.op, LogOp::Delete)
    }

    /// Returns true if this entry modifies (rather than deletes) its object.
    #[must_use]
    pub fn is_modify(&self) -> bool {
        matches!(self.op, LogOp::Modify)
    }
}

impl std::fmt::Display for PgLogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            LogOp::Modify => "modify",
            LogOp::Delete => "delete",
        };
        write!(f, "{} {} {} (prior {})", self.version, op, self.object, self.prior_version)
    }
}
