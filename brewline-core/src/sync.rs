//! Sync flags and flush envelopes.
//!
//! A [`SyncFlag`] records one local mutation the server has not confirmed.
//! Flags for the same `(doc_id, doc_type)` collapse into one:
//!
//! | pending | incoming | result  |
//! |---------|----------|---------|
//! | Create  | Update   | Create  |
//! | Create  | Delete   | (none)  |
//! | Update  | Update   | Update  |
//! | any     | Delete   | Delete  |
//! | Delete  | any      | Delete  |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::EntityKind;
use crate::id::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMethod::Create => "create",
            SyncMethod::Update => "update",
            SyncMethod::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Result of folding an incoming method into a pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    Keep(SyncMethod),
    /// Both operations cancel out; no network call is needed.
    Cancel,
}

/// Fold `incoming` into `pending` for the same document.
pub fn collapse(pending: SyncMethod, incoming: SyncMethod) -> Collapse {
    use SyncMethod::*;
    match (pending, incoming) {
        (Create, Delete) => Collapse::Cancel,
        (Create, _) => Collapse::Keep(Create),
        (_, Delete) | (Delete, _) => Collapse::Keep(Delete),
        (Update, _) => Collapse::Keep(Update),
    }
}

/// One outstanding local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFlag {
    pub method: SyncMethod,
    pub doc_id: Identifier,
    pub doc_type: EntityKind,
    /// Bumped whenever another mutation collapses into this flag.
    #[serde(default)]
    pub revision: u64,
}

impl SyncFlag {
    pub fn new(method: SyncMethod, doc_id: impl Into<Identifier>, doc_type: EntityKind) -> Self {
        Self {
            method,
            doc_id: doc_id.into(),
            doc_type,
            revision: 0,
        }
    }

    pub fn targets(&self, doc_id: &Identifier, doc_type: EntityKind) -> bool {
        self.doc_type == doc_type && &self.doc_id == doc_id
    }
}

impl fmt::Display for SyncFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} (rev {})", self.method, self.doc_type, self.doc_id, self.revision)
    }
}

/// A flag whose remote call succeeded, with the server's copy when the
/// method returns one (`Delete` does not).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSuccess<T> {
    pub flag: SyncFlag,
    pub entity: Option<T>,
}

/// A flag whose remote call failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub flag: SyncFlag,
    pub message: String,
    /// Whether retrying on the next reconnect can succeed.
    pub transient: bool,
}

/// Outcome of flushing one kind's pending flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse<T> {
    pub successes: Vec<SyncSuccess<T>>,
    pub failures: Vec<SyncError>,
}

impl<T> SyncResponse<T> {
    pub fn empty() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }
}

impl<T> Default for SyncResponse<T> {
    fn default() -> Self {
        Self::empty()
    }
}
