//! Dual identity for locally authored entities.
//!
//! Every entity is born with a [`ClientId`] generated on the device. The
//! server assigns a [`ServerId`] the first time a create request succeeds.
//!
//! ```text
//!   generate_client_id()          create-sync succeeds
//!  ┌────────────────────┐        ┌──────────────────────────┐
//!  │ cid = 7f3c…-…-…    │ ─────► │ cid = 7f3c…-…-…          │
//!  │ _id = None         │        │ _id = 65a1f0c2e4b0…(24)  │
//!  └────────────────────┘        └──────────────────────────┘
//!   resolve() -> ClientId          resolve() -> ServerId
//! ```
//!
//! Ids that arrive in a typed position (`_id`, `cid`, a flag's tagged
//! `doc_id`) are kept verbatim whatever their shape. Only an untagged raw
//! string, such as an operator's CLI argument, is classified by shape:
//! 24 lowercase hex digits is a server id, anything else a client id.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Length of a server-assigned id (hex-encoded 12-byte object id).
pub const SERVER_ID_LEN: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Empty identifier")]
    Empty,
    #[error("Not a server id: {0}")]
    NotServerFormat(String),
}

/// Locally generated identifier. Assigned once, never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned identifier. Canonical once known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build a server id from an untrusted string, enforcing the wire format.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if !is_server_format(raw) {
            return Err(IdError::NotServerFormat(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tagged identifier: one of the two id spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Identifier {
    Client(ClientId),
    Server(ServerId),
}

impl Identifier {
    /// Classify a raw string by its shape.
    pub fn classify(raw: &str) -> Result<Self, IdError> {
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if is_server_format(raw) {
            Ok(Identifier::Server(ServerId(raw.to_string())))
        } else {
            Ok(Identifier::Client(ClientId(raw.to_string())))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Client(cid) => cid.as_str(),
            Identifier::Server(sid) => sid.as_str(),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Identifier::Server(_))
    }

    pub fn server_id(&self) -> Option<&ServerId> {
        match self {
            Identifier::Server(sid) => Some(sid),
            Identifier::Client(_) => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Client(cid) => write!(f, "client:{cid}"),
            Identifier::Server(sid) => write!(f, "server:{sid}"),
        }
    }
}

impl From<ClientId> for Identifier {
    fn from(cid: ClientId) -> Self {
        Identifier::Client(cid)
    }
}

impl From<ServerId> for Identifier {
    fn from(sid: ServerId) -> Self {
        Identifier::Server(sid)
    }
}

/// Produce a fresh client id. Hyphenated UUIDs can never match the
/// 24-hex server format.
pub fn generate_client_id() -> ClientId {
    ClientId(Uuid::new_v4().hyphenated().to_string())
}

/// Structural check distinguishing server ids from client-generated ones.
pub fn is_server_format(raw: &str) -> bool {
    raw.len() == SERVER_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The pair of identifiers carried by every entity.
///
/// Serialized inline with the entity as `cid` and `_id`, matching the
/// server's document shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityIds {
    #[serde(default)]
    cid: ClientId,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    server_id: Option<ServerId>,
}

impl EntityIds {
    /// Ids for a brand new local entity.
    pub fn fresh() -> Self {
        Self {
            cid: generate_client_id(),
            server_id: None,
        }
    }

    pub fn with_client_id(cid: ClientId) -> Self {
        Self {
            cid,
            server_id: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.cid
    }

    pub fn server_id(&self) -> Option<&ServerId> {
        self.server_id.as_ref()
    }

    /// Attach the server-assigned id. The client id is untouched.
    pub fn promote(&mut self, sid: ServerId) {
        self.server_id = Some(sid);
    }

    /// Fill whichever ids are missing here from `other`.
    ///
    /// Server payloads may omit `cid`; a client id already present is
    /// never replaced.
    pub fn adopt_missing(&mut self, other: &EntityIds) {
        if self.cid.is_empty() {
            self.cid = other.cid.clone();
        }
        if self.server_id.is_none() {
            self.server_id = other.server_id.clone();
        }
    }

    /// `ServerId` if present, else `ClientId`.
    ///
    /// # Panics
    ///
    /// Panics when both ids are missing. Such an entity cannot be addressed
    /// and indicates a construction bug, not a recoverable condition.
    pub fn resolve(&self) -> Identifier {
        if let Some(sid) = &self.server_id {
            return Identifier::Server(sid.clone());
        }
        assert!(
            !self.cid.is_empty(),
            "entity has neither a client id nor a server id"
        );
        Identifier::Client(self.cid.clone())
    }

    /// True if either id field equals `id`.
    pub fn same_entity(&self, id: &Identifier) -> bool {
        match id {
            Identifier::Client(cid) => !cid.is_empty() && &self.cid == cid,
            Identifier::Server(sid) => self.server_id.as_ref() == Some(sid),
        }
    }

    /// Both ids as tagged identifiers, canonical first.
    pub fn aliases(&self) -> Vec<Identifier> {
        let mut out = Vec::with_capacity(2);
        if let Some(sid) = &self.server_id {
            out.push(Identifier::Server(sid.clone()));
        }
        if !self.cid.is_empty() {
            out.push(Identifier::Client(self.cid.clone()));
        }
        out
    }
}
