use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier assigned by the backing store when a record is first persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A saved query and, once enrichment has run, the external service's answer.
///
/// Flows through every stage of the save pipeline and is mutated in place:
/// stage 1 assigns `id`, stage 2 fills `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// `None` until the record has been persisted.
    pub id: Option<RecordId>,
    /// The query text submitted by the caller.
    pub query: String,
    /// Result obtained from the external service, if enrichment has completed.
    pub result: Option<String>,
}

impl QueryRecord {
    /// A new, not yet persisted record.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: None,
            query: query.into(),
            result: None,
        }
    }

    /// A record referring to an existing row.
    #[must_use]
    pub fn with_id(id: RecordId, query: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            query: query.into(),
            result: None,
        }
    }
}

/// One message posted to the chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub id: Option<RecordId>,
    pub username: String,
    pub message: String,
}

impl ChatLogEntry {
    #[must_use]
    pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            message: message.into(),
        }
    }
}
