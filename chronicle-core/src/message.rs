//! The shared message shape for commands and events.
//!
//! Commands and events are structurally identical: commands are intent,
//! events are fact. The semantic role of a [`Message`] is determined by
//! usage, so [`Command`] and [`Event`] are aliases rather than distinct
//! types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved event type marking a point-in-time aggregate state image.
///
/// A commit may carry at most one event of this kind; it is persisted through
/// the snapshot storage rather than the event storage and is never published.
pub const SNAPSHOT_KIND: &str = "snapshot";

/// Opaque identifier for aggregates and sagas.
///
/// Identifiers are preserved verbatim: a storage backend that hands out
/// strings sees strings back, one that hands out integers sees integers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Text(String),
    Number(i64),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// A command or event.
///
/// Only `kind` is mandatory. Aggregate and saga coordinates are optional and
/// validated where they are required (see the event store's commit
/// validation). `payload` and `context` are opaque to the runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message type. Serialized as `type`; must be non-empty.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// A message in its command role.
pub type Command = Message;

/// A message in its event role.
pub type Event = Message;

/// An ordered, materialized sequence of events.
///
/// Ordering is the commit order for a given aggregate or saga, and is the
/// sole ordering guarantee the runtime makes.
pub type EventStream = Vec<Event>;

impl Message {
    /// Create a message carrying only a type.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Create an event positioned in an aggregate's stream.
    #[must_use]
    pub fn event(kind: impl Into<String>, aggregate_id: Id, aggregate_version: u64) -> Self {
        Self {
            kind: kind.into(),
            aggregate_id: Some(aggregate_id),
            aggregate_version: Some(aggregate_version),
            ..Self::default()
        }
    }

    /// Create a snapshot event capturing aggregate state at a version.
    #[must_use]
    pub fn snapshot(aggregate_id: Id, aggregate_version: u64, payload: serde_json::Value) -> Self {
        Self {
            kind: SNAPSHOT_KIND.to_string(),
            aggregate_id: Some(aggregate_id),
            aggregate_version: Some(aggregate_version),
            payload: Some(payload),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_saga(mut self, saga_id: Id, saga_version: u64) -> Self {
        self.saga_id = Some(saga_id);
        self.saga_version = Some(saga_version);
        self
    }

    /// Whether this message is the reserved snapshot event.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.kind == SNAPSHOT_KIND
    }
}
