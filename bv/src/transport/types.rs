//! Protocol-level types exchanged with a broker session
//!
//! Management objects are opaque to the coordinator: result rows are carried as
//! `serde_json::Value` and their property names are never interpreted here, except
//! for the `error_text` property of exception rows and the [`OBJECT_NAME_PROPERTY`]
//! a row uses to carry its own object name.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row property holding the object name of the management object it describes
pub const OBJECT_NAME_PROPERTY: &str = "_object_name";

/// Identifier assigned by the transport to an outbound query or method call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A management agent announced by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Address of a single management object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAddress {
    #[serde(rename = "agent-name")]
    pub agent_name: String,
    pub name: String,
    #[serde(rename = "agent-epoch", default)]
    pub agent_epoch: u32,
}

impl ObjectAddress {
    pub fn new(agent_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            name: name.into(),
            agent_epoch: 0,
        }
    }

    /// Address of the object a result row describes, if the row names itself
    pub fn from_row(agent_name: impl Into<String>, row: &Value) -> Option<Self> {
        let name = row.get(OBJECT_NAME_PROPERTY)?.as_str()?;
        Some(Self::new(agent_name, name))
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_name, self.name)
    }
}

/// What a query asks the broker agent for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueryTarget {
    /// Every object of a schema class, delivered as a stream of row batches
    Class { package: String, class_name: String },

    /// One object by address
    Object { address: ObjectAddress },
}

/// An asynchronous method invocation on a management object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    pub arguments: Map<String, Value>,
    pub address: ObjectAddress,
}

/// A (possibly partial) response to a query or method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvent {
    #[serde(rename = "correlation-id")]
    pub correlation_id: CorrelationId,

    /// Last event for this correlation id
    #[serde(rename = "final")]
    pub is_final: bool,

    /// Opaque result rows
    #[serde(default)]
    pub rows: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryEvent {
    /// A non-final batch of rows
    pub fn partial(correlation_id: impl Into<CorrelationId>, rows: Vec<Value>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            is_final: false,
            rows,
            error: None,
        }
    }

    /// The final batch of rows
    pub fn complete(correlation_id: impl Into<CorrelationId>, rows: Vec<Value>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            is_final: true,
            rows,
            error: None,
        }
    }

    /// A final event carrying only an error payload
    pub fn failed(correlation_id: impl Into<CorrelationId>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            is_final: true,
            rows: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// True when the event carries rows or an error
    pub fn has_payload(&self) -> bool {
        !self.rows.is_empty() || self.error.is_some()
    }
}

/// Events delivered by a live broker session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A management agent became visible
    AgentAdded(AgentInfo),

    /// A management agent went away
    AgentRemoved(AgentInfo),

    /// Rows for an outstanding query
    QueryResponse(QueryEvent),

    /// Result of an asynchronous method call
    MethodResponse(QueryEvent),

    /// Error raised by the broker; rows usually carry an `error_text` property
    Exception {
        correlation_id: Option<CorrelationId>,
        rows: Vec<Value>,
    },

    /// Anything the coordinator does not route
    Other { kind: String },
}

impl SessionEvent {
    /// Get the event kind as a string (for logging)
    pub fn kind(&self) -> &str {
        match self {
            SessionEvent::AgentAdded(_) => "AgentAdded",
            SessionEvent::AgentRemoved(_) => "AgentRemoved",
            SessionEvent::QueryResponse(_) => "QueryResponse",
            SessionEvent::MethodResponse(_) => "MethodResponse",
            SessionEvent::Exception { .. } => "Exception",
            SessionEvent::Other { kind } => kind,
        }
    }
}

/// Extract a human-readable message from exception rows
///
/// Prefers the `error_text` property of the first row and falls back to the row
/// itself rendered as text. Returns `None` when there are no rows.
pub fn exception_text(rows: &[Value]) -> Option<String> {
    let first = rows.first()?;
    match first.get("error_text") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
        None => match first {
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        },
    }
}
