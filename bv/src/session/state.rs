//! Connection state machine and the snapshot the worker publishes

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::ObjectAddress;

/// Lifecycle of the broker connection as seen by the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether `next` directly follows `self` in the transition table
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// New queries may only be issued while connected
    pub fn accepts_queries(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Counters maintained by the worker loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub events_received: u64,
    pub idle_ticks: u64,
    pub idle_ticks_suppressed: u64,
    pub queries_issued: u64,
    pub queries_dropped: u64,
    pub responses_routed: u64,
    pub unmatched_responses: u64,
    pub errors_reported: u64,
    pub connect_failures: u64,
    pub connection_losses: u64,
    pub pending_swept: u64,
}

/// Point-in-time view of the coordinator, published by the worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,

    /// Name of the broker's management agent once discovered
    pub broker_agent: Option<String>,

    /// The broker's own management object, target of broker-level method calls
    pub broker_object: Option<ObjectAddress>,

    /// Address of the current (or last attempted) connection
    pub address: Option<String>,

    pub metrics: SessionMetrics,
}

impl SessionSnapshot {
    /// Connected and the broker agent is known, so queries can be issued
    pub fn is_ready(&self) -> bool {
        self.state.accepts_queries() && self.broker_agent.is_some()
    }
}
