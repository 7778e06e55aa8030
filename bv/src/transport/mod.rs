//! Broker transport abstraction
//!
//! The session coordinator talks to the broker only through these traits. A
//! [`Transport`] opens a [`BrokerConnection`], which opens a [`BrokerSession`];
//! the session yields [`SessionEvent`]s and accepts asynchronous queries and
//! method calls, answering each with a transport-assigned [`CorrelationId`].
//!
//! The wire encoding behind these traits is not part of this crate. The
//! [`sim`] module provides an in-process broker for tests and demos.

use std::time::Duration;

use async_trait::async_trait;

mod error;
pub mod sim;
mod types;

pub use error::TransportError;
pub use types::{
    AgentInfo, CorrelationId, MethodCall, OBJECT_NAME_PROPERTY, ObjectAddress, QueryEvent, QueryTarget, SessionEvent,
    exception_text,
};

/// Factory for broker connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `address` using transport-specific `options`
    async fn connect(&self, address: &str, options: &str) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

/// An open connection to a broker
#[async_trait]
pub trait BrokerConnection: Send {
    /// Open a management session on this connection
    async fn open_session(&mut self, options: &str) -> Result<Box<dyn BrokerSession>, TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A live management session
///
/// Owned exclusively by the coordinator's worker thread.
#[async_trait]
pub trait BrokerSession: Send {
    /// Restrict which agents the session reports
    fn set_agent_filter(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Name of the broker's own management agent, once known
    fn broker_agent_name(&self) -> Option<String>;

    /// Wait up to `timeout` for the next event
    ///
    /// Returns `Ok(None)` on timeout. Must be cancel-safe: the coordinator may
    /// drop the future when a command arrives, and no event may be lost.
    async fn next_event(&mut self, timeout: Duration) -> Result<Option<SessionEvent>, TransportError>;

    /// Issue an asynchronous query to `agent`
    async fn query(&mut self, agent: &AgentInfo, target: &QueryTarget) -> Result<CorrelationId, TransportError>;

    /// Issue an asynchronous method call to `agent`
    async fn call_method(&mut self, agent: &AgentInfo, call: &MethodCall) -> Result<CorrelationId, TransportError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), TransportError>;
}
