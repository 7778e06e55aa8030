//! BrokerView - management session coordinator for message brokers
//!
//! BrokerView keeps one management session open against a broker and lets any
//! number of callers query it without ever touching the connection themselves.
//!
//! # Core Concepts
//!
//! - **One Owner**: a dedicated worker thread owns the connection and session
//! - **Queued Lifecycle**: connect and disconnect requests run strictly in order
//! - **Correlated Queries**: responses find their caller by correlation id
//! - **Notifications Out**: every change is pushed to subscribers, nothing throws
//!
//! # Modules
//!
//! - [`session`] - Session coordinator, command queue, pending query table
//! - [`transport`] - Transport traits, protocol events, simulated broker
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::{BrokerConfig, Config};
pub use session::{
    CallerHandle, Command, ConnectionState, QueryKind, SessionConfig, SessionCoordinator, SessionError, SessionHandle,
    SessionMetrics, SessionNotification, SessionSnapshot,
};
pub use transport::{
    AgentInfo, BrokerConnection, BrokerSession, CorrelationId, MethodCall, ObjectAddress, QueryEvent, QueryTarget,
    SessionEvent, Transport, TransportError,
};
