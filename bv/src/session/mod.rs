//! Broker session coordinator
//!
//! A single worker thread owns the broker connection and session. Callers talk
//! to it through [`SessionHandle`]:
//! - **Commands:** connect / disconnect requests, processed strictly FIFO
//! - **Queries:** class, object and method requests, correlated by transport id
//! - **Notifications:** status, errors, idle ticks and resolved queries on a broadcast bus

mod command;
mod config;
mod core;
mod error;
mod handle;
mod messages;
mod notify;
mod pending;
mod state;

pub use command::{Command, CommandQueue};
pub use config::{DEFAULT_AGENT_FILTER, DEFAULT_SCHEMA_PACKAGE, SessionConfig};
pub use error::SessionError;
pub use handle::{LOCALHOST_SESSION_OPTIONS, SessionCoordinator, SessionHandle, WORKER_THREAD_NAME};
pub use messages::QueryRequest;
pub use notify::{DEFAULT_NOTIFICATION_CAPACITY, NotificationBus, SessionNotification};
pub use pending::{CallerHandle, PendingQuery, PendingQueryTable, QueryKind};
pub use state::{ConnectionState, SessionMetrics, SessionSnapshot};
