//! Outbound notifications from the session coordinator
//!
//! The worker pushes every externally visible change into a [`NotificationBus`]
//! backed by a tokio broadcast channel. UI or model layers subscribe and drain
//! at their own pace; subscribers that fall more than the channel capacity
//! behind lose the oldest notifications, final `QueryResolved` events included.
//! The loss surfaces as `RecvError::Lagged(skipped)` on the subscriber's next
//! `recv`, never on the sending side.

use tokio::sync::broadcast;
use tracing::debug;

use super::pending::{CallerHandle, QueryKind};
use super::state::ConnectionState;
use crate::transport::{CorrelationId, QueryEvent};

/// Default channel capacity (notifications)
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Everything the coordinator reports to its callers
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// Diagnostic status line ("Connection opening...", "Closed", ...)
    ConnectionStatus { text: String },

    /// Connection became usable (broker agent found) or went away
    ConnectedChanged { connected: bool },

    /// Human-readable error from the broker or transport
    Error { message: String },

    /// A poll interval passed with no protocol event
    IdleTick,

    /// A response for one of the caller's queries
    QueryResolved { caller: CallerHandle, event: QueryEvent },

    /// The transport accepted a query and assigned it an id
    QueryIssued {
        caller: CallerHandle,
        correlation_id: CorrelationId,
        kind: QueryKind,
    },

    /// The worker moved between connection states
    StateChanged { from: ConnectionState, to: ConnectionState },
}

impl SessionNotification {
    /// Get the notification type as a string (for logging)
    pub fn notification_type(&self) -> &'static str {
        match self {
            Self::ConnectionStatus { .. } => "ConnectionStatus",
            Self::ConnectedChanged { .. } => "ConnectedChanged",
            Self::Error { .. } => "Error",
            Self::IdleTick => "IdleTick",
            Self::QueryResolved { .. } => "QueryResolved",
            Self::QueryIssued { .. } => "QueryIssued",
            Self::StateChanged { .. } => "StateChanged",
        }
    }
}

/// Broadcast bus carrying [`SessionNotification`]s to every subscriber
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<SessionNotification>,
}

impl NotificationBus {
    /// Create a new bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "NotificationBus::new: creating notification bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit a notification to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the notification is dropped. A full
    /// channel overwrites its oldest entry for subscribers that have not read it.
    pub fn emit(&self, notification: SessionNotification) {
        debug!(
            notification_type = notification.notification_type(),
            "NotificationBus::emit"
        );
        let _ = self.tx.send(notification);
    }

    /// Subscribe to notifications emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        debug!("NotificationBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    // === Convenience methods ===

    pub fn status(&self, text: impl Into<String>) {
        self.emit(SessionNotification::ConnectionStatus { text: text.into() });
    }

    pub fn connected(&self, connected: bool) {
        self.emit(SessionNotification::ConnectedChanged { connected });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SessionNotification::Error {
            message: message.into(),
        });
    }

    pub fn idle_tick(&self) {
        self.emit(SessionNotification::IdleTick);
    }

    pub fn query_resolved(&self, caller: &CallerHandle, event: QueryEvent) {
        self.emit(SessionNotification::QueryResolved {
            caller: caller.clone(),
            event,
        });
    }

    pub fn query_issued(&self, caller: &CallerHandle, correlation_id: CorrelationId, kind: QueryKind) {
        self.emit(SessionNotification::QueryIssued {
            caller: caller.clone(),
            correlation_id,
            kind,
        });
    }

    pub fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        self.emit(SessionNotification::StateChanged { from, to });
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}
