//! Session coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::notify::DEFAULT_NOTIFICATION_CAPACITY;

/// Agent filter applied to every new session: only report qpidd agents
pub const DEFAULT_AGENT_FILTER: &str = "[eq, _product, [quote, 'qpidd']]";

/// Schema package holding the broker's management classes
pub const DEFAULT_SCHEMA_PACKAGE: &str = "org.apache.qpid.broker";

/// Session coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long to wait for the next protocol event while connected
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long to wait for a command while disconnected
    #[serde(rename = "command-wait-ms", default = "default_command_wait_ms")]
    pub command_wait_ms: u64,

    /// Broadcast capacity for outbound notifications
    #[serde(rename = "notification-capacity", default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Agent filter expression applied after the session opens
    #[serde(rename = "agent-filter", default = "default_agent_filter")]
    pub agent_filter: String,

    /// Package used for class queries
    #[serde(rename = "schema-package", default = "default_schema_package")]
    pub schema_package: String,
}

fn default_poll_interval_ms() -> u64 {
    debug!("default_poll_interval_ms: called");
    2000
}

fn default_command_wait_ms() -> u64 {
    debug!("default_command_wait_ms: called");
    1000
}

fn default_notification_capacity() -> usize {
    debug!("default_notification_capacity: called");
    DEFAULT_NOTIFICATION_CAPACITY
}

fn default_agent_filter() -> String {
    debug!("default_agent_filter: called");
    DEFAULT_AGENT_FILTER.to_string()
}

fn default_schema_package() -> String {
    debug!("default_schema_package: called");
    DEFAULT_SCHEMA_PACKAGE.to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        debug!("SessionConfig::default: called");
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            command_wait_ms: default_command_wait_ms(),
            notification_capacity: default_notification_capacity(),
            agent_filter: default_agent_filter(),
            schema_package: default_schema_package(),
        }
    }
}

impl SessionConfig {
    /// Get the event poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        debug!(poll_interval_ms = %self.poll_interval_ms, "SessionConfig::poll_interval: called");
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the command wait as a Duration
    pub fn command_wait(&self) -> Duration {
        debug!(command_wait_ms = %self.command_wait_ms, "SessionConfig::command_wait: called");
        Duration::from_millis(self.command_wait_ms)
    }
}
