//! BrokerView configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::{LOCALHOST_SESSION_OPTIONS, SessionConfig};

/// Main BrokerView configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker to connect to
    pub broker: BrokerConfig,

    /// Session coordinator tuning
    pub session: SessionConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Zero intervals would turn the worker loop into a busy spin, and a zero
    /// capacity notification bus cannot be created.
    pub fn validate(&self) -> Result<()> {
        if self.session.poll_interval_ms == 0 {
            return Err(eyre::eyre!("session.poll-interval-ms must be greater than zero"));
        }
        if self.session.command_wait_ms == 0 {
            return Err(eyre::eyre!("session.command-wait-ms must be greater than zero"));
        }
        if self.session.notification_capacity == 0 {
            return Err(eyre::eyre!("session.notification-capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .brokerview.yml
        let local_config = PathBuf::from(".brokerview.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/brokerview/brokerview.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("brokerview").join("brokerview.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address (host, host:port or URL)
    pub address: String,

    /// Options passed to the transport when opening the connection
    #[serde(rename = "connection-options")]
    pub connection_options: String,

    /// Options passed when opening the management session
    #[serde(rename = "session-options")]
    pub session_options: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            connection_options: String::new(),
            session_options: LOCALHOST_SESSION_OPTIONS.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Apply positional overrides; missing values keep the configured ones
    pub fn with_overrides(
        &self,
        address: Option<String>,
        connection_options: Option<String>,
        session_options: Option<String>,
    ) -> Self {
        Self {
            address: address.unwrap_or_else(|| self.address.clone()),
            connection_options: connection_options.unwrap_or_else(|| self.connection_options.clone()),
            session_options: session_options.unwrap_or_else(|| self.session_options.clone()),
        }
    }
}
