// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay daemon configuration.

use serde::{Deserialize, Serialize};
use sonar::config::RelayConfig;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Relay daemon configuration, loadable from a JSON file; every field has
/// a default so a partial file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaydConfig {
    /// Address to bind the inbound endpoint to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,

    /// UDP port to listen on (default: 7400)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client lease duration in seconds
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Upper bound on one inbound poll, in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Messages drained per reactor tick
    #[serde(default = "default_max_messages")]
    pub max_messages_per_tick: usize,
}

fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_port() -> u16 {
    7400
}

fn default_client_timeout() -> u64 {
    10
}

fn default_poll_timeout() -> u64 {
    20
}

fn default_max_messages() -> usize {
    64
}

impl Default for RelaydConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            client_timeout_secs: default_client_timeout(),
            poll_timeout_ms: default_poll_timeout(),
            max_messages_per_tick: default_max_messages(),
        }
    }
}

impl RelaydConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if self.client_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "client_timeout_secs must be non-zero".into(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be non-zero".into(),
            ));
        }
        if self.max_messages_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "max_messages_per_tick must be non-zero".into(),
            ));
        }
        if Duration::from_millis(self.poll_timeout_ms) >= self.client_timeout() {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be shorter than the client lease".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Engine-side view of this configuration.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            client_timeout: self.client_timeout(),
            poll_timeout: self.poll_timeout(),
            max_messages_per_tick: self.max_messages_per_tick,
        }
    }
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Parse(s) => write!(f, "Parse error: {}", s),
            Self::Invalid(s) => write!(f, "Invalid configuration: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
