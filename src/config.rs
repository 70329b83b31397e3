//! Configuration for the agent gateway
//!
//! Loaded from a TOML file. Credentials are referenced by environment
//! variable name and resolved when the transport connects.

use crate::agent::supervisor::ReconnectPolicy;
use crate::protocol::{default_status_topic, validate_agent_id, validate_filter};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    /// Filters the binary subscribes a logging consumer to
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSection>,
}

/// Agent identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-zA-Z0-9._-]+), appended to publish topics
    pub id: String,
    /// Client identifier presented to the broker; generated when omitted
    pub session_id: Option<String>,
    /// Liveness topic; defaults to `agents/<id>/status/connection`
    pub status_topic: Option<String>,
}

impl AgentSection {
    /// Session identifier, generating `<id>-<uuid>` when not configured
    pub fn resolved_session_id(&self) -> String {
        self.session_id.clone().unwrap_or_else(|| {
            format!("{}-{}", self.id, uuid::Uuid::new_v4().simple())
        })
    }

    /// Status topic, falling back to the default derived from the agent id
    pub fn resolved_status_topic(&self) -> String {
        self.status_topic
            .clone()
            .unwrap_or_else(|| default_status_topic(&self.id))
    }
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long to wait for the broker's connection acknowledgement
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Capacity of the client's outgoing request channel
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl MqttSection {
    /// Minimal section for a broker URL with every other field defaulted
    pub fn for_broker(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            request_capacity: default_request_capacity(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_capacity() -> usize {
    10
}

/// Reconnect supervisor section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum reconnect attempts (omitted = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    #[serde(default = "default_backoff")]
    pub backoff_ms: Vec<u64>,
    /// Delay used once the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

impl ReconnectSection {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            backoff_pattern: self.backoff_ms.clone(),
            sustained_delay: self.sustained_delay_ms,
        }
    }
}

fn default_backoff() -> Vec<u64> {
    vec![100, 250, 500, 1000]
}

fn default_sustained_delay() -> u64 {
    1000
}

/// A filter subscribed on startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSection {
    pub filter: String,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id)
            .map_err(|e| ConfigError::InvalidAgentId(format!("'{}': {e}", self.agent.id)))?;

        validate_broker_url(&self.mqtt.broker_url)?;

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be greater than 0".to_string(),
            ));
        }

        self.reconnect
            .to_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        for subscription in &self.subscriptions {
            validate_filter(&subscription.filter).map_err(|e| {
                ConfigError::InvalidConfig(format!(
                    "subscription filter '{}': {e}",
                    subscription.filter
                ))
            })?;
        }

        Ok(())
    }
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("broker_url '{broker_url}': {e}")))?;

    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        other => {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url scheme '{other}' is not supported"
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidConfig(format!(
            "broker_url '{broker_url}' has no host"
        )));
    }

    Ok(())
}
