//! Client configuration.
//!
//! Configuration for the gateway client, including:
//! - Gateway endpoint and credential query parameter
//! - Token fetch and handshake timeouts
//! - Heartbeat, reconnection, queue and quality settings

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::GatewayError;
use crate::heartbeat::HeartbeatConfig;
use crate::quality::QualityConfig;
use crate::queue::QueueConfig;
use crate::reconnect::ReconnectConfig;

const REDACTED: &str = "REDACTED";

fn default_token_param() -> String {
    "token".to_string()
}

const fn default_token_timeout_ms() -> u64 {
    10_000
}

const fn default_handshake_timeout_ms() -> u64 {
    10_000
}

const fn default_max_protocol_errors() -> u32 {
    5
}

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Gateway WebSocket URL, without the credential.
    pub gateway_url: String,
    /// Query parameter that carries the credential.
    #[serde(default = "default_token_param")]
    pub token_param: String,
    /// Upper bound on a token fetch, in milliseconds.
    #[serde(default = "default_token_timeout_ms")]
    pub token_timeout_ms: u64,
    /// Upper bound on the transport handshake, in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Consecutive protocol errors tolerated before forcing a reconnect.
    #[serde(default = "default_max_protocol_errors")]
    pub max_protocol_errors: u32,
    /// Reconnection settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Outbound queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Quality estimation settings.
    #[serde(default)]
    pub quality: QualityConfig,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the endpoint.
    #[must_use]
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            token_param: default_token_param(),
            token_timeout_ms: default_token_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_protocol_errors: default_max_protocol_errors(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            quality: QualityConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, GatewayError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, GatewayError> {
        toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let url = self.base_url()?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(GatewayError::Config(
                "gateway_url must start with ws:// or wss://".to_string(),
            ));
        }

        if self.token_param.is_empty() {
            return Err(GatewayError::Config(
                "token_param cannot be empty".to_string(),
            ));
        }

        let nonzero = [
            ("token_timeout_ms", self.token_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            ("heartbeat.ack_timeout_ms", self.heartbeat.ack_timeout_ms),
            ("heartbeat.idle_timeout_ms", self.heartbeat.idle_timeout_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
            ("quality.check_interval_ms", self.quality.check_interval_ms),
            ("queue.capacity", self.queue.capacity as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(GatewayError::Config(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.heartbeat.max_missed_acks == 0 {
            return Err(GatewayError::Config(
                "heartbeat.max_missed_acks must be greater than 0".to_string(),
            ));
        }

        if self.max_protocol_errors == 0 {
            return Err(GatewayError::Config(
                "max_protocol_errors must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(GatewayError::Config(
                "reconnect.max_delay_ms must not be less than reconnect.base_delay_ms".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(GatewayError::Config(
                "reconnect.jitter_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    fn base_url(&self) -> Result<Url, GatewayError> {
        Url::parse(&self.gateway_url)
            .map_err(|e| GatewayError::Config(format!("invalid gateway_url: {e}")))
    }

    /// Build the handshake URL with `token` appended as a query parameter.
    /// Existing query parameters are preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if `gateway_url` does not parse.
    pub fn connection_url(&self, token: &str) -> Result<Url, GatewayError> {
        let mut url = self.base_url()?;
        url.query_pairs_mut().append_pair(&self.token_param, token);
        Ok(url)
    }

    /// Render `url` for logs with the credential replaced.
    #[must_use]
    pub fn redact(&self, url: &Url) -> String {
        let mut redacted = url.clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                if key == self.token_param.as_str() {
                    (key.into_owned(), REDACTED.to_string())
                } else {
                    (key.into_owned(), value.into_owned())
                }
            })
            .collect();
        if pairs.is_empty() {
            return redacted.to_string();
        }
        redacted.query_pairs_mut().clear().extend_pairs(pairs);
        redacted.to_string()
    }

    /// Token fetch timeout.
    #[must_use]
    pub const fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Set the reconnection settings.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the heartbeat settings.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the queue settings.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the quality settings.
    #[must_use]
    pub fn with_quality(mut self, quality: QualityConfig) -> Self {
        self.quality = quality;
        self
    }

    /// Set the token fetch timeout.
    #[must_use]
    pub fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the protocol error threshold.
    #[must_use]
    pub fn with_max_protocol_errors(mut self, max: u32) -> Self {
        self.max_protocol_errors = max;
        self
    }
}
