//! Configuration types for sessions and signaling

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the signaling client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub url: String,

    /// Maximum reconnection attempts after an unexpected close (0 = unlimited)
    pub reconnect_attempts: u32,

    /// Initial reconnection delay in milliseconds
    pub reconnect_delay_ms: u64,

    /// Maximum reconnection delay in milliseconds
    pub reconnect_delay_max_ms: u64,
}

impl SignalingConfig {
    /// Create a configuration for the given signaling server URL with
    /// default reconnection behavior (unlimited attempts, 1s..30s backoff).
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            reconnect_attempts: 0,
            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 30000,
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `url` is not a WebSocket URL
    /// - `reconnect_delay_ms` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "url must start with ws:// or wss://, got {}",
                self.url
            )));
        }

        if self.reconnect_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_delay_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Set the maximum number of reconnection attempts (0 = unlimited)
    pub fn set_reconnect_attempts(&mut self, attempts: u32) {
        self.reconnect_attempts = attempts;
    }

    /// Set the base reconnection delay, raising the maximum if it falls below
    pub fn set_reconnect_delay(&mut self, millis: u64) {
        self.reconnect_delay_ms = millis;
        if self.reconnect_delay_max_ms < millis {
            self.reconnect_delay_max_ms = millis;
        }
    }

    /// Set the maximum reconnection delay, lowering the base if it exceeds it
    pub fn set_reconnect_delay_max(&mut self, millis: u64) {
        self.reconnect_delay_max_ms = millis;
        if self.reconnect_delay_ms > millis {
            self.reconnect_delay_ms = millis;
        }
    }

    /// Set the maximum number of reconnection attempts (builder style)
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.set_reconnect_attempts(attempts);
        self
    }

    /// Set the base reconnection delay (builder style)
    pub fn with_reconnect_delay(mut self, millis: u64) -> Self {
        self.set_reconnect_delay(millis);
        self
    }

    /// Set the maximum reconnection delay (builder style)
    pub fn with_reconnect_delay_max(mut self, millis: u64) -> Self {
        self.set_reconnect_delay_max(millis);
        self
    }

    /// Derive the reconnection policy from this configuration
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: self.reconnect_attempts,
            base_delay_ms: self.reconnect_delay_ms,
            max_delay_ms: self.reconnect_delay_max_ms,
        }
    }
}

/// Reconnection policy for the signaling connection
///
/// Controls how reconnection attempts are made when the connection to the
/// signaling server is lost unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of attempts (0 = unlimited)
    pub attempts: u32,

    /// Initial backoff delay in milliseconds
    pub base_delay_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Check if another attempt is allowed after `attempts_made` attempts
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.attempts == 0 || attempts_made < self.attempts
    }

    /// Calculate the backoff delay for the next attempt
    ///
    /// Doubles from the base delay per attempt already made, saturating at
    /// the maximum delay.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let mut millis = self.base_delay_ms;
        for _ in 0..attempts_made {
            if millis >= self.max_delay_ms {
                break;
            }
            millis = millis.saturating_mul(2);
        }
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

/// Configuration for a data channel adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Outstanding-bytes high-water mark above which sends are rejected
    pub high_watermark: u64,

    /// Bound on how long a synchronous send waits for the transport to drain
    pub sync_send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            high_watermark: 16 * 1024 * 1024,
            sync_send_timeout: Duration::from_secs(60),
        }
    }
}

impl ChannelConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.high_watermark == 0 {
            return Err(Error::InvalidConfig(
                "high_watermark must be non-zero".to_string(),
            ));
        }

        if self.sync_send_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "sync_send_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Configuration for the connectivity engine behind peer sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Data channel settings applied to every adapter the session creates
    pub channel: ChannelConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            channel: ChannelConfig::default(),
        }
    }
}

impl PeerConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if `stun_servers` is empty or the channel settings
    /// are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        self.channel.validate()?;

        Ok(())
    }

    /// Add TURN servers to this configuration (builder style)
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }
}
