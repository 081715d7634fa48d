//! Broker Configuration
//!
//! Connection settings for the upstream MQTT broker that commands are
//! published to.

use std::time::Duration;

use serde::Deserialize;

/// Default MQTT port when the address has none
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Configuration for the broker connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address (host:port, host, or scheme://host:port)
    pub address: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Topic every command is published to
    pub topic: String,

    /// Client ID to use when connecting
    pub client_id: String,

    /// Keep-alive interval in seconds (0 disables keep-alive)
    pub keepalive: u16,

    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// First reconnect delay in seconds
    pub min_reconnect_delay: u64,

    /// Reconnect delay ceiling in seconds
    pub max_reconnect_delay: u64,

    /// Maximum unacknowledged publishes, further capped by the broker
    pub max_inflight: u16,

    /// User property carrying the target id
    pub target_property: String,

    /// Message expiry interval in seconds
    pub message_expiry: Option<u32>,

    /// Seconds a worker gets to exit before it is aborted
    pub shutdown_grace: u64,

    /// Largest packet accepted from the broker, in bytes
    pub max_packet_size: usize,
}

fn default_client_id() -> String {
    format!("response-router-{}", std::process::id())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            username: None,
            password: None,
            topic: "commands".to_string(),
            client_id: default_client_id(),
            keepalive: 60,
            connect_timeout: 30,
            min_reconnect_delay: 1,
            max_reconnect_delay: 64,
            max_inflight: 32,
            target_property: "Car_ID".to_string(),
            message_expiry: None,
            shutdown_grace: 5,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl BrokerConfig {
    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn min_reconnect_duration(&self) -> Duration {
        Duration::from_secs(self.min_reconnect_delay)
    }

    pub fn max_reconnect_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay)
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    /// Parse address into host and port, ignoring any URL scheme
    pub fn parse_address(&self) -> (String, u16) {
        let address = self
            .address
            .split_once("://")
            .map_or(self.address.as_str(), |(_, rest)| rest)
            .trim_end_matches('/');
        if let Some((host, port_str)) = address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (address.to_string(), DEFAULT_BROKER_PORT)
    }
}
