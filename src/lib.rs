//! Response Router - HTTP command API bridged to an MQTT v5.0 broker
//!
//! Commands arrive over HTTP, are queued in memory and published to a
//! single broker topic over one supervised broker connection. The
//! connection reconnects with exponential backoff and is rebuilt from
//! scratch when the broker ends the session in a way a reconnect cannot fix.

pub mod api;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod protocol;

pub use api::{ApiServer, ApiState};
pub use bridge::{Bridge, MqttConnector, RestartController, RestartHandle};
pub use config::Config;
pub use metrics::Metrics;
pub use protocol::{Packet, QoS, ReasonCode};
