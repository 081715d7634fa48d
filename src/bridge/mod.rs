//! Broker Bridge Module
//!
//! Carries commands accepted by the HTTP API to the message broker.
//!
//! The API pushes `(target_id, payload)` pairs into an [`OutboundQueue`]
//! through the [`Bridge`] facade. A single broker worker, driven by a
//! [`ConnectionSupervisor`], owns the broker session: it drains the queue
//! whenever the broker grants send credit, and reconnects with exponential
//! backoff when the connection drops. Failures the worker cannot recover
//! from locally are escalated to the [`RestartController`], which replaces
//! the worker and carries the queue contents over.
//!
//! # Example Configuration
//!
//! ```toml
//! [broker]
//! address = "broker.example.com:1883"
//! topic = "commands"
//! target_property = "Car_ID"
//! min_reconnect_delay = 1
//! max_reconnect_delay = 64
//! ```

mod backoff;
mod facade;
mod link;
mod mqtt;
mod queue;
mod restart;
mod supervisor;


pub use backoff::{BackoffPolicy, BackoffState};
pub use facade::Bridge;
pub use link::{BrokerConnector, BrokerSession, LinkError, LinkEvent};
pub use mqtt::{MqttConnector, MqttSession};
pub use queue::{EnqueueError, OutboundMessage, OutboundQueue};
pub use restart::{ControllerState, RestartController, RestartHandle};
pub use supervisor::{
    ConnectionState, ConnectionStatus, ConnectionSupervisor, RestartRequest, StateSnapshot,
    SupervisorHandle,
};

// Re-export config types from the config module for convenience
pub use crate::config::BrokerConfig;
