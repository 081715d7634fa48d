//! Broker Link Abstraction
//!
//! Traits between the connection supervisor and the transport that reaches
//! the broker. The MQTT implementation lives in `bridge::mqtt`; tests drive
//! the supervisor through an in-memory link.

use std::fmt;

use async_trait::async_trait;

use super::queue::OutboundMessage;
use crate::protocol::{DecodeError, EncodeError, ReasonCode};

/// Error type for broker link operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Connection could not be established or was lost
    ConnectionLost(String),
    /// Connect or keep-alive deadline passed
    Timeout,
    /// Broker refused the connection
    Rejected(ReasonCode),
    /// Broker ended the session
    SessionClosed(ReasonCode),
    /// Broker byte stream could not be decoded
    Protocol(DecodeError),
    /// Message could not be encoded; the connection is unaffected
    Encode(EncodeError),
}

impl LinkError {
    /// Whether the failure needs a full restart instead of a local reconnect
    pub fn is_fatal(&self) -> bool {
        match self {
            LinkError::Protocol(_) => true,
            LinkError::Rejected(code) | LinkError::SessionClosed(code) => matches!(
                *code,
                ReasonCode::SESSION_TAKEN_OVER
                    | ReasonCode::PROTOCOL_ERROR
                    | ReasonCode::MALFORMED_PACKET
            ),
            LinkError::ConnectionLost(_) | LinkError::Timeout | LinkError::Encode(_) => false,
        }
    }

    /// Broker reason code carried by the error, if any
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            LinkError::Rejected(code) | LinkError::SessionClosed(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            LinkError::Timeout => write!(f, "Operation timed out"),
            LinkError::Rejected(code) => write!(f, "Connection refused: {}", code),
            LinkError::SessionClosed(code) => write!(f, "Session closed by broker: {}", code),
            LinkError::Protocol(e) => write!(f, "Protocol error: {}", e),
            LinkError::Encode(e) => write!(f, "Encode error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::ConnectionLost(e.to_string())
    }
}

impl From<DecodeError> for LinkError {
    fn from(e: DecodeError) -> Self {
        LinkError::Protocol(e)
    }
}

impl From<EncodeError> for LinkError {
    fn from(e: EncodeError) -> Self {
        LinkError::Encode(e)
    }
}

/// Something the session wants the supervisor to act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Send credit was returned by the broker
    Credit,
    /// Time to send a keep-alive ping
    KeepAliveDue,
}

/// Opens sessions to the broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new non-durable session
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, LinkError>;

    /// Broker endpoint, for logs and diagnostics
    fn address(&self) -> &str;
}

/// An open session with the broker
#[async_trait]
pub trait BrokerSession: Send {
    /// Number of messages that may be sent right now
    fn credit(&self) -> usize;

    /// Transmit one message, consuming one unit of credit
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), LinkError>;

    /// Wait for the next event from the broker.
    ///
    /// Must be cancel-safe: the supervisor races it against the queue's wake
    /// signal and the cancellation flag.
    async fn next_event(&mut self) -> Result<LinkEvent, LinkError>;

    /// Send a keep-alive ping
    async fn keep_alive(&mut self) -> Result<(), LinkError>;

    /// End the session cleanly
    async fn close(&mut self) -> Result<(), LinkError>;
}
