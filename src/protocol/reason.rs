//! MQTT v5.0 Reason Codes
//!
//! Kept as a raw byte so codes a broker sends that this client has no name
//! for still survive into status reporting.

use std::fmt;

/// MQTT v5.0 reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const NO_MATCHING_SUBSCRIBERS: Self = Self(0x10);
    pub const UNSPECIFIED_ERROR: Self = Self(0x80);
    pub const MALFORMED_PACKET: Self = Self(0x81);
    pub const PROTOCOL_ERROR: Self = Self(0x82);
    pub const IMPLEMENTATION_ERROR: Self = Self(0x83);
    pub const UNSUPPORTED_PROTOCOL_VERSION: Self = Self(0x84);
    pub const CLIENT_ID_NOT_VALID: Self = Self(0x85);
    pub const BAD_USER_NAME_OR_PASSWORD: Self = Self(0x86);
    pub const NOT_AUTHORIZED: Self = Self(0x87);
    pub const SERVER_UNAVAILABLE: Self = Self(0x88);
    pub const SERVER_BUSY: Self = Self(0x89);
    pub const BANNED: Self = Self(0x8A);
    pub const SERVER_SHUTTING_DOWN: Self = Self(0x8B);
    pub const KEEP_ALIVE_TIMEOUT: Self = Self(0x8D);
    pub const SESSION_TAKEN_OVER: Self = Self(0x8E);
    pub const TOPIC_NAME_INVALID: Self = Self(0x90);
    pub const RECEIVE_MAX_EXCEEDED: Self = Self(0x93);
    pub const PACKET_TOO_LARGE: Self = Self(0x95);
    pub const QUOTA_EXCEEDED: Self = Self(0x97);
    pub const ADMINISTRATIVE_ACTION: Self = Self(0x98);
    pub const PAYLOAD_FORMAT_INVALID: Self = Self(0x99);
    pub const QOS_NOT_SUPPORTED: Self = Self(0x9B);
    pub const USE_ANOTHER_SERVER: Self = Self(0x9C);
    pub const SERVER_MOVED: Self = Self(0x9D);
    pub const CONNECTION_RATE_EXCEEDED: Self = Self(0x9F);

    /// Check if this reason code indicates success
    #[inline]
    pub fn is_success(self) -> bool {
        self.0 < 0x80
    }

    /// Check if this reason code indicates failure
    #[inline]
    pub fn is_error(self) -> bool {
        self.0 >= 0x80
    }

    /// Human readable name, if the code is one this client knows
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "Success",
            Self::NO_MATCHING_SUBSCRIBERS => "No matching subscribers",
            Self::UNSPECIFIED_ERROR => "Unspecified error",
            Self::MALFORMED_PACKET => "Malformed Packet",
            Self::PROTOCOL_ERROR => "Protocol Error",
            Self::IMPLEMENTATION_ERROR => "Implementation specific error",
            Self::UNSUPPORTED_PROTOCOL_VERSION => "Unsupported Protocol Version",
            Self::CLIENT_ID_NOT_VALID => "Client Identifier not valid",
            Self::BAD_USER_NAME_OR_PASSWORD => "Bad User Name or Password",
            Self::NOT_AUTHORIZED => "Not authorized",
            Self::SERVER_UNAVAILABLE => "Server unavailable",
            Self::SERVER_BUSY => "Server busy",
            Self::BANNED => "Banned",
            Self::SERVER_SHUTTING_DOWN => "Server shutting down",
            Self::KEEP_ALIVE_TIMEOUT => "Keep Alive timeout",
            Self::SESSION_TAKEN_OVER => "Session taken over",
            Self::TOPIC_NAME_INVALID => "Topic Name invalid",
            Self::RECEIVE_MAX_EXCEEDED => "Receive Maximum exceeded",
            Self::PACKET_TOO_LARGE => "Packet too large",
            Self::QUOTA_EXCEEDED => "Quota exceeded",
            Self::ADMINISTRATIVE_ACTION => "Administrative action",
            Self::PAYLOAD_FORMAT_INVALID => "Payload format invalid",
            Self::QOS_NOT_SUPPORTED => "QoS not supported",
            Self::USE_ANOTHER_SERVER => "Use another server",
            Self::SERVER_MOVED => "Server moved",
            Self::CONNECTION_RATE_EXCEEDED => "Connection rate exceeded",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:02X})", name, self.0),
            None => write!(f, "reason 0x{:02X}", self.0),
        }
    }
}
