//! MQTT v5.0 Properties
//!
//! Properties are stored as (identifier, value) pairs and decoded by wire
//! type, so the client accepts every property a broker may legally attach to
//! a CONNACK or DISCONNECT without needing a field for each one.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_variable_int, variable_int_len, write_binary, write_string,
    write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Wire representation of a property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByte(u16),
    FourByte(u32),
    VarInt(u32),
    Utf8(String),
    Binary(Bytes),
    Pair(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireKind {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Pair,
}

/// A single property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: u8,
    pub value: PropertyValue,
}

impl Property {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;

    fn wire_kind(id: u8) -> Option<WireKind> {
        let kind = match id {
            0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => WireKind::Byte,
            0x13 | 0x21 | 0x22 | 0x23 => WireKind::TwoByte,
            0x02 | 0x11 | 0x18 | 0x27 => WireKind::FourByte,
            0x0B => WireKind::VarInt,
            0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => WireKind::Utf8,
            0x09 | 0x16 => WireKind::Binary,
            0x26 => WireKind::Pair,
            _ => return None,
        };
        Some(kind)
    }

    /// User properties and subscription identifiers may repeat
    fn repeatable(id: u8) -> bool {
        id == Self::USER_PROPERTY || id == 0x0B
    }

    fn encoded_size(&self) -> usize {
        1 + match &self.value {
            PropertyValue::Byte(_) => 1,
            PropertyValue::TwoByte(_) => 2,
            PropertyValue::FourByte(_) => 4,
            PropertyValue::VarInt(v) => variable_int_len(*v),
            PropertyValue::Utf8(s) => 2 + s.len(),
            PropertyValue::Binary(b) => 2 + b.len(),
            PropertyValue::Pair(k, v) => 4 + k.len() + v.len(),
        }
    }
}

/// Collection of MQTT v5.0 properties in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    items: Vec<Property>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.items.iter()
    }

    /// Set a property, replacing an earlier value unless the id may repeat
    pub fn push(&mut self, id: u8, value: PropertyValue) {
        if !Property::repeatable(id) {
            self.items.retain(|p| p.id != id);
        }
        self.items.push(Property { id, value });
    }

    pub fn with(mut self, id: u8, value: PropertyValue) -> Self {
        self.push(id, value);
        self
    }

    pub fn with_user_property(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(
            Property::USER_PROPERTY,
            PropertyValue::Pair(key.into(), value.into()),
        )
    }

    pub fn get(&self, id: u8) -> Option<&PropertyValue> {
        self.items.iter().find(|p| p.id == id).map(|p| &p.value)
    }

    fn get_u16(&self, id: u8) -> Option<u16> {
        match self.get(id) {
            Some(PropertyValue::TwoByte(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_u32(&self, id: u8) -> Option<u32> {
        match self.get(id) {
            Some(PropertyValue::FourByte(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_str(&self, id: u8) -> Option<&str> {
        match self.get(id) {
            Some(PropertyValue::Utf8(s)) => Some(s),
            _ => None,
        }
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        self.get_u16(Property::RECEIVE_MAXIMUM)
    }

    pub fn server_keep_alive(&self) -> Option<u16> {
        self.get_u16(Property::SERVER_KEEP_ALIVE)
    }

    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.get_u32(Property::MAXIMUM_PACKET_SIZE)
    }

    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.get_u32(Property::MESSAGE_EXPIRY_INTERVAL)
    }

    pub fn reason_string(&self) -> Option<&str> {
        self.get_str(Property::REASON_STRING)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_str(Property::CONTENT_TYPE)
    }

    pub fn assigned_client_identifier(&self) -> Option<&str> {
        self.get_str(Property::ASSIGNED_CLIENT_IDENTIFIER)
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|p| match &p.value {
            PropertyValue::Pair(k, v) => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }

    /// First user property value with the given key
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Encoded size of the properties excluding the length prefix
    pub fn encoded_size(&self) -> usize {
        self.items.iter().map(Property::encoded_size).sum()
    }

    /// Encoded size including the variable byte integer length prefix
    pub fn wire_size(&self) -> usize {
        let size = self.encoded_size();
        variable_int_len(size as u32) + size
    }

    /// Encode the length prefix followed by every property
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;
        for prop in &self.items {
            buf.put_u8(prop.id);
            match &prop.value {
                PropertyValue::Byte(v) => buf.put_u8(*v),
                PropertyValue::TwoByte(v) => buf.put_u16(*v),
                PropertyValue::FourByte(v) => buf.put_u32(*v),
                PropertyValue::VarInt(v) => {
                    write_variable_int(buf, *v)?;
                }
                PropertyValue::Utf8(s) => write_string(buf, s)?,
                PropertyValue::Binary(b) => write_binary(buf, b)?,
                PropertyValue::Pair(k, v) => {
                    write_string(buf, k)?;
                    write_string(buf, v)?;
                }
            }
        }
        Ok(())
    }

    /// Decode a length-prefixed property block.
    /// Returns (properties, bytes_consumed).
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::new();
        let mut pos = len_bytes;

        while pos < end {
            let id = buf[pos];
            pos += 1;
            let kind = Property::wire_kind(id).ok_or(DecodeError::InvalidPropertyId(id))?;
            if !Property::repeatable(id) && props.get(id).is_some() {
                return Err(DecodeError::MalformedPacket("duplicate property"));
            }

            let block = &buf[pos..end];
            let (value, used) = match kind {
                WireKind::Byte => {
                    let v = *block.first().ok_or(DecodeError::InsufficientData)?;
                    (PropertyValue::Byte(v), 1)
                }
                WireKind::TwoByte => {
                    if block.len() < 2 {
                        return Err(DecodeError::InsufficientData);
                    }
                    (
                        PropertyValue::TwoByte(u16::from_be_bytes([block[0], block[1]])),
                        2,
                    )
                }
                WireKind::FourByte => {
                    if block.len() < 4 {
                        return Err(DecodeError::InsufficientData);
                    }
                    let v = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
                    (PropertyValue::FourByte(v), 4)
                }
                WireKind::VarInt => {
                    let (v, n) = read_variable_int(block)?;
                    (PropertyValue::VarInt(v), n)
                }
                WireKind::Utf8 => {
                    let (s, n) = read_string(block)?;
                    (PropertyValue::Utf8(s.to_string()), n)
                }
                WireKind::Binary => {
                    let (b, n) = read_binary(block)?;
                    (PropertyValue::Binary(Bytes::copy_from_slice(b)), n)
                }
                WireKind::Pair => {
                    let (k, kn) = read_string(block)?;
                    let (v, vn) = read_string(&block[kn..])?;
                    (PropertyValue::Pair(k.to_string(), v.to_string()), kn + vn)
                }
            };
            pos += used;
            props.items.push(Property { id, value });
        }

        Ok((props, end))
    }
}
