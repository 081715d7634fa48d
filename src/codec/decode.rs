//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties, PubAck, Publish,
    QoS, ReasonCode, PROTOCOL_LEVEL_V5, PROTOCOL_NAME,
};

/// MQTT v5.0 packet decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer.
    /// Returns `Ok(None)` until a complete packet is buffered,
    /// otherwise (packet, bytes_consumed).
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }
        let body = &buf[1 + len_bytes..total_len];

        let packet_type = PacketType::from_u8(first_byte >> 4)
            .ok_or(DecodeError::UnsupportedPacketType(first_byte >> 4))?;
        let packet = match packet_type {
            PacketType::Connect => decode_connect(flags, body)?,
            PacketType::ConnAck => decode_connack(flags, body)?,
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::PubAck => decode_puback(flags, body)?,
            PacketType::PingReq | PacketType::PingResp => {
                if flags != 0 || !body.is_empty() {
                    return Err(DecodeError::InvalidFlags);
                }
                if packet_type == PacketType::PingReq {
                    Packet::PingReq
                } else {
                    Packet::PingResp
                }
            }
            PacketType::Disconnect => decode_disconnect(flags, body)?,
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a trailing reason code + properties block, both optional
fn reason_and_properties(body: &[u8]) -> Result<(ReasonCode, Properties), DecodeError> {
    match body.split_first() {
        None => Ok((ReasonCode::SUCCESS, Properties::default())),
        Some((code, [])) => Ok((ReasonCode(*code), Properties::default())),
        Some((code, rest)) => {
            let (properties, _) = Properties::decode(rest)?;
            Ok((ReasonCode(*code), properties))
        }
    }
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;
    let (name, len) = read_string(body)?;
    pos += len;
    if name != PROTOCOL_NAME || body.get(pos) != Some(&PROTOCOL_LEVEL_V5) {
        return Err(DecodeError::InvalidProtocol);
    }
    pos += 1;

    let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    pos += 1;
    if connect_flags & 0x01 != 0 {
        return Err(DecodeError::MalformedPacket("reserved connect flag set"));
    }
    if connect_flags & 0x04 != 0 {
        return Err(DecodeError::MalformedPacket("will messages not supported"));
    }

    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let (properties, len) = Properties::decode(&body[pos..])?;
    pos += len;

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let username = if connect_flags & 0x80 != 0 {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        let (b, _) = read_binary(&body[pos..])?;
        Some(Bytes::copy_from_slice(b))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_start: connect_flags & 0x02 != 0,
        keep_alive,
        username,
        password,
        properties,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let acknowledge_flags = body[0];
    if acknowledge_flags & 0xFE != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let properties = if body.len() > 2 {
        Properties::decode(&body[2..])?.0
    } else {
        Properties::default()
    };

    Ok(Packet::ConnAck(ConnAck {
        session_present: acknowledge_flags & 0x01 != 0,
        reason_code: ReasonCode(body[1]),
        properties,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = flags & 0x08 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = flags & 0x01 != 0;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;
    let (topic, len) = read_string(body)?;
    pos += len;
    if topic.contains(['+', '#']) {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    let (properties, len) = Properties::decode(&body[pos..])?;
    pos += len;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
        properties,
    }))
}

fn decode_puback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let packet_id = read_u16(body)?;
    let (reason_code, properties) = reason_and_properties(&body[2..])?;
    Ok(Packet::PubAck(PubAck {
        packet_id,
        reason_code,
        properties,
    }))
}

fn decode_disconnect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let (reason_code, properties) = reason_and_properties(body)?;
    Ok(Packet::Disconnect(Disconnect {
        reason_code,
        properties,
    }))
}
