//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, PubAck, Publish, QoS, ReasonCode,
    PROTOCOL_LEVEL_V5, PROTOCOL_NAME,
};

/// MQTT v5.0 packet encoder
#[derive(Debug, Clone)]
pub struct Encoder {
    /// Largest packet the peer accepts (from its Maximum Packet Size property)
    max_packet_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH + 5,
        }
    }

    /// Limit encoded packets to the size the peer announced
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH + 5);
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let start = buf.len();
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf)?,
            Packet::ConnAck(p) => self.encode_connack(p, buf)?,
            Packet::Publish(p) => self.encode_publish(p, buf)?,
            Packet::PubAck(p) => self.encode_puback(p, buf)?,
            Packet::PingReq => buf.put_slice(&[0xC0, 0x00]),
            Packet::PingResp => buf.put_slice(&[0xD0, 0x00]),
            Packet::Disconnect(p) => self.encode_disconnect(p, buf)?,
        }

        if buf.len() - start > self.max_packet_size {
            buf.truncate(start);
            return Err(EncodeError::PacketTooLarge);
        }
        Ok(())
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name, level, flags, keep alive
        let mut remaining_length = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        remaining_length += packet.properties.wire_size();
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL_V5);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);
        packet.properties.encode(buf)?;

        write_string(buf, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.properties.wire_size();

        buf.put_u8(0x20);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u8(u8::from(packet.session_present));
        buf.put_u8(packet.reason_code.0);
        packet.properties.encode(buf)
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.topic.is_empty() || packet.topic.contains(['+', '#']) {
            return Err(EncodeError::InvalidTopicName);
        }
        let packet_id = match (packet.qos, packet.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) if id != 0 => Some(id),
            _ => return Err(EncodeError::MissingPacketId),
        };

        let mut remaining_length = 2 + packet.topic.len();
        if packet_id.is_some() {
            remaining_length += 2;
        }
        remaining_length += packet.properties.wire_size();
        remaining_length += packet.payload.len();

        let mut first_byte = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup && packet_id.is_some() {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }

        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, &packet.topic)?;
        if let Some(id) = packet_id {
            buf.put_u16(id);
        }
        packet.properties.encode(buf)?;
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_puback(&self, packet: &PubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Reason code and properties may be omitted on plain success
        if packet.reason_code == ReasonCode::SUCCESS && packet.properties.is_empty() {
            buf.put_slice(&[0x40, 0x02]);
            buf.put_u16(packet.packet_id);
            return Ok(());
        }

        let remaining_length = 3 + packet.properties.wire_size();
        buf.put_u8(0x40);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        buf.put_u8(packet.reason_code.0);
        packet.properties.encode(buf)
    }

    fn encode_disconnect(
        &self,
        packet: &Disconnect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if packet.reason_code == ReasonCode::SUCCESS && packet.properties.is_empty() {
            buf.put_slice(&[0xE0, 0x00]);
            return Ok(());
        }

        let remaining_length = 1 + packet.properties.wire_size();
        buf.put_u8(0xE0);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u8(packet.reason_code.0);
        packet.properties.encode(buf)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}
