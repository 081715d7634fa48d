//! MQTT Broker Link
//!
//! `BrokerConnector` over plain TCP speaking MQTT v5. Every session is
//! non-durable: clean start, session expiry 0, no retained publishes and no
//! retransmission of unacknowledged messages after a reconnect.
//!
//! Messages are published with QoS 1. The broker's Receive Maximum (capped
//! by `broker.max_inflight`) is the send credit; each PUBACK returns one unit.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::link::{BrokerConnector, BrokerSession, LinkError, LinkEvent};
use super::queue::OutboundMessage;
use crate::codec::{Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::protocol::{
    Connect, DecodeError, Disconnect, Packet, Properties, Property, PropertyValue, Publish, QoS,
};

/// Receive Maximum assumed when the broker does not announce one
const DEFAULT_RECEIVE_MAXIMUM: u16 = 65_535;

const READ_BUFFER_SIZE: usize = 4096;

/// Opens MQTT sessions to the configured broker
pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn connect_packet(&self) -> Packet {
        Packet::Connect(Box::new(Connect {
            client_id: self.config.client_id.clone(),
            clean_start: true,
            keep_alive: self.config.keepalive,
            username: self.config.username.clone(),
            password: self
                .config
                .password
                .as_ref()
                .map(|p| Bytes::copy_from_slice(p.as_bytes())),
            properties: Properties::new()
                .with(Property::SESSION_EXPIRY_INTERVAL, PropertyValue::FourByte(0))
                .with(
                    Property::RECEIVE_MAXIMUM,
                    PropertyValue::TwoByte(self.config.max_inflight.max(1)),
                )
                .with(
                    Property::MAXIMUM_PACKET_SIZE,
                    PropertyValue::FourByte(
                        u32::try_from(self.config.max_packet_size).unwrap_or(u32::MAX),
                    ),
                ),
        }))
    }

    async fn handshake(&self) -> Result<MqttSession, LinkError> {
        let (host, port) = self.config.parse_address();
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connected to {}:{}", host, port);

        let (mut reader, mut writer) = stream.into_split();
        let decoder = Decoder::new().with_max_packet_size(self.config.max_packet_size);
        let mut encoder = Encoder::new();

        let mut buf = BytesMut::new();
        encoder.encode(&self.connect_packet(), &mut buf)?;
        writer.write_all(&buf).await?;

        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let connack = loop {
            if let Some((packet, used)) = decoder.decode(&read_buf)? {
                read_buf.advance(used);
                break packet;
            }
            if reader.read_buf(&mut read_buf).await? == 0 {
                return Err(LinkError::ConnectionLost(
                    "connection closed before CONNACK".to_string(),
                ));
            }
        };

        let connack = match connack {
            Packet::ConnAck(ack) => ack,
            Packet::Disconnect(d) => return Err(LinkError::SessionClosed(d.reason_code)),
            other => {
                warn!("Expected CONNACK, got {}", other.name());
                return Err(LinkError::Protocol(DecodeError::MalformedPacket(
                    "expected CONNACK",
                )));
            }
        };
        if connack.reason_code.is_error() {
            if let Some(reason) = connack.properties.reason_string() {
                warn!("Broker refused connection: {}", reason);
            }
            return Err(LinkError::Rejected(connack.reason_code));
        }

        if let Some(assigned) = connack.properties.assigned_client_identifier() {
            info!("Broker assigned client identifier {}", assigned);
        }

        let receive_maximum = connack
            .properties
            .receive_maximum()
            .unwrap_or(DEFAULT_RECEIVE_MAXIMUM)
            .min(self.config.max_inflight.max(1));
        if let Some(limit) = connack.properties.maximum_packet_size() {
            encoder.set_max_packet_size(limit as usize);
        }
        let keep_alive = connack
            .properties
            .server_keep_alive()
            .unwrap_or(self.config.keepalive);
        let keep_alive = Duration::from_secs(keep_alive as u64);

        info!(
            "Connected to broker {} (receive_maximum={}, keep_alive={:?})",
            self.config.address, receive_maximum, keep_alive
        );

        let now = Instant::now();
        Ok(MqttSession {
            reader,
            writer,
            read_buf,
            write_buf: buf,
            encoder,
            decoder,
            topic: self.config.topic.clone(),
            target_property: self.config.target_property.clone(),
            message_expiry: self.config.message_expiry,
            receive_maximum: receive_maximum as usize,
            inflight: HashSet::new(),
            next_packet_id: 1,
            keep_alive,
            last_inbound: now,
            next_ping: now + keep_alive,
        })
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, LinkError> {
        let session = timeout(self.config.connect_timeout_duration(), self.handshake())
            .await
            .map_err(|_| LinkError::Timeout)??;
        Ok(Box::new(session))
    }

    fn address(&self) -> &str {
        &self.config.address
    }
}

/// An open MQTT session
pub struct MqttSession {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    topic: String,
    target_property: String,
    message_expiry: Option<u32>,
    receive_maximum: usize,
    /// Packet ids of publishes awaiting PUBACK
    inflight: HashSet<u16>,
    next_packet_id: u16,
    /// Zero disables keep-alive
    keep_alive: Duration,
    last_inbound: Instant,
    next_ping: Instant,
}

impl MqttSession {
    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            if !self.inflight.contains(&id) {
                return id;
            }
        }
    }

    fn publish_properties(&self, message: &OutboundMessage) -> Properties {
        let mut properties =
            Properties::new().with(Property::PAYLOAD_FORMAT_INDICATOR, PropertyValue::Byte(1));
        if message.is_json() {
            properties.push(
                Property::CONTENT_TYPE,
                PropertyValue::Utf8("application/json".to_string()),
            );
        }
        if let Some(expiry) = self.message_expiry {
            properties.push(
                Property::MESSAGE_EXPIRY_INTERVAL,
                PropertyValue::FourByte(expiry),
            );
        }
        properties.with_user_property(self.target_property.as_str(), message.target_id.as_str())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), LinkError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Apply one packet from the broker; `Some` when the supervisor must act
    fn handle_packet(&mut self, packet: Packet) -> Result<Option<LinkEvent>, LinkError> {
        match packet {
            Packet::PubAck(ack) => {
                if !self.inflight.remove(&ack.packet_id) {
                    warn!("PUBACK for unknown packet id {}", ack.packet_id);
                    return Ok(None);
                }
                if ack.reason_code.is_error() {
                    warn!(
                        "Broker rejected publish {}: {}",
                        ack.packet_id, ack.reason_code
                    );
                }
                Ok(Some(LinkEvent::Credit))
            }
            Packet::PingResp => Ok(None),
            Packet::Disconnect(d) => {
                match d.properties.reason_string() {
                    Some(reason) => warn!("Broker disconnected: {} ({})", d.reason_code, reason),
                    None => warn!("Broker disconnected: {}", d.reason_code),
                }
                Err(LinkError::SessionClosed(d.reason_code))
            }
            other => {
                warn!("Unexpected {} from broker", other.name());
                Err(LinkError::Protocol(DecodeError::MalformedPacket(
                    "unexpected packet from broker",
                )))
            }
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    fn credit(&self) -> usize {
        self.receive_maximum.saturating_sub(self.inflight.len())
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), LinkError> {
        let packet_id = self.allocate_packet_id();
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: self.topic.clone(),
            packet_id: Some(packet_id),
            payload: message.body(),
            properties: self.publish_properties(message),
        });
        self.write_packet(&publish).await?;
        self.inflight.insert(packet_id);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<LinkEvent, LinkError> {
        loop {
            while let Some((packet, used)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(used);
                if let Some(event) = self.handle_packet(packet)? {
                    return Ok(event);
                }
            }

            let keep_alive_enabled = !self.keep_alive.is_zero();
            let expiry = self.last_inbound + self.keep_alive * 3 / 2;
            let wake_at = self.next_ping.min(expiry);

            tokio::select! {
                result = self.reader.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Err(LinkError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }
                    self.last_inbound = Instant::now();
                }
                _ = tokio::time::sleep_until(wake_at), if keep_alive_enabled => {
                    let now = Instant::now();
                    if now >= expiry {
                        return Err(LinkError::Timeout);
                    }
                    self.next_ping = now + self.keep_alive;
                    return Ok(LinkEvent::KeepAliveDue);
                }
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<(), LinkError> {
        self.write_packet(&Packet::PingReq).await
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.write_packet(&Packet::Disconnect(Disconnect::default()))
            .await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
