//! Integration Tests for the Response Router
//!
//! A small MQTT v5 broker is played in-test over real TCP with the crate's
//! own codec, so the full path from HTTP request to PUBLISH on the wire is
//! exercised, including reconnects and full restarts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use response_router::api::{ApiServer, ApiState};
use response_router::bridge::{
    BackoffPolicy, Bridge, BrokerConfig, ConnectionState, ConnectionStatus, MqttConnector,
    RestartController, RestartHandle,
};
use response_router::codec::{Decoder, Encoder};
use response_router::metrics::Metrics;
use response_router::protocol::{
    ConnAck, Connect, Disconnect, Packet, Properties, Property, PropertyValue, PubAck, Publish,
    QoS, ReasonCode,
};

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// In-test broker
// ============================================================================

struct TestBroker {
    listener: TcpListener,
}

impl TestBroker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test broker");
        Self { listener }
    }

    fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accept the next client connection and complete the handshake
    async fn accept(&self) -> (BrokerConn, Connect) {
        let mut conn = self.accept_raw().await;
        let connect = conn.expect_connect().await;
        conn.send(&Packet::ConnAck(ConnAck::default())).await;
        (conn, connect)
    }

    async fn accept_raw(&self) -> BrokerConn {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("Router did not connect")
            .expect("Accept failed");
        BrokerConn {
            stream,
            buf: BytesMut::new(),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        }
    }
}

struct BrokerConn {
    stream: TcpStream,
    buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
}

impl BrokerConn {
    async fn send(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        self.encoder
            .encode(packet, &mut out)
            .expect("Failed to encode");
        self.stream.write_all(&out).await.expect("Failed to write");
    }

    /// Next packet from the router, answering PINGREQ along the way.
    /// `None` once the router closes the connection.
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, used)) = self.decoder.decode(&self.buf).expect("Bad packet") {
                let _ = self.buf.split_to(used);
                if packet == Packet::PingReq {
                    self.send(&Packet::PingResp).await;
                    continue;
                }
                return Some(packet);
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("Timed out waiting for the router")
                .ok()?;
            if n == 0 {
                return None;
            }
        }
    }

    async fn expect_connect(&mut self) -> Connect {
        match self.recv().await {
            Some(Packet::Connect(connect)) => *connect,
            other => panic!("Expected CONNECT, got {:?}", other),
        }
    }

    /// Receive a PUBLISH and acknowledge it
    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => {
                if let Some(packet_id) = publish.packet_id {
                    self.send(&Packet::PubAck(PubAck::new(packet_id))).await;
                }
                publish
            }
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }
}

// ============================================================================
// Router under test
// ============================================================================

struct Router {
    bridge: Arc<Bridge>,
    metrics: Arc<Metrics>,
    restart: RestartHandle,
    shutdown: watch::Sender<bool>,
    controller: JoinHandle<()>,
}

fn broker_config(addr: SocketAddr) -> BrokerConfig {
    BrokerConfig {
        address: addr.to_string(),
        topic: "fleet/commands".to_string(),
        client_id: "router-under-test".to_string(),
        keepalive: 30,
        connect_timeout: 5,
        min_reconnect_delay: 1,
        max_reconnect_delay: 2,
        shutdown_grace: 2,
        ..BrokerConfig::default()
    }
}

fn start_router(config: BrokerConfig) -> Router {
    let metrics = Arc::new(Metrics::new());
    let bridge = Arc::new(Bridge::new(config.address.clone(), 0, metrics.clone()));
    let policy = BackoffPolicy::new(
        config.min_reconnect_duration(),
        config.max_reconnect_duration(),
    );
    let grace = config.shutdown_grace_duration();
    let controller = RestartController::new(
        bridge.clone(),
        Arc::new(MqttConnector::new(config)),
        policy,
        grace,
        metrics.clone(),
    );
    let restart = controller.handle();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let controller = tokio::spawn(controller.run(shutdown_rx));

    Router {
        bridge,
        metrics,
        restart,
        shutdown,
        controller,
    }
}

impl Router {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        timeout(WAIT, self.controller)
            .await
            .expect("Controller did not stop")
            .expect("Controller panicked");
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_open(bridge: &Bridge) {
    eventually("an open connection", || bridge.connection_status().is_open()).await;
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn test_publishes_command_with_target_property() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));

    let (mut conn, connect) = broker.accept().await;
    assert!(connect.clean_start);
    assert_eq!(connect.client_id, "router-under-test");
    assert_eq!(
        connect.properties.get(Property::SESSION_EXPIRY_INTERVAL),
        Some(&PropertyValue::FourByte(0))
    );
    wait_open(&router.bridge).await;

    router
        .bridge
        .enqueue("car-7", json!({"action": "brake", "level": 2}))
        .unwrap();
    router.bridge.enqueue("car-8", json!("10.1.1.8:5672")).unwrap();

    let first = conn.expect_publish().await;
    assert_eq!(first.topic, "fleet/commands");
    assert_eq!(first.qos, QoS::AtLeastOnce);
    assert!(!first.retain);
    assert_eq!(first.properties.user_property("Car_ID"), Some("car-7"));
    assert_eq!(first.properties.content_type(), Some("application/json"));
    assert_eq!(first.properties.message_expiry_interval(), None);
    let body: Value = serde_json::from_slice(&first.payload).unwrap();
    assert_eq!(body, json!({"action": "brake", "level": 2}));

    let second = conn.expect_publish().await;
    assert_eq!(second.properties.user_property("Car_ID"), Some("car-8"));
    assert_eq!(second.properties.content_type(), None);
    assert_eq!(&second.payload[..], b"10.1.1.8:5672");

    eventually("sent counter", || router.metrics.messages_sent.get() == 2).await;
    router.stop().await;
}

#[tokio::test]
async fn test_message_expiry_and_assigned_client_id() {
    let broker = TestBroker::start().await;
    let router = start_router(BrokerConfig {
        client_id: String::new(),
        message_expiry: Some(120),
        ..broker_config(broker.addr())
    });

    let mut conn = broker.accept_raw().await;
    let connect = conn.expect_connect().await;
    assert_eq!(connect.client_id, "");
    conn.send(&Packet::ConnAck(ConnAck {
        properties: Properties::new().with(
            Property::ASSIGNED_CLIENT_IDENTIFIER,
            PropertyValue::Utf8("auto-7f3a".to_string()),
        ),
        ..ConnAck::default()
    }))
    .await;
    wait_open(&router.bridge).await;

    router.bridge.enqueue("car-1", json!("GO")).unwrap();
    let publish = conn.expect_publish().await;
    assert_eq!(publish.properties.user_property("Car_ID"), Some("car-1"));
    assert_eq!(publish.properties.message_expiry_interval(), Some(120));
    router.stop().await;
}

#[tokio::test]
async fn test_commands_queued_before_broker_is_up_are_delivered() {
    // Reserve a port, then close it so the first attempts are refused
    let addr = TestBroker::start().await.addr();
    let router = start_router(broker_config(addr));
    router.bridge.enqueue("early", json!("first")).unwrap();

    eventually("a failed connect", || {
        router.bridge.connection_status().state() == Some(ConnectionState::Disconnected)
    })
    .await;
    router.bridge.enqueue("late", json!("second")).unwrap();

    let listener = TcpListener::bind(addr).await.expect("Port was taken");
    let broker = TestBroker { listener };
    let (mut conn, _) = broker.accept().await;

    assert_eq!(conn.expect_publish().await.payload, &b"first"[..]);
    assert_eq!(conn.expect_publish().await.payload, &b"second"[..]);
    wait_open(&router.bridge).await;
    router.stop().await;
}

// ============================================================================
// Connection loss and restarts
// ============================================================================

#[tokio::test]
async fn test_reconnects_after_broker_drops_connection() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));

    let (conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;
    drop(conn);

    eventually("the drop to be noticed", || {
        !router.bridge.connection_status().is_open()
    })
    .await;
    router.bridge.enqueue("car-1", json!("after drop")).unwrap();

    let (mut conn, connect) = broker.accept().await;
    assert!(connect.clean_start);
    let publish = conn.expect_publish().await;
    assert_eq!(publish.properties.user_property("Car_ID"), Some("car-1"));

    wait_open(&router.bridge).await;
    assert_eq!(router.bridge.generation(), 1);
    assert!(router.metrics.reconnects_total.get() >= 1);
    assert_eq!(router.metrics.restarts_total.get(), 0);
    router.stop().await;
}

#[tokio::test]
async fn test_transient_disconnect_reason_is_reported() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));

    let (mut conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;
    conn.send(&Packet::Disconnect(Disconnect::with_reason(
        ReasonCode::SERVER_SHUTTING_DOWN,
    )))
    .await;

    let mut raw = broker.accept_raw().await;
    match router.bridge.connection_status() {
        ConnectionStatus::Known(snapshot) => {
            assert_ne!(snapshot.state, ConnectionState::Open);
            assert_eq!(snapshot.reason_code, ReasonCode::SERVER_SHUTTING_DOWN.0);
        }
        ConnectionStatus::Unknown => panic!("Status lost after disconnect"),
    }
    let _ = raw.expect_connect().await;
    raw.send(&Packet::ConnAck(ConnAck::default())).await;

    wait_open(&router.bridge).await;
    assert_eq!(router.bridge.generation(), 1);
    router.stop().await;
}

#[tokio::test]
async fn test_session_taken_over_restarts_pipeline() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));

    let (mut conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;
    assert_eq!(router.bridge.generation(), 1);

    let taken_over_at = std::time::Instant::now();
    conn.send(&Packet::Disconnect(Disconnect::with_reason(
        ReasonCode::SESSION_TAKEN_OVER,
    )))
    .await;

    let (mut conn, _) = broker.accept().await;
    // The new worker waits out the backoff floor before reconnecting
    assert!(taken_over_at.elapsed() >= Duration::from_millis(900));
    eventually("a second generation", || router.bridge.generation() == 2).await;
    wait_open(&router.bridge).await;
    assert_eq!(router.metrics.restarts_total.get(), 1);

    router.bridge.enqueue("car-2", json!("after restart")).unwrap();
    let publish = conn.expect_publish().await;
    assert_eq!(publish.properties.user_property("Car_ID"), Some("car-2"));
    router.stop().await;
}

#[tokio::test]
async fn test_refused_connack_is_retried() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));

    let mut raw = broker.accept_raw().await;
    let _ = raw.expect_connect().await;
    raw.send(&Packet::ConnAck(ConnAck {
        reason_code: ReasonCode::SERVER_BUSY,
        ..ConnAck::default()
    }))
    .await;

    let (_conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;
    assert_eq!(router.bridge.generation(), 1);
    router.stop().await;
}

#[tokio::test]
async fn test_shutdown_sends_disconnect() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));

    let (mut conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;

    let bridge = router.bridge.clone();
    router.stop().await;

    assert_eq!(
        conn.recv().await,
        Some(Packet::Disconnect(Disconnect::default()))
    );
    assert_eq!(conn.recv().await, None);
    assert_eq!(bridge.connection_status().to_string(), "CLOSED");
}

// ============================================================================
// HTTP API
// ============================================================================

async fn http(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("API not reachable");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .expect("API did not answer")
        .unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("No status line");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn start_api(router: &Router) -> (SocketAddr, JoinHandle<()>) {
    let server = ApiServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        ApiState {
            bridge: router.bridge.clone(),
            restart: router.restart.clone(),
            metrics: router.metrics.clone(),
            metrics_enabled: true,
        },
    )
    .await
    .expect("Failed to bind API");
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, task)
}

#[tokio::test]
async fn test_http_batch_reaches_broker() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));
    let (api, api_task) = start_api(&router).await;

    let (mut conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;

    let body = r#"{"messages": [
        {"Car_ID": "car-1", "message": {"lane": 2}},
        {"Car_ID": "car-2"},
        {"Car_ID": "car-3", "EP": "ep-3"}
    ]}"#;
    let (status, reply) = http(api, "POST", "/api/item/from_ms_api/1", body).await;
    assert_eq!(status, 200);
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["broker_conn_state"], json!("-1"));
    assert_eq!(reply["skipped_messages"], json!([1]));

    let first = conn.expect_publish().await;
    assert_eq!(first.properties.user_property("Car_ID"), Some("car-1"));
    let second = conn.expect_publish().await;
    assert_eq!(second.properties.user_property("Car_ID"), Some("car-3"));
    assert_eq!(&second.payload[..], b"ep-3");

    let (status, health) = http(api, "GET", "/api/item/from_ms_api/1", "").await;
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&health).unwrap();
    assert_eq!(health["Connection_state"], json!("OPEN"));
    assert_eq!(health["AMQP_broker_endpoint"], json!(broker.addr().to_string()));

    api_task.abort();
    router.stop().await;
}

#[tokio::test]
async fn test_http_restart_request() {
    let broker = TestBroker::start().await;
    let router = start_router(broker_config(broker.addr()));
    let (api, api_task) = start_api(&router).await;

    let (_conn, _) = broker.accept().await;
    wait_open(&router.bridge).await;

    let (status, reply) = http(api, "GET", "/api/item/test/ORDER36", "").await;
    assert_eq!(status, 200);
    assert!(reply.contains("\"restart_requested\":true"));

    let (_conn, _) = broker.accept().await;
    eventually("a second generation", || router.bridge.generation() == 2).await;
    wait_open(&router.bridge).await;

    let (status, metrics) = http(api, "GET", "/metrics", "").await;
    assert_eq!(status, 200);
    assert!(metrics.contains("router_restarts_total 1"));

    api_task.abort();
    router.stop().await;
}

#[tokio::test]
async fn test_publish_round_trip_properties_survive_codec() {
    // Guards the in-test broker itself: a PUBLISH built like the router's
    // decodes with the same user property and content type.
    let publish = Publish {
        qos: QoS::AtLeastOnce,
        topic: "t".to_string(),
        packet_id: Some(9),
        payload: bytes::Bytes::from_static(b"{}"),
        properties: Properties::new()
            .with_user_property("Car_ID", "x")
            .with(
                Property::CONTENT_TYPE,
                PropertyValue::Utf8("application/json".to_string()),
            ),
        ..Publish::default()
    };
    let mut buf = BytesMut::new();
    Encoder::new()
        .encode(&Packet::Publish(publish.clone()), &mut buf)
        .unwrap();
    let (decoded, used) = Decoder::new().decode(&buf).unwrap().unwrap();
    assert_eq!(used, buf.len());
    assert_eq!(decoded, Packet::Publish(publish));
}
