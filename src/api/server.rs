//! HTTP server for the command API
//!
//! Routes:
//! - `POST /api/item/from_ms_api/{id}`: batch of commands
//! - `GET  /api/item/from_ms_api/{id}`: broker connection health
//! - `POST /api/item/from_local_mgr_api/{id}`: single endpoint update
//! - `GET  /api/item/test/{id}`: diagnostics (`ORDER36` or `restart` rebuilds the broker pipeline)
//! - `GET  /metrics`, `GET /healthz`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::command::{self, Batch};
use crate::bridge::{Bridge, RestartHandle};
use crate::metrics::Metrics;

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Diagnostic ids that trigger a full restart
const RESTART_TEST_IDS: &[&str] = &["ORDER36", "restart"];

/// Everything a request handler needs
#[derive(Clone)]
pub struct ApiState {
    pub bridge: Arc<Bridge>,
    pub restart: RestartHandle,
    pub metrics: Arc<Metrics>,
    /// Serve /metrics
    pub metrics_enabled: bool,
}

/// HTTP server that accepts commands for the broker
pub struct ApiServer {
    listener: TcpListener,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub async fn bind(addr: SocketAddr, state: ApiState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("API server listening on http://{}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New API connection from {}", addr);
                    self.serve_connection(stream);
                }
                Err(e) => {
                    error!("Failed to accept API connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn serve_connection(&self, stream: TcpStream) {
        let io = TokioIo::new(stream);
        let state = self.state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving API connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body for {}: {}", path, e);
            return Ok(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large or unreadable",
            ));
        }
    };

    Ok(dispatch(&method, &path, &body, &state))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Commands(&'a str),
    EndpointUpdate(&'a str),
    Test(&'a str),
    Metrics,
    Health,
}

/// The `{id}` segment after `prefix`, if the path has exactly one more segment
fn item_id<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix).filter(|id| !id.contains('/'))
}

fn route(path: &str) -> Option<Route<'_>> {
    if let Some(id) = item_id(path, "/api/item/from_ms_api/") {
        return Some(Route::Commands(id));
    }
    if let Some(id) = item_id(path, "/api/item/from_local_mgr_api/") {
        return Some(Route::EndpointUpdate(id));
    }
    if let Some(id) = item_id(path, "/api/item/test/") {
        return Some(Route::Test(id));
    }
    match path {
        "/metrics" => Some(Route::Metrics),
        "/health" | "/healthz" => Some(Route::Health),
        _ => None,
    }
}

/// Route a fully read request
pub fn dispatch(
    method: &Method,
    path: &str,
    body: &[u8],
    state: &ApiState,
) -> Response<Full<Bytes>> {
    let Some(route) = route(path) else {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    };

    match (method, route) {
        (&Method::POST, Route::Commands(_)) => {
            let _timer = state.metrics.request_duration.start_timer();
            post_commands(body, state)
        }
        (&Method::GET, Route::Commands(_)) => connection_health(state),
        (&Method::POST, Route::EndpointUpdate(_)) => {
            let _timer = state.metrics.request_duration.start_timer();
            post_endpoint_update(body, state)
        }
        (&Method::GET, Route::Test(id)) => run_test(id, state),
        (&Method::GET, Route::Metrics) if state.metrics_enabled => render_metrics(state),
        (&Method::GET, Route::Metrics) => text_response(StatusCode::NOT_FOUND, "Not Found"),
        (&Method::GET, Route::Health) => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
    }
}

fn post_commands(body: &[u8], state: &ApiState) -> Response<Full<Bytes>> {
    let started = Instant::now();

    let Batch {
        body: mut echo,
        commands,
        mut skipped,
    } = match command::parse_batch(body) {
        Ok(batch) => batch,
        Err(e) => {
            state.metrics.message_rejected("malformed");
            warn!("Rejected command batch: {}", e);
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    for _ in &skipped {
        state.metrics.message_rejected("malformed");
    }
    for (index, command) in commands {
        if state
            .bridge
            .enqueue(command.target_id, command.payload)
            .is_err()
        {
            skipped.push(index);
        }
    }
    skipped.sort_unstable();

    let conn_state = if skipped.is_empty() {
        state.bridge.connection_status().to_string()
    } else {
        warn!("Skipped {} command(s) at {:?}", skipped.len(), skipped);
        "-1".to_string()
    };

    echo.insert(
        "rr_process_time".to_string(),
        json!(started.elapsed().as_secs_f64() * 1000.0),
    );
    echo.insert("broker_conn_state".to_string(), json!(conn_state));
    if !skipped.is_empty() {
        echo.insert("skipped_messages".to_string(), json!(skipped));
    }

    json_response(StatusCode::OK, &Value::Object(echo))
}

fn post_endpoint_update(body: &[u8], state: &ApiState) -> Response<Full<Bytes>> {
    let (echo, command) = match command::parse_endpoint_update(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            state.metrics.message_rejected("malformed");
            warn!("Rejected endpoint update: {}", e);
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    debug!("Endpoint update for {}", command.target_id);
    match state.bridge.enqueue(command.target_id, command.payload) {
        Ok(()) => json_response(StatusCode::OK, &Value::Object(echo)),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

fn connection_health(state: &ApiState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &json!({
            "Connection_state": state.bridge.connection_status().to_string(),
            "AMQP_broker_endpoint": state.bridge.server_address(),
            "Queue_depth": state.bridge.queue_depth(),
        }),
    )
}

fn run_test(id: &str, state: &ApiState) -> Response<Full<Bytes>> {
    let mut reply = Map::new();
    reply.insert("test_id".to_string(), json!(id));

    if RESTART_TEST_IDS.contains(&id) {
        warn!("Restart requested through the test endpoint ({})", id);
        let accepted = state.restart.request_restart(format!("test request {}", id));
        if !accepted {
            error!("Restart controller is not running");
        }
        reply.insert("restart_requested".to_string(), json!(accepted));
    } else {
        info!("test req: {}", id);
    }

    json_response(StatusCode::OK, &Value::Object(reply))
}

fn render_metrics(state: &ApiState) -> Response<Full<Bytes>> {
    state
        .metrics
        .queue_depth
        .set(state.bridge.queue_depth() as i64);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", encoder.format_type())
            .body(Full::new(Bytes::from(buffer)))
            .unwrap(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(text)))
        .unwrap()
}
