//! Response Router - HTTP command API bridged to an MQTT v5.0 broker
//!
//! Usage:
//!   response-router [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      API bind address (default: 0.0.0.0:8080)
//!   --broker <ADDR>        Broker address (default: localhost:1883)
//!   -t, --topic <TOPIC>    Destination topic (default: commands)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use response_router::api::{ApiServer, ApiState};
use response_router::bridge::{BackoffPolicy, Bridge, MqttConnector, RestartController};
use response_router::config::Config;
use response_router::metrics::Metrics;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Response Router - forwards HTTP commands to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "response-router")]
#[command(version)]
#[command(about = "Forwards HTTP commands to an MQTT v5.0 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Broker address (host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Destination topic for commands
    #[arg(short, long)]
    topic: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Without a file, defaults plus environment
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides LOG_LEVEL
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }
    if let Some(broker) = args.broker {
        config.broker.address = broker;
    }
    if let Some(topic) = args.topic {
        config.broker.topic = topic;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting Response Router");
    info!("  API address: {}", config.api.bind);
    info!("  Broker: {}", config.broker.address);
    info!("  Topic: {}", config.broker.topic);
    info!(
        "  Reconnect delay: {}s..{}s",
        config.broker.min_reconnect_delay, config.broker.max_reconnect_delay
    );
    if config.queue.max_messages == 0 {
        info!("  Queue: unbounded");
    } else {
        info!("  Queue: {} messages", config.queue.max_messages);
    }
    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{}/metrics)", config.api.bind);
    } else {
        info!("  Metrics: disabled");
    }

    let metrics = Arc::new(Metrics::new());
    let bridge = Arc::new(Bridge::new(
        config.broker.address.clone(),
        config.queue.max_messages,
        metrics.clone(),
    ));
    let policy = BackoffPolicy::new(
        config.broker.min_reconnect_duration(),
        config.broker.max_reconnect_duration(),
    );
    let shutdown_grace = config.broker.shutdown_grace_duration();
    let connector = Arc::new(MqttConnector::new(config.broker));

    let controller = RestartController::new(
        bridge.clone(),
        connector,
        policy,
        shutdown_grace,
        metrics.clone(),
    );
    let restart = controller.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_task = tokio::spawn(controller.run(shutdown_rx));

    let server = ApiServer::bind(
        config.api.bind,
        ApiState {
            bridge,
            restart,
            metrics,
            metrics_enabled: config.metrics.enabled,
        },
    )
    .await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_task.await {
        error!("Restart controller task failed: {}", e);
    }
    info!("Response Router stopped");

    Ok(())
}
