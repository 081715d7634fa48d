//! Connection Supervisor
//!
//! Owns the live broker session for one worker generation. The worker loop
//! connects, drains the outbound queue while the broker grants credit, and
//! reconnects with exponential backoff after transient failures. Fatal
//! failures are handed to the restart controller instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffPolicy, BackoffState};
use super::link::{BrokerConnector, BrokerSession, LinkError, LinkEvent};
use super::queue::OutboundQueue;
use crate::metrics::Metrics;

/// Broker connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Connection state plus the last reason code reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub reason_code: u8,
}

/// Result of a state query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No worker has reported a state yet
    Unknown,
    Known(StateSnapshot),
}

impl ConnectionStatus {
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionStatus::Unknown => None,
            ConnectionStatus::Known(snapshot) => Some(snapshot.state),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == Some(ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Unknown => f.write_str("UNKNOWN"),
            ConnectionStatus::Known(snapshot) => snapshot.state.fmt(f),
        }
    }
}

type StateCell = Arc<RwLock<Option<StateSnapshot>>>;

/// Asks the restart controller to rebuild the broker pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    /// Worker generation that asked; `None` for external requests
    pub generation: Option<u64>,
    pub reason: String,
    /// Reason code reported with the failure, 0 if none
    pub reason_code: u8,
    /// Backoff of the failed worker. The replacement waits the next delay
    /// from this state before its first connect.
    pub backoff: Option<BackoffState>,
}

impl RestartRequest {
    /// Request from outside the broker workers; the new worker connects at once
    pub fn external(reason: impl Into<String>) -> Self {
        Self {
            generation: None,
            reason: reason.into(),
            reason_code: 0,
            backoff: None,
        }
    }
}

/// The parts of a supervisor the facade keeps after the worker is spawned
#[derive(Debug)]
pub struct SupervisorHandle {
    generation: u64,
    queue: Arc<OutboundQueue>,
    state: StateCell,
}

impl SupervisorHandle {
    /// Handle with no worker behind it, used until the first one starts
    pub fn standby(queue: Arc<OutboundQueue>) -> Self {
        Self {
            generation: 0,
            queue,
            state: Arc::new(RwLock::new(None)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn query_state(&self) -> ConnectionStatus {
        read_state(&self.state)
    }
}

fn read_state(cell: &StateCell) -> ConnectionStatus {
    match *cell.read() {
        Some(snapshot) => ConnectionStatus::Known(snapshot),
        None => ConnectionStatus::Unknown,
    }
}

/// Resolves once cancellation is signalled or the sender is gone
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Owns one broker session at a time and feeds it from the queue
pub struct ConnectionSupervisor {
    generation: u64,
    connector: Arc<dyn BrokerConnector>,
    queue: Arc<OutboundQueue>,
    state: StateCell,
    policy: BackoffPolicy,
    backoff: BackoffState,
    start_delay: Duration,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
    cancel: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl ConnectionSupervisor {
    pub fn new(
        generation: u64,
        connector: Arc<dyn BrokerConnector>,
        queue: Arc<OutboundQueue>,
        policy: BackoffPolicy,
        restart_tx: mpsc::UnboundedSender<RestartRequest>,
        cancel: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            generation,
            connector,
            queue,
            state: Arc::new(RwLock::new(Some(StateSnapshot {
                state: ConnectionState::Connecting,
                reason_code: 0,
            }))),
            backoff: policy.reset(),
            start_delay: Duration::ZERO,
            policy,
            restart_tx,
            cancel,
            metrics,
        }
    }

    /// Continue the backoff of a worker that failed fatally: wait `delay`
    /// before the first connect, then back off from `backoff`.
    pub fn resume_backoff(
        mut self,
        backoff: BackoffState,
        delay: Duration,
        reason_code: u8,
    ) -> Self {
        self.backoff = backoff;
        self.start_delay = delay;
        *self.state.write() = Some(StateSnapshot {
            state: ConnectionState::Connecting,
            reason_code,
        });
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            generation: self.generation,
            queue: self.queue.clone(),
            state: self.state.clone(),
        }
    }

    pub fn query_state(&self) -> ConnectionStatus {
        read_state(&self.state)
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn last_reason_code(&self) -> u8 {
        self.state.read().map_or(0, |s| s.reason_code)
    }

    fn set_state(&self, state: ConnectionState, reason_code: u8) {
        *self.state.write() = Some(StateSnapshot { state, reason_code });
        if state == ConnectionState::Open {
            self.metrics.connection_opened();
        } else {
            self.metrics.connection_closed();
        }
    }

    /// Worker loop; returns when cancelled or after requesting a restart
    pub async fn run(mut self) {
        info!("Broker worker started for {}", self.connector.address());

        let mut running = self.wait_start_delay().await;
        while running && !self.is_cancelled() {
            let result = match self.on_start().await {
                Ok(Some(session)) => self.serve(session).await,
                Ok(None) => break,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) if e.is_fatal() => {
                    self.request_restart(&e);
                    return;
                }
                Err(e) => running = self.on_connection_lost(&e).await,
            }
        }

        self.set_state(ConnectionState::Closed, self.last_reason_code());
        info!("Broker worker stopped");
    }

    /// Returns false if cancelled while waiting
    async fn wait_start_delay(&mut self) -> bool {
        if self.start_delay.is_zero() {
            return true;
        }
        info!("Waiting {:?} before connecting", self.start_delay);
        let delay = self.start_delay;
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Connect, mark the connection open and flush what is already queued.
    /// Returns `None` if cancelled while connecting.
    pub async fn on_start(&mut self) -> Result<Option<Box<dyn BrokerSession>>, LinkError> {
        self.set_state(ConnectionState::Connecting, self.last_reason_code());
        debug!("Connecting to {}", self.connector.address());

        let connector = self.connector.clone();
        let mut session = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return Ok(None),
            result = connector.connect() => result?,
        };

        self.set_state(ConnectionState::Open, 0);
        self.backoff = self.policy.reset();
        info!(
            "Broker connection open ({} queued, credit {})",
            self.queue.len(),
            session.credit()
        );

        self.on_credit_available(session.as_mut()).await?;
        Ok(Some(session))
    }

    /// Event loop for an open session. `Ok` means cancelled and closed.
    async fn serve(&mut self, mut session: Box<dyn BrokerSession>) -> Result<(), LinkError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => {
                    if let Err(e) = session.close().await {
                        debug!("Error closing broker session: {}", e);
                    }
                    return Ok(());
                }
                _ = self.queue.notified() => LinkEvent::Credit,
                event = session.next_event() => event?,
            };

            match event {
                LinkEvent::Credit => self.on_credit_available(session.as_mut()).await?,
                LinkEvent::KeepAliveDue => session.keep_alive().await?,
            }
        }
    }

    /// Send queued messages, one per unit of credit
    pub async fn on_credit_available(
        &mut self,
        session: &mut dyn BrokerSession,
    ) -> Result<(), LinkError> {
        while session.credit() > 0 && !self.is_cancelled() {
            let Some(message) = self.queue.pop_front() else {
                break;
            };

            match session.send(&message).await {
                Ok(()) => {
                    self.metrics.messages_sent.inc();
                    debug!("Sent command for {}", message.target_id);
                }
                Err(LinkError::Encode(e)) => {
                    self.metrics.messages_dropped.inc();
                    error!("Dropping command for {}: {}", message.target_id, e);
                }
                Err(e) => {
                    self.metrics.messages_dropped.inc();
                    warn!("Command for {} lost: {}", message.target_id, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Record the failure and wait out the backoff delay.
    /// Returns false if cancelled while waiting.
    pub async fn on_connection_lost(&mut self, error: &LinkError) -> bool {
        let code = error
            .reason_code()
            .map_or(self.last_reason_code(), |code| code.0);
        self.set_state(ConnectionState::Disconnected, code);

        let (next, delay) = self.policy.next_delay(self.backoff);
        self.backoff = next;
        warn!(
            "Broker connection to {} lost: {}; reconnecting in {:?}",
            self.connector.address(),
            error,
            delay
        );

        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => false,
            _ = tokio::time::sleep(delay) => {
                self.metrics.reconnects_total.inc();
                true
            }
        }
    }

    fn request_restart(&self, error: &LinkError) {
        let code = error
            .reason_code()
            .map_or(self.last_reason_code(), |code| code.0);
        self.set_state(ConnectionState::Connecting, code);
        error!("Unrecoverable broker failure: {}; requesting restart", error);

        let request = RestartRequest {
            generation: Some(self.generation),
            reason: error.to_string(),
            reason_code: code,
            backoff: Some(self.backoff),
        };
        if self.restart_tx.send(request).is_err() {
            warn!("Restart controller is gone; worker exiting");
        }
    }
}
