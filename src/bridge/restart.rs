//! Restart Controller
//!
//! Tears down every broker worker and builds a fresh supervisor when a
//! worker reports an unrecoverable failure or a restart is requested from
//! outside. Queued messages survive the swap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backoff::BackoffPolicy;
use super::facade::Bridge;
use super::link::BrokerConnector;
use super::queue::OutboundQueue;
use super::supervisor::{cancelled, ConnectionSupervisor, RestartRequest};
use crate::metrics::Metrics;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// A worker of the given generation is running
    Running(u64),
    /// Workers are being torn down or replaced
    Restarting,
}

/// Cloneable handle for requesting a restart and watching the controller
#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<RestartRequest>,
    state: watch::Receiver<ControllerState>,
}

impl RestartHandle {
    /// Returns false if the controller has stopped
    pub fn request_restart(&self, reason: impl Into<String>) -> bool {
        self.tx.send(RestartRequest::external(reason)).is_ok()
    }

    /// Last state published by the controller
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }
}

struct Worker {
    name: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct RestartController {
    bridge: Arc<Bridge>,
    connector: Arc<dyn BrokerConnector>,
    policy: BackoffPolicy,
    shutdown_grace: Duration,
    metrics: Arc<Metrics>,
    workers: Vec<Worker>,
    generation: u64,
    state: watch::Sender<ControllerState>,
    requests_tx: mpsc::UnboundedSender<RestartRequest>,
    requests_rx: mpsc::UnboundedReceiver<RestartRequest>,
}

impl RestartController {
    pub fn new(
        bridge: Arc<Bridge>,
        connector: Arc<dyn BrokerConnector>,
        policy: BackoffPolicy,
        shutdown_grace: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ControllerState::Restarting);
        Self {
            bridge,
            connector,
            policy,
            shutdown_grace,
            metrics,
            workers: Vec::new(),
            generation: 0,
            state,
            requests_tx,
            requests_rx,
        }
    }

    pub fn handle(&self) -> RestartHandle {
        RestartHandle {
            tx: self.requests_tx.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Replace all workers with a new supervisor
    pub async fn restart(&mut self, reason: &str) {
        self.replace_workers(&RestartRequest::external(reason)).await;
    }

    async fn replace_workers(&mut self, request: &RestartRequest) {
        info!("Restarting broker pipeline: {}", request.reason);
        self.teardown().await;

        self.generation += 1;
        let generation = self.generation;
        let queue = Arc::new(OutboundQueue::new(self.bridge.queue_capacity()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut supervisor = ConnectionSupervisor::new(
            generation,
            self.connector.clone(),
            queue,
            self.policy,
            self.requests_tx.clone(),
            cancel_rx,
            self.metrics.clone(),
        );
        if let Some(backoff) = request.backoff {
            let (next, delay) = self.policy.next_delay(backoff);
            supervisor = supervisor.resume_backoff(next, delay, request.reason_code);
        }
        let handle = supervisor.handle();

        let name = format!("broker-worker-{}", generation);
        let task = tokio::spawn(
            supervisor
                .run()
                .instrument(info_span!("broker_worker", generation)),
        );
        debug!("Spawned {}", name);
        self.workers.push(Worker {
            name,
            cancel: cancel_tx,
            task,
        });

        self.bridge.install(handle);
        if generation > 1 {
            self.metrics.restarts_total.inc();
        }
        self.state.send_replace(ControllerState::Running(generation));
    }

    /// Cancel every worker and wait for each to exit
    pub async fn teardown(&mut self) {
        self.state.send_replace(ControllerState::Restarting);
        let workers = std::mem::take(&mut self.workers);

        for worker in &workers {
            let _ = worker.cancel.send(true);
        }

        for mut worker in workers {
            match timeout(self.shutdown_grace, &mut worker.task).await {
                Ok(Ok(())) => debug!("{} exited", worker.name),
                Ok(Err(e)) => warn!("{} ended abnormally: {}", worker.name, e),
                Err(_) => {
                    warn!(
                        "{} did not exit within {:?}; aborting",
                        worker.name, self.shutdown_grace
                    );
                    worker.task.abort();
                    let _ = worker.task.await;
                }
            }
        }
    }

    async fn on_request(&mut self, request: RestartRequest) {
        if let Some(generation) = request.generation {
            if generation != self.generation {
                debug!(
                    "Ignoring restart request from stale worker {} (current {})",
                    generation, self.generation
                );
                return;
            }
        }

        // Requests queued behind this one are satisfied by the same restart
        let mut coalesced = 0;
        while self.requests_rx.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!("Coalesced {} pending restart requests", coalesced);
        }

        self.replace_workers(&request).await;
    }

    /// Start the first worker, then serve restart requests until `shutdown`
    /// fires; all workers are torn down before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.restart("initial start").await;

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                request = self.requests_rx.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
            }
        }

        info!("Stopping broker workers");
        self.teardown().await;
    }
}
