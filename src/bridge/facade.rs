//! Bridge facade
//!
//! The single entry point the API layer uses. Holds the current supervisor
//! handle behind a lock so the restart controller can swap it while
//! requests keep enqueueing.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::queue::{EnqueueError, OutboundMessage, OutboundQueue};
use super::supervisor::{ConnectionStatus, SupervisorHandle};
use crate::metrics::Metrics;

pub struct Bridge {
    current: RwLock<SupervisorHandle>,
    server_address: String,
    queue_capacity: usize,
    metrics: Arc<Metrics>,
}

impl Bridge {
    /// Create a facade with an empty standby queue and no worker.
    /// `queue_capacity` of 0 means unbounded.
    pub fn new(
        server_address: impl Into<String>,
        queue_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let standby = SupervisorHandle::standby(Arc::new(OutboundQueue::new(queue_capacity)));
        Self {
            current: RwLock::new(standby),
            server_address: server_address.into(),
            queue_capacity,
            metrics,
        }
    }

    /// Queue a command for the broker; never waits on I/O
    pub fn enqueue(
        &self,
        target_id: impl Into<String>,
        payload: Value,
    ) -> Result<(), EnqueueError> {
        let message = OutboundMessage::new(target_id, payload);
        let current = self.current.read();
        match current.queue().append(message) {
            Ok(()) => {
                self.metrics.messages_enqueued.inc();
                Ok(())
            }
            Err(e) => {
                self.metrics.message_rejected("queue_full");
                warn!("Command rejected: {}", e);
                Err(e)
            }
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.current.read().query_state()
    }

    /// Configured broker endpoint
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn queue_depth(&self) -> usize {
        self.current.read().queue().len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Generation of the current worker (0 before the first one starts)
    pub fn generation(&self) -> u64 {
        self.current.read().generation()
    }

    /// Make `handle` current, carrying over whatever the previous queue
    /// still holds ahead of anything already in the new one.
    pub fn install(&self, handle: SupervisorHandle) {
        let mut current = self.current.write();
        let carried = current.queue().len();
        handle.queue().absorb(current.queue());
        debug!(
            "Installed broker worker {} ({} messages carried over)",
            handle.generation(),
            carried
        );
        *current = handle;
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("server_address", &self.server_address)
            .field("generation", &self.generation())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}
