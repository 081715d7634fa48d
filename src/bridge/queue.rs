//! Outbound message queue
//!
//! FIFO buffer between the HTTP handlers (producers) and the broker worker
//! (single consumer). Every access goes through the mutex; the `Notify`
//! permit is stored when no worker is waiting, so a wake-up raised before
//! the worker starts waiting is not lost.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// A command waiting to be published to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Recipient key, attached to the publish as a user property
    pub target_id: String,
    /// Command content: an opaque string or a JSON tree
    pub payload: Value,
}

impl OutboundMessage {
    pub fn new(target_id: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            target_id: target_id.into(),
            payload: payload.into(),
        }
    }

    /// Wire body: strings are sent verbatim, anything else as compact JSON
    pub fn body(&self) -> Bytes {
        match &self.payload {
            Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
            other => Bytes::from(other.to_string()),
        }
    }

    /// Whether the body is serialized JSON rather than an opaque string
    pub fn is_json(&self) -> bool {
        !self.payload.is_string()
    }
}

/// Error returned when a message cannot be queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue holds its configured maximum number of messages
    QueueFull { capacity: usize },
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::QueueFull { capacity } => {
                write!(f, "outbound queue full ({} messages)", capacity)
            }
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Ordered, optionally bounded buffer of pending messages
pub struct OutboundQueue {
    items: Mutex<VecDeque<OutboundMessage>>,
    /// Maximum number of queued messages (0 = unbounded)
    capacity: usize,
    wake: Notify,
}

impl OutboundQueue {
    /// Create a queue; a capacity of 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            wake: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Add a message to the tail and wake the consumer
    pub fn append(&self, message: OutboundMessage) -> Result<(), EnqueueError> {
        {
            let mut items = self.items.lock();
            if self.capacity > 0 && items.len() >= self.capacity {
                return Err(EnqueueError::QueueFull {
                    capacity: self.capacity,
                });
            }
            items.push_back(message);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Remove and return the head of the queue
    pub fn pop_front(&self) -> Option<OutboundMessage> {
        self.items.lock().pop_front()
    }

    /// Move every message of `other` in front of this queue's messages,
    /// keeping their relative order. Capacity is not enforced here:
    /// messages already accepted are never dropped.
    pub fn absorb(&self, other: &OutboundQueue) {
        let carried = std::mem::take(&mut *other.items.lock());
        if carried.is_empty() {
            return;
        }
        {
            let mut items = self.items.lock();
            let newer = std::mem::replace(&mut *items, carried);
            items.extend(newer);
        }
        self.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Wait until a producer signals new work
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// Raise the wake signal without adding a message
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::unbounded();
        for i in 0..5 {
            queue
                .append(OutboundMessage::new(format!("car-{}", i), "GO"))
                .unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| m.target_id)
            .collect();
        assert_eq!(order, vec!["car-0", "car-1", "car-2", "car-3", "car-4"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_rejects_newest() {
        let queue = OutboundQueue::new(2);
        queue.append(OutboundMessage::new("a", "1")).unwrap();
        queue.append(OutboundMessage::new("b", "2")).unwrap();
        assert_eq!(
            queue.append(OutboundMessage::new("c", "3")),
            Err(EnqueueError::QueueFull { capacity: 2 })
        );
        assert_eq!(queue.pop_front().unwrap().target_id, "a");
        assert!(queue.append(OutboundMessage::new("c", "3")).is_ok());
    }

    #[test]
    fn test_absorb_puts_carried_messages_first() {
        let old = OutboundQueue::unbounded();
        old.append(OutboundMessage::new("old-1", "x")).unwrap();
        old.append(OutboundMessage::new("old-2", "x")).unwrap();

        let new = OutboundQueue::unbounded();
        new.append(OutboundMessage::new("new-1", "x")).unwrap();
        new.absorb(&old);

        assert!(old.is_empty());
        let order: Vec<_> = std::iter::from_fn(|| new.pop_front())
            .map(|m| m.target_id)
            .collect();
        assert_eq!(order, vec!["old-1", "old-2", "new-1"]);
    }

    #[test]
    fn test_append_stores_wake_permit() {
        let queue = OutboundQueue::unbounded();
        queue.append(OutboundMessage::new("car-1", "STOP")).unwrap();

        // The permit raised before anyone waited completes the next wait
        let mut waiter = task::spawn(queue.notified());
        assert_ready!(waiter.poll());

        let mut waiter = task::spawn(queue.notified());
        assert_pending!(waiter.poll());
        queue.wake();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn test_body_encoding() {
        let text = OutboundMessage::new("car-1", "STOP");
        assert_eq!(text.body(), Bytes::from_static(b"STOP"));
        assert!(!text.is_json());

        let tree = OutboundMessage::new("car-1", json!({"speed": 30}));
        assert_eq!(tree.body(), Bytes::from_static(br#"{"speed":30}"#));
        assert!(tree.is_json());
    }
}
