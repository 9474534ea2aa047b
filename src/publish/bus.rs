//! Message bus abstraction

use crate::error::BusError;
use crate::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One message as published to, or received from, the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl BusMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Publishing side of a publish/subscribe bus
pub trait MessageBus: Send + Sync {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), BusError>>;
}

/// Bus that keeps every published message in memory
///
/// Lets tests inspect exactly what would have gone out.
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<BusMessage>>,
    failing: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Payload of the most recent message on a topic, parsed as JSON
    pub fn last_json(&self, topic: &str) -> Option<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .and_then(|m| serde_json::from_slice(&m.payload).ok())
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl MessageBus for MemoryBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "bus unavailable".to_string(),
                });
            }
            self.published.lock().push(BusMessage {
                topic: topic.to_string(),
                payload,
                retain,
            });
            Ok(())
        })
    }
}

/// Bus whose publishes never complete, like a client stuck on a dead broker
#[derive(Default)]
pub struct StalledBus {
    attempts: AtomicUsize,
}

impl StalledBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of publishes started so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MessageBus for StalledBus {
    fn publish<'a>(
        &'a self,
        _topic: &'a str,
        _payload: Vec<u8>,
        _retain: bool,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::pending())
    }
}
