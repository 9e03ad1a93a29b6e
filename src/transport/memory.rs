//! In-memory transport that records every published message.

use super::{Transport, WireMessage};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryTransport {
    messages: Mutex<Vec<WireMessage>>,
    failures: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Messages published so far.
    pub fn messages(&self) -> Vec<WireMessage> {
        self.messages.lock().clone()
    }

    /// Messages published to one topic, parsed as JSON.
    pub fn payloads(&self, topic: &str) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .filter_map(|m| serde_json::from_str(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: &WireMessage) -> Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::TransportFailed {
                topic: message.topic.clone(),
                reason: "injected failure".to_string(),
            });
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
