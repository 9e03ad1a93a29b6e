//! Render merged state into wire messages and deliver them in order.
//!
//! `publish` never waits for the broker: rendered messages go into an
//! unbounded queue drained by a single delivery task, so ingestion is never
//! blocked by I/O and per-topic order is preserved.

use super::render::{PrecisionPolicy, apply_precision, last_seen_value};
use crate::options::DeviceOptions;
use crate::state::Properties;
use crate::transport::{Transport, WireMessage};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Delivery {
    Message(WireMessage),
    /// Acknowledged once everything queued before it was handed to the transport
    Barrier(oneshot::Sender<()>),
}

/// Receiving end of the sink's queue; spawn it onto a transport.
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryQueue {
    /// Start delivering queued messages. The task ends when the sink is dropped.
    pub fn spawn(mut self, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = self.rx.recv().await {
                match delivery {
                    Delivery::Message(message) => {
                        if let Err(e) = transport.publish(&message).await {
                            warn!("[Publish] Dropped message for {}: {}", message.topic, e);
                        }
                    }
                    Delivery::Barrier(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("[Publish] Delivery queue closed");
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Inbound {
    at: Instant,
    wall: DateTime<Utc>,
    previous: Option<Instant>,
}

/// Last inbound event per entity, for `elapsed` and `last_seen`.
#[derive(Default)]
struct InboundClock {
    entries: Mutex<HashMap<String, Inbound>>,
}

impl InboundClock {
    fn record(&self, entity: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let previous = entries.get(entity).map(|e| e.at);
        entries.insert(
            entity.to_string(),
            Inbound {
                at: now,
                wall: Utc::now(),
                previous,
            },
        );
    }

    fn get(&self, entity: &str) -> Option<Inbound> {
        self.entries.lock().get(entity).copied()
    }

    fn forget(&self, entity: &str) {
        self.entries.lock().remove(entity);
    }
}

pub struct PublishSink {
    base_topic: String,
    options: Arc<DeviceOptions>,
    precision: Arc<dyn PrecisionPolicy>,
    clock: InboundClock,
    queue: mpsc::UnboundedSender<Delivery>,
    published: AtomicU64,
}

impl PublishSink {
    pub fn new(
        base_topic: impl Into<String>,
        options: Arc<DeviceOptions>,
        precision: Arc<dyn PrecisionPolicy>,
    ) -> (Self, DeliveryQueue) {
        let (queue, rx) = mpsc::unbounded_channel();
        let sink = Self {
            base_topic: base_topic.into(),
            options,
            precision,
            clock: InboundClock::default(),
            queue,
            published: AtomicU64::new(0),
        };
        (sink, DeliveryQueue { rx })
    }

    fn state_topic(&self, friendly_name: &str) -> String {
        format!("{}/{}", self.base_topic, friendly_name)
    }

    /// Note an inbound event from a device.
    pub fn record_inbound(&self, entity: &str) {
        self.clock.record(entity);
    }

    pub fn forget(&self, entity: &str) {
        self.clock.forget(entity);
    }

    /// Number of messages handed to the delivery queue.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Apply the entity's publish policy to a payload.
    pub fn render(&self, entity: &str, payload: &Properties) -> WireMessage {
        let settings = self.options.get(entity);

        let mut body = payload.clone();
        settings.filtered_attributes.strip(&mut body);
        apply_precision(&mut body, &settings, self.precision.as_ref());

        let inbound = self.clock.get(entity);
        if settings.elapsed
            && let Some(Inbound {
                at,
                previous: Some(previous),
                ..
            }) = inbound
        {
            let elapsed = at.saturating_duration_since(previous).as_millis() as u64;
            body.insert("elapsed".to_string(), Value::from(elapsed));
        }

        let seen = inbound.map(|i| i.wall).unwrap_or_else(Utc::now);
        if let Some(last_seen) = last_seen_value(settings.last_seen, seen) {
            body.insert("last_seen".to_string(), last_seen);
        }

        WireMessage {
            topic: self.state_topic(&settings.friendly_name),
            payload: Value::Object(body).to_string(),
            qos: settings.qos,
            retain: settings.retain,
        }
    }

    /// Render and queue the state message of an entity.
    pub fn publish(&self, entity: &str, payload: &Properties) {
        let message = self.render(entity, payload);
        debug!("[Publish] {} -> {}", message.topic, message.payload);
        self.enqueue(message);
    }

    /// Queue a message outside the entity state topics (e.g. availability).
    pub fn publish_raw(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
        qos: u8,
        retain: bool,
    ) {
        self.enqueue(WireMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        });
    }

    fn enqueue(&self, message: WireMessage) {
        if self.queue.send(Delivery::Message(message)).is_err() {
            warn!("[Publish] Delivery queue closed, message dropped");
            return;
        }
        self.published.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait until everything queued so far was handed to the transport.
    /// Returns false on timeout or when the delivery task is gone.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack, done) = oneshot::channel();
        if self.queue.send(Delivery::Barrier(ack)).is_err() {
            return false;
        }
        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                info!("[Publish] Delivery queue not drained after {:?}", timeout);
                false
            }
        }
    }
}
