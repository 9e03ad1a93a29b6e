//! MQTT client wrapper and the MQTT-backed transport.

use super::{Transport, WireMessage};
use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// Payload of the availability topic while the bridge is down.
pub const OFFLINE: &str = "offline";

/// Message received from MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// What the event loop reports to the bridge.
#[derive(Debug, Clone)]
pub enum MqttEvent {
    /// A (re)connection was acknowledged; subscriptions must be renewed.
    Connected,
    Message(MqttMessage),
}

pub fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// MQTT client for the bridge.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client whose last will marks `availability_topic` offline.
    pub fn new(config: &MqttConfig, availability_topic: &str) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            availability_topic,
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self { client, event_loop }
    }

    /// Run the MQTT event loop and forward events to the provided channel.
    ///
    /// Runs until the receiving side is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<MqttEvent>) {
        info!("[MQTT] Starting event loop");

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Connected");
                    if tx.send(MqttEvent::Connected).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("[MQTT] Invalid UTF-8 in payload on {}: {}", topic, e);
                            continue;
                        }
                    };

                    debug!("[MQTT] Received on {}: {}", topic, payload);

                    let msg = MqttMessage { topic, payload };
                    if tx.send(MqttEvent::Message(msg)).await.is_err() {
                        error!("[MQTT] Message channel closed");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    // Wait before reconnecting
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Get a clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

/// [`Transport`] publishing through a rumqttc client.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, message: &WireMessage) -> Result<()> {
        debug!("[MQTT] Publishing to {}: {}", message.topic, message.payload);
        self.client
            .publish(
                message.topic.as_str(),
                qos_from(message.qos),
                message.retain,
                message.payload.as_bytes(),
            )
            .await
            .map_err(|e| BridgeError::TransportFailed {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })
    }
}
