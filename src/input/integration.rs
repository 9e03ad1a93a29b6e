//! MQTT integration: subscribes to the bridge topics and routes messages
//! into the orchestrator.
//!
//! Keeps MQTT internals out of main.rs. Every (re)connection renews the
//! subscriptions, marks the bridge online and republishes cached state.

use super::devices::{KnownDevices, parse_device_list};
use super::topics::{Route, Topics};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::options::DeviceOptions;
use crate::pipeline::{Orchestrator, Origin};
use crate::transport::{MqttEvent, MqttMessage};
use log::{debug, info, warn};
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Payload of the availability topic while the bridge runs.
pub const ONLINE: &str = "online";

/// Target of a device removal request: a plain id or `{"id": ...}`.
fn removal_target(payload: &str) -> Option<String> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        Ok(Value::String(id)) => Some(id),
        _ => {
            let id = payload.trim();
            (!id.is_empty()).then(|| id.to_string())
        }
    }
}

pub struct MqttIntegration {
    bridge: Arc<Orchestrator>,
    options: Arc<DeviceOptions>,
    devices: Arc<KnownDevices>,
    topics: Topics,
}

impl MqttIntegration {
    pub fn new(
        config: &BridgeConfig,
        bridge: Arc<Orchestrator>,
        options: Arc<DeviceOptions>,
        devices: Arc<KnownDevices>,
    ) -> Self {
        Self {
            bridge,
            options,
            devices,
            topics: Topics::new(config),
        }
    }

    /// Spawn the routing task. It ends when `cancel` fires or the event
    /// channel closes.
    pub fn start(
        self,
        client: AsyncClient,
        events: mpsc::Receiver<MqttEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(client, events, cancel).await;
        })
    }

    async fn run(
        self,
        client: AsyncClient,
        mut events: mpsc::Receiver<MqttEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(MqttEvent::Connected) => self.on_connected(&client).await,
                    Some(MqttEvent::Message(message)) => self.handle(&message),
                    None => {
                        warn!("[MQTT] Event channel closed");
                        break;
                    }
                },
            }
        }
        debug!("[MQTT] Integration stopped");
    }

    async fn on_connected(&self, client: &AsyncClient) {
        for topic in self.topics.subscriptions() {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!("[MQTT] Failed to subscribe to {}: {:?}", topic, e);
            }
        }

        let sink = self.bridge.sink();
        sink.publish_raw(self.topics.availability(), ONLINE, 1, true);

        let cached: Vec<String> = self.bridge.state().snapshot().into_keys().collect();
        for entity in &cached {
            self.bridge.publish_now(entity);
        }
        info!(
            "[MQTT] Subscribed, bridge online, republished {} cached entities",
            cached.len()
        );
    }

    /// Route one inbound message.
    pub fn handle(&self, message: &MqttMessage) {
        let Some(route) = self.topics.parse(&message.topic) else {
            debug!("[MQTT] Unrouted topic {}", message.topic);
            return;
        };

        match route {
            Route::Report(entity) => self.ingest(&entity, &message.payload, Origin::Device),
            Route::Echo(entity) => self.ingest(&entity, &message.payload, Origin::CommandEcho),
            Route::Set(name) => {
                let entity = self.options.resolve_entity(&name);
                self.ingest(&entity, &message.payload, Origin::Optimistic);
            }
            Route::Get(name) => {
                let entity = self.options.resolve_entity(&name);
                self.bridge.publish_now(&entity);
            }
            Route::Left(entity) => self.device_left(&entity),
            Route::Remove => match removal_target(&message.payload) {
                Some(name) => {
                    let entity = self.options.resolve_entity(&name);
                    self.device_left(&entity);
                }
                None => warn!("[MQTT] Removal request without device id"),
            },
            Route::DeviceList => match parse_device_list(&message.payload) {
                Ok(ids) => self.devices.replace(ids),
                Err(e) => warn!("[MQTT] Invalid device list: {}", e),
            },
        }
    }

    fn ingest(&self, entity: &str, payload: &str, origin: Origin) {
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => self.bridge.ingest(entity, &value, origin),
            Err(e) => warn!(
                "[MQTT] Dropped {} payload for {}: {}",
                origin,
                entity,
                BridgeError::from(e)
            ),
        }
    }

    fn device_left(&self, entity: &str) {
        self.devices.forget(entity);
        self.bridge.device_left(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::options::EntityOptions;
    use crate::publish::{ConfiguredPrecision, PublishSink};
    use crate::state::{DeviceRegistry, StateCache};
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        integration: MqttIntegration,
        transport: Arc<MemoryTransport>,
        devices: Arc<KnownDevices>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.data_dir = dir.path().to_path_buf();
        config.cache.persistent = false;

        let options = Arc::new(DeviceOptions::default());
        options.set_entity(
            "0x0017880103e0a1b2",
            EntityOptions {
                friendly_name: Some("lamp".to_string()),
                ..Default::default()
            },
        );
        let state = Arc::new(StateCache::new(&config.cache, options.clone()));
        let (sink, queue) = PublishSink::new(
            "zigbee2mqtt",
            options.clone(),
            Arc::new(ConfiguredPrecision),
        );
        let transport = Arc::new(MemoryTransport::new());
        queue.spawn(transport.clone());
        let bridge = Arc::new(Orchestrator::new(
            &config.bridge,
            options.clone(),
            state,
            Arc::new(sink),
        ));
        let devices = Arc::new(KnownDevices::new());

        Fixture {
            integration: MqttIntegration::new(&config.bridge, bridge, options, devices.clone()),
            transport,
            devices,
            _dir: dir,
        }
    }

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    async fn settle(f: &Fixture) {
        assert!(
            f.integration
                .bridge
                .sink()
                .flush(Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test]
    async fn test_report_and_get_use_friendly_name() {
        let f = fixture();

        f.integration.handle(&message(
            "zigbee2mqtt-converted/0x0017880103e0a1b2",
            r#"{"state": "ON"}"#,
        ));
        f.integration
            .handle(&message("zigbee2mqtt/lamp/get", r#"{"state": ""}"#));
        settle(&f).await;

        assert_eq!(
            f.transport.payloads("zigbee2mqtt/lamp"),
            vec![json!({"state": "ON"}), json!({"state": "ON"})]
        );
    }

    #[tokio::test]
    async fn test_set_is_optimistic() {
        let f = fixture();

        f.integration
            .handle(&message("zigbee2mqtt/lamp/set", r#"{"brightness": 120}"#));
        settle(&f).await;

        assert_eq!(
            f.transport.payloads("zigbee2mqtt/lamp"),
            vec![json!({"brightness": 120})]
        );
        assert_eq!(
            f.integration.bridge.state().get("0x0017880103e0a1b2")["brightness"],
            json!(120)
        );
    }

    #[tokio::test]
    async fn test_invalid_json_dropped() {
        let f = fixture();
        f.integration
            .handle(&message("zigbee2mqtt-converted/lamp", "{broken"));
        settle(&f).await;
        assert!(f.transport.messages().is_empty());
    }

    #[tokio::test]
    async fn test_device_list_and_removal() {
        let f = fixture();
        let bridge = &f.integration.bridge;
        bridge
            .state()
            .set("0x0017880103e0a1b2", json!({"state": "ON"}).as_object().unwrap(), None);

        f.integration.handle(&message(
            "zigbee2mqtt-converted/bridge/devices",
            r#"[{"ieee_address": "0x0017880103e0a1b2"}]"#,
        ));
        assert!(f.devices.is_live("0x0017880103e0a1b2"));

        f.integration.handle(&message(
            "zigbee2mqtt/bridge/request/device/remove",
            r#"{"id": "lamp"}"#,
        ));
        assert!(!bridge.state().contains("0x0017880103e0a1b2"));
        assert!(!f.devices.is_live("0x0017880103e0a1b2"));
    }

    #[test]
    fn test_removal_target_forms() {
        assert_eq!(removal_target(r#"{"id": "lamp"}"#), Some("lamp".to_string()));
        assert_eq!(removal_target(r#""lamp""#), Some("lamp".to_string()));
        assert_eq!(removal_target("lamp"), Some("lamp".to_string()));
        assert_eq!(removal_target("  "), None);
        assert_eq!(removal_target(r#"{"force": true}"#), None);
    }
}
