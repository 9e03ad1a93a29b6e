//! Inbound side of the bridge: topic routing, device registry and the MQTT
//! integration driving the orchestrator.

mod devices;
mod integration;
mod topics;

pub use devices::{KnownDevices, parse_device_list};
pub use integration::{MqttIntegration, ONLINE};
pub use topics::{Route, Topics};
