//! Outbound transport collaborator.
//!
//! The pipeline only ever hands fully rendered [`WireMessage`]s to a
//! [`Transport`]; retry and reconnect are the transport's business.

mod memory;
mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::{MqttClient, MqttEvent, MqttMessage, MqttTransport, OFFLINE, qos_from};

use crate::error::Result;
use async_trait::async_trait;

/// A rendered message ready for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub topic: String,
    pub payload: String,
    /// 0, 1 or 2
    pub qos: u8,
    pub retain: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: &WireMessage) -> Result<()>;
}
