//! The ingestion pipeline: coalescing buffer, cache commit, throttle, sink.

pub mod debounce;
pub mod orchestrator;
pub mod throttle;
mod timer;

pub use debounce::Debouncer;
pub use orchestrator::{Orchestrator, Origin};
pub use throttle::ThrottleGate;

use crate::publish::PublishSink;
use crate::state::Properties;

/// The next stage of the pipeline.
pub trait Downstream: Send + Sync {
    fn forward(&self, entity: &str, message: Properties);
}

impl Downstream for PublishSink {
    fn forward(&self, entity: &str, message: Properties) {
        self.publish(entity, &message);
    }
}

/// Payload leaving the cache commit: the full merged state, or only the patch
/// when full-state publishing is off.
pub(crate) fn outbound(cache_state: bool, merged: Properties, patch: &Properties) -> Properties {
    if cache_state { merged } else { patch.clone() }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct Recorder {
    forwarded: parking_lot::Mutex<Vec<(String, Properties)>>,
}

#[cfg(test)]
impl Recorder {
    pub fn values(&self) -> Vec<serde_json::Value> {
        self.forwarded
            .lock()
            .iter()
            .map(|(_, m)| serde_json::Value::Object(m.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.forwarded.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarded.lock().is_empty()
    }
}

#[cfg(test)]
impl Downstream for Recorder {
    fn forward(&self, entity: &str, message: Properties) {
        self.forwarded.lock().push((entity.to_string(), message));
    }
}
