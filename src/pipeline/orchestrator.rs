//! Routes incoming patches through the pipeline stages by origin.
//!
//! Device reports take the full path: coalescing buffer, cache commit,
//! throttle, sink. Optimistic command results skip the buffer (after flushing
//! it, so they never overtake older reports). Command echoes also skip the
//! throttle.

use super::debounce::Debouncer;
use super::outbound;
use super::throttle::ThrottleGate;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::options::DeviceOptions;
use crate::publish::PublishSink;
use crate::state::merge;
use crate::state::{DeviceRegistry, Properties, StateCache};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const REASON_OPTIMISTIC: &str = "optimistic";
const REASON_COMMAND: &str = "command";

/// Where a patch comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Origin {
    /// Report converted from a device message
    Device,
    /// Predicted result of a command sent to the device
    Optimistic,
    /// Explicit echo of a command
    CommandEcho,
}

/// Why a property name cannot be accepted, if it can't.
fn invalid_key(key: &str) -> Option<&'static str> {
    if key.is_empty() {
        Some("empty name")
    } else if key.contains(['+', '#']) {
        Some("MQTT wildcard in name")
    } else if key.chars().any(char::is_control) {
        Some("control character in name")
    } else {
        None
    }
}

pub struct Orchestrator {
    options: Arc<DeviceOptions>,
    state: Arc<StateCache>,
    sink: Arc<PublishSink>,
    throttle: Arc<ThrottleGate>,
    debouncer: Debouncer,
    cache_state: bool,
}

impl Orchestrator {
    pub fn new(
        config: &BridgeConfig,
        options: Arc<DeviceOptions>,
        state: Arc<StateCache>,
        sink: Arc<PublishSink>,
    ) -> Self {
        let throttle = Arc::new(ThrottleGate::new(
            options.clone(),
            sink.clone(),
            config.cache_state,
        ));
        let debouncer = Debouncer::new(
            state.clone(),
            options.clone(),
            throttle.clone(),
            config.cache_state,
        );

        Self {
            options,
            state,
            sink,
            throttle,
            debouncer,
            cache_state: config.cache_state,
        }
    }

    pub fn state(&self) -> &Arc<StateCache> {
        &self.state
    }

    pub fn sink(&self) -> &Arc<PublishSink> {
        &self.sink
    }

    /// Validate a raw payload into a patch, dropping offending keys.
    fn sanitize(entity: &str, raw: &Value) -> Option<Properties> {
        let Value::Object(map) = raw else {
            warn!("[Bridge] {}", BridgeError::NotAnObject(entity.to_string()));
            return None;
        };

        let mut patch = Properties::new();
        for (key, value) in map {
            match invalid_key(key) {
                None => {
                    patch.insert(key.clone(), value.clone());
                }
                Some(reason) => warn!(
                    "[Bridge] {}",
                    BridgeError::InvalidPatch {
                        entity: entity.to_string(),
                        key: key.escape_debug().to_string(),
                        reason: reason.to_string(),
                    }
                ),
            }
        }

        if patch.is_empty() {
            debug!("[Bridge] Empty patch for {} ignored", entity);
            return None;
        }
        Some(patch)
    }

    /// Feed a patch for `entity` into the pipeline.
    pub fn ingest(&self, entity: &str, raw: &Value, origin: Origin) {
        let Some(patch) = Self::sanitize(entity, raw) else {
            return;
        };

        match origin {
            Origin::Device => {
                self.sink.record_inbound(entity);
                self.debouncer.update(entity, patch);
            }
            Origin::Optimistic => {
                self.debouncer.flush_now(entity);
                let merged = self.state.set(entity, &patch, Some(REASON_OPTIMISTIC));

                let settings = self.options.get(entity);
                if !settings.optimistic {
                    debug!("[Bridge] {} is not optimistic, result cached only", entity);
                    return;
                }
                let mut message = outbound(self.cache_state, merged, &patch);
                settings.filtered_optimistic.strip(&mut message);
                self.throttle.publish(entity, message);
            }
            Origin::CommandEcho => {
                self.debouncer.flush_now(entity);
                let merged = self.state.set(entity, &patch, Some(REASON_COMMAND));
                let message = match self.throttle.supersede(entity) {
                    // A held patch would otherwise never be published
                    Some(mut held) if !self.cache_state => {
                        merge::merge_patch(&mut held, &patch);
                        held
                    }
                    _ => outbound(self.cache_state, merged, &patch),
                };
                self.sink.publish(entity, &message);
            }
        }
    }

    /// Cached state with any pending buffer applied, without side effects.
    pub fn effective_state(&self, entity: &str) -> Properties {
        self.debouncer.effective_state(entity)
    }

    /// Publish the freshest state of an entity right away and return it.
    pub fn publish_now(&self, entity: &str) -> Properties {
        let fresh = self.debouncer.take_fresh(entity);
        self.throttle.supersede(entity);

        if fresh.is_empty() {
            debug!("[Bridge] Nothing known about {}, not publishing", entity);
        } else {
            self.sink.publish(entity, &fresh);
        }
        fresh
    }

    /// Forget a device that left the network.
    pub fn device_left(&self, entity: &str) {
        self.debouncer.cancel(entity);
        self.throttle.cancel(entity);
        self.sink.forget(entity);
        if self.state.remove(entity) {
            info!("[Bridge] {} left, cached state removed", entity);
        }
    }

    /// Flush everything pending, wait for delivery, then persist the cache.
    pub async fn shutdown(&self, registry: &dyn DeviceRegistry, drain_timeout: Duration) {
        let flushed = self.debouncer.flush_all();
        let trailing = self.throttle.drain();
        info!(
            "[Bridge] Shutdown: flushed {} buffers, {} trailing messages",
            flushed, trailing
        );

        if !self.sink.flush(drain_timeout).await {
            warn!("[Bridge] Some messages may not have reached the broker");
        }
        self.state.shutdown(registry);
    }
}
