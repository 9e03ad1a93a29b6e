//! Topic layout of the bridge and routing of inbound topics.

use crate::config::BridgeConfig;

/// Topic level reserved for bridge-wide messages.
const BRIDGE_LEVEL: &str = "bridge";

/// What an inbound topic asks the bridge to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `<ingest>/<entity>`: converted device report
    Report(String),
    /// `<ingest>/<entity>/echo`: explicit command echo
    Echo(String),
    /// `<ingest>/<entity>/left`: device left the network
    Left(String),
    /// `<ingest>/bridge/devices`: current device list
    DeviceList,
    /// `<base>/<name>/get`: publish the freshest state now
    Get(String),
    /// `<base>/<name>/set`: command, cached as its optimistic result
    Set(String),
    /// `<base>/bridge/request/device/remove`
    Remove,
}

#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
    ingest: String,
}

impl Topics {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            base: config.base_topic.trim_end_matches('/').to_string(),
            ingest: config.ingest_topic.trim_end_matches('/').to_string(),
        }
    }

    /// Retained `online`/`offline` topic.
    pub fn availability(&self) -> String {
        format!("{}/{}/state", self.base, BRIDGE_LEVEL)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/+", self.ingest),
            format!("{}/+/echo", self.ingest),
            format!("{}/+/left", self.ingest),
            format!("{}/{}/devices", self.ingest, BRIDGE_LEVEL),
            format!("{}/+/get", self.base),
            format!("{}/+/set", self.base),
            format!("{}/{}/request/device/remove", self.base, BRIDGE_LEVEL),
        ]
    }

    pub fn parse(&self, topic: &str) -> Option<Route> {
        if let Some(rest) = strip_level(topic, &self.ingest) {
            return match rest.split('/').collect::<Vec<_>>().as_slice() {
                [BRIDGE_LEVEL, "devices"] => Some(Route::DeviceList),
                [BRIDGE_LEVEL, ..] => None,
                [entity] if !entity.is_empty() => Some(Route::Report(entity.to_string())),
                [entity, "echo"] if !entity.is_empty() => Some(Route::Echo(entity.to_string())),
                [entity, "left"] if !entity.is_empty() => Some(Route::Left(entity.to_string())),
                _ => None,
            };
        }

        let rest = strip_level(topic, &self.base)?;
        match rest.split('/').collect::<Vec<_>>().as_slice() {
            [BRIDGE_LEVEL, "request", "device", "remove"] => Some(Route::Remove),
            [BRIDGE_LEVEL, ..] => None,
            [name, "get"] if !name.is_empty() => Some(Route::Get(name.to_string())),
            [name, "set"] if !name.is_empty() => Some(Route::Set(name.to_string())),
            _ => None,
        }
    }
}

/// Remainder of `topic` below `prefix`, if it lies below it.
fn strip_level<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    topic.strip_prefix(prefix)?.strip_prefix('/')
}
