//! Per-entity options: debounce, throttle, publish policy and filters.
//!
//! Options come as a JSON document with `defaults` applied to every entity and
//! an `entities` map keyed by entity id that overrides them field by field.
//! Resolved settings are cached per entity until the options change.

use crate::error::{BridgeError, Result};
use crate::state::filter::KeyFilter;
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Suffix of the per-measurement precision options (`temperature_precision`).
const PRECISION_SUFFIX: &str = "_precision";

/// How `last_seen` is appended to outbound payloads.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum LastSeenMode {
    #[default]
    #[serde(rename = "disable")]
    #[strum(serialize = "disable")]
    Disable,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "epoch")]
    #[strum(serialize = "epoch")]
    Epoch,
    /// UTC timestamp, e.g. `2024-05-01T10:00:00.000Z`
    #[serde(rename = "ISO_8601")]
    #[strum(serialize = "ISO_8601")]
    Iso8601,
    /// Local timestamp with offset, e.g. `2024-05-01T12:00:00.000+02:00`
    #[serde(rename = "ISO_8601_local")]
    #[strum(serialize = "ISO_8601_local")]
    Iso8601Local,
}

/// Options as written by the user; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    /// Coalescing window in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce: Option<f64>,
    /// Properties whose changing value forces an early flush
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ignore: Option<Vec<String>>,
    /// Throttle window in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_optimistic: Option<Vec<String>>,
    /// Properties never published (still cached)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_attributes: Option<Vec<String>>,
    /// Properties never cached (still published once)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_cache: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<LastSeenMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<bool>,
    /// Remaining keys, among them `<measurement>_precision`
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl EntityOptions {
    /// Overlay `self` on top of `base`.
    fn over(&self, base: &EntityOptions) -> EntityOptions {
        let mut extra = base.extra.clone();
        extra.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        EntityOptions {
            friendly_name: self.friendly_name.clone().or_else(|| base.friendly_name.clone()),
            debounce: self.debounce.or(base.debounce),
            debounce_ignore: self
                .debounce_ignore
                .clone()
                .or_else(|| base.debounce_ignore.clone()),
            throttle: self.throttle.or(base.throttle),
            optimistic: self.optimistic.or(base.optimistic),
            filtered_optimistic: self
                .filtered_optimistic
                .clone()
                .or_else(|| base.filtered_optimistic.clone()),
            filtered_attributes: self
                .filtered_attributes
                .clone()
                .or_else(|| base.filtered_attributes.clone()),
            filtered_cache: self
                .filtered_cache
                .clone()
                .or_else(|| base.filtered_cache.clone()),
            retain: self.retain.or(base.retain),
            qos: self.qos.or(base.qos),
            last_seen: self.last_seen.or(base.last_seen),
            elapsed: self.elapsed.or(base.elapsed),
            extra,
        }
    }
}

/// Resolved, ready-to-use settings for one entity.
#[derive(Debug, Clone)]
pub struct EntitySettings {
    pub friendly_name: String,
    pub debounce: Duration,
    pub debounce_ignore: Vec<String>,
    pub throttle: Duration,
    pub optimistic: bool,
    pub filtered_optimistic: KeyFilter,
    pub filtered_attributes: KeyFilter,
    pub filtered_cache: KeyFilter,
    pub retain: bool,
    pub qos: u8,
    pub last_seen: LastSeenMode,
    pub elapsed: bool,
    pub precision: BTreeMap<String, u32>,
}

impl EntitySettings {
    fn resolve(entity: &str, options: &EntityOptions) -> Self {
        let precision = options
            .extra
            .iter()
            .filter_map(|(key, value)| {
                let measurement = key.strip_suffix(PRECISION_SUFFIX)?;
                match value.as_u64() {
                    Some(digits) => Some((measurement.to_string(), digits.min(15) as u32)),
                    None => {
                        warn!("[Options] {}: {} must be a non-negative integer", entity, key);
                        None
                    }
                }
            })
            .collect();

        let qos = match options.qos.unwrap_or(0) {
            q @ 0..=2 => q,
            other => {
                warn!("[Options] {}: invalid qos {}, using 0", entity, other);
                0
            }
        };

        Self {
            friendly_name: options
                .friendly_name
                .clone()
                .unwrap_or_else(|| entity.to_string()),
            debounce: seconds(entity, "debounce", options.debounce),
            debounce_ignore: options.debounce_ignore.clone().unwrap_or_default(),
            throttle: seconds(entity, "throttle", options.throttle),
            optimistic: options.optimistic.unwrap_or(true),
            filtered_optimistic: KeyFilter::lossy(options.filtered_optimistic.iter().flatten()),
            filtered_attributes: KeyFilter::lossy(options.filtered_attributes.iter().flatten()),
            filtered_cache: KeyFilter::lossy(options.filtered_cache.iter().flatten()),
            retain: options.retain.unwrap_or(false),
            qos,
            last_seen: options.last_seen.unwrap_or_default(),
            elapsed: options.elapsed.unwrap_or(false),
            precision,
        }
    }

    /// Decimal places configured for a measurement key.
    pub fn precision_for(&self, key: &str) -> Option<u32> {
        self.precision.get(key).copied()
    }
}

fn seconds(entity: &str, name: &str, value: Option<f64>) -> Duration {
    let Some(secs) = value else {
        return Duration::ZERO;
    };
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        warn!("[Options] {}: invalid {} {}, disabling", entity, name, secs);
        Duration::ZERO
    })
}

/// The options file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsDocument {
    pub defaults: EntityOptions,
    pub entities: BTreeMap<String, EntityOptions>,
}

/// Shared per-entity settings provider.
#[derive(Default)]
pub struct DeviceOptions {
    document: RwLock<OptionsDocument>,
    resolved: RwLock<HashMap<String, Arc<EntitySettings>>>,
}

impl DeviceOptions {
    pub fn new(document: OptionsDocument) -> Self {
        Self {
            document: RwLock::new(document),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Load the options document from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let document: OptionsDocument = serde_json::from_slice(&bytes)
            .map_err(|e| BridgeError::InvalidOptions(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(document))
    }

    /// Resolved settings for an entity.
    pub fn get(&self, entity: &str) -> Arc<EntitySettings> {
        if let Some(settings) = self.resolved.read().get(entity) {
            return settings.clone();
        }

        let settings = {
            let document = self.document.read();
            let options = match document.entities.get(entity) {
                Some(own) => own.over(&document.defaults),
                None => document.defaults.clone(),
            };
            Arc::new(EntitySettings::resolve(entity, &options))
        };
        self.resolved
            .write()
            .insert(entity.to_string(), settings.clone());
        settings
    }

    /// Replace the options of one entity.
    pub fn set_entity(&self, entity: &str, options: EntityOptions) {
        self.document
            .write()
            .entities
            .insert(entity.to_string(), options);
        self.resolved.write().remove(entity);
    }

    /// Map a topic segment (friendly name or id) back to an entity id.
    pub fn resolve_entity(&self, name: &str) -> String {
        let document = self.document.read();
        document
            .entities
            .iter()
            .find(|(_, options)| options.friendly_name.as_deref() == Some(name))
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| name.to_string())
    }
}
