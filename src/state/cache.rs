//! Last-known state per entity, persisted as one JSON snapshot.
//!
//! The cache only stores cache-eligible properties. `set` returns the
//! unfiltered merge so transient properties (button actions and the like)
//! can still be published once.

use super::filter::KeyFilter;
use super::merge::{self, Properties};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::options::DeviceOptions;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the change notification channel per subscriber.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Notification emitted by every [`StateCache::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity: String,
    /// Stored state before the update
    pub from: Properties,
    /// Unfiltered state after the update
    pub to: Properties,
    pub reason: Option<String>,
    /// The patch that was applied
    pub update: Properties,
}

/// Answers whether an entity id still belongs to a device on the network.
pub trait DeviceRegistry: Send + Sync {
    fn is_live(&self, entity: &str) -> bool;
}

/// Registry that treats every device as live, so nothing gets pruned.
pub struct KeepAll;

impl DeviceRegistry for KeepAll {
    fn is_live(&self, _entity: &str) -> bool {
        true
    }
}

/// IEEE address form `0x` followed by 16 hex digits.
pub fn is_address_like(entity: &str) -> bool {
    entity
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

pub struct StateCache {
    entries: RwLock<HashMap<String, Properties>>,
    ignore: KeyFilter,
    options: Arc<DeviceOptions>,
    path: PathBuf,
    persistent: bool,
    save_interval: Duration,
    changes: broadcast::Sender<StateChange>,
}

impl StateCache {
    pub fn new(config: &CacheConfig, options: Arc<DeviceOptions>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            ignore: KeyFilter::lossy(&config.ignore),
            options,
            path: config.state_path(),
            persistent: config.persistent,
            save_interval: config.save_interval(),
            changes,
        }
    }

    /// Load the persisted snapshot. Any failure leaves the cache empty.
    pub fn load(&self) {
        if !self.persistent {
            debug!("[Cache] Persistence disabled, starting empty");
            return;
        }

        let loaded = read_snapshot(&self.path);
        info!("[Cache] Loaded state for {} entities", loaded.len());
        *self.entries.write() = loaded;
    }

    /// Stored state of an entity (empty when unknown).
    pub fn get(&self, entity: &str) -> Properties {
        self.entries.read().get(entity).cloned().unwrap_or_default()
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entries.read().contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Merge `patch` into the stored state and return the unfiltered result.
    pub fn set(&self, entity: &str, patch: &Properties, reason: Option<&str>) -> Properties {
        let settings = self.options.get(entity);

        let (from, merged) = {
            let mut entries = self.entries.write();
            let from = entries.get(entity).cloned().unwrap_or_default();
            let merged = merge::applied(&from, patch);

            let mut stored = merged.clone();
            self.ignore.strip(&mut stored);
            settings.filtered_cache.strip(&mut stored);
            entries.insert(entity.to_string(), stored);
            (from, merged)
        };

        // No subscribers is not an error
        let _ = self.changes.send(StateChange {
            entity: entity.to_string(),
            from,
            to: merged.clone(),
            reason: reason.map(str::to_string),
            update: patch.clone(),
        });

        merged
    }

    /// Drop an entity. Returns whether it was cached.
    pub fn remove(&self, entity: &str) -> bool {
        let removed = self.entries.write().remove(entity).is_some();
        if removed {
            debug!("[Cache] Removed {}", entity);
        }
        removed
    }

    /// Receive a [`StateChange`] for every `set`.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Sorted copy of every stored entry.
    pub fn snapshot(&self) -> BTreeMap<String, Properties> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Write the snapshot to disk. Failures are logged, never retried.
    pub fn save(&self) {
        if !self.persistent {
            return;
        }
        match write_snapshot(&self.path, &self.snapshot()) {
            Ok(()) => debug!("[Cache] Saved state to {:?}", self.path),
            Err(e) => error!("[Cache] Failed to save state to {:?}: {}", self.path, e),
        }
    }

    /// Drop address-like entries that the registry no longer knows.
    pub fn prune(&self, registry: &dyn DeviceRegistry) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entity, _| !is_address_like(entity) || registry.is_live(entity));
        let pruned = before - entries.len();
        if pruned > 0 {
            info!("[Cache] Pruned {} entries of departed devices", pruned);
        }
        pruned
    }

    /// Prune and write the final snapshot.
    pub fn shutdown(&self, registry: &dyn DeviceRegistry) {
        self.prune(registry);
        self.save();
    }

    /// Spawn the periodic snapshot task. Returns `None` when persistence is off.
    pub fn start_autosave(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.persistent {
            return None;
        }

        info!(
            "[Cache] Saving state every {}s to {:?}",
            self.save_interval.as_secs(),
            self.path
        );

        let cache = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.save_interval);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cache = cache.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || cache.save()).await {
                            error!("[Cache] Snapshot task failed: {}", e);
                        }
                    }
                }
            }
            debug!("[Cache] Autosave stopped");
        }))
    }
}

/// Read a snapshot file, degrading to an empty map.
pub fn read_snapshot(path: &Path) -> HashMap<String, Properties> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<HashMap<String, Properties>>(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[Cache] Corrupt state file {:?}, starting empty: {}", path, e);
                HashMap::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("[Cache] No state file at {:?} (first run)", path);
            HashMap::new()
        }
        Err(e) => {
            error!("[Cache] Failed to read state file {:?}: {}", path, e);
            HashMap::new()
        }
    }
}

/// Rewrite the whole snapshot file.
pub fn write_snapshot(path: &Path, entries: &BTreeMap<String, Properties>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(entries)?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_CACHE_IGNORE};
    use crate::options::EntityOptions;
    use serde_json::{Value, json};

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn cache_in(dir: &Path, persistent: bool) -> StateCache {
        let mut config = Config::default().cache;
        config.data_dir = dir.to_path_buf();
        config.persistent = persistent;
        StateCache::new(&config, Arc::new(DeviceOptions::default()))
    }

    struct Live(Vec<&'static str>);

    impl DeviceRegistry for Live {
        fn is_live(&self, entity: &str) -> bool {
            self.0.iter().any(|live| *live == entity)
        }
    }

    #[test]
    fn test_get_unknown_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);
        assert!(cache.get("0x00158d0001a2b3c4").is_empty());
    }

    #[test]
    fn test_set_returns_unfiltered_and_stores_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);

        let merged = cache.set(
            "remote",
            &props(json!({"action": "single", "battery": 90})),
            Some("publishDebounce"),
        );
        assert_eq!(Value::Object(merged), json!({"action": "single", "battery": 90}));
        assert_eq!(Value::Object(cache.get("remote")), json!({"battery": 90}));
    }

    #[test]
    fn test_per_entity_filtered_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default().cache;
        config.data_dir = dir.path().to_path_buf();
        let options = Arc::new(DeviceOptions::default());
        options.set_entity(
            "plug",
            EntityOptions {
                filtered_cache: Some(vec!["power_.*".to_string()]),
                ..Default::default()
            },
        );
        let cache = StateCache::new(&config, options);

        cache.set("plug", &props(json!({"state": "ON", "power_on_behavior": "off"})), None);
        cache.set("other", &props(json!({"power_on_behavior": "off"})), None);
        assert_eq!(Value::Object(cache.get("plug")), json!({"state": "ON"}));
        assert_eq!(
            Value::Object(cache.get("other")),
            json!({"power_on_behavior": "off"})
        );
    }

    #[test]
    fn test_change_notification() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);
        cache.set("lamp", &props(json!({"state": "OFF"})), None);

        let mut rx = cache.subscribe();
        cache.set("lamp", &props(json!({"state": "ON", "action": "on"})), Some("command"));

        let change = rx.try_recv().unwrap();
        assert_eq!(change.entity, "lamp");
        assert_eq!(Value::Object(change.from), json!({"state": "OFF"}));
        assert_eq!(Value::Object(change.to), json!({"state": "ON", "action": "on"}));
        assert_eq!(change.reason.as_deref(), Some("command"));
        assert_eq!(Value::Object(change.update), json!({"state": "ON", "action": "on"}));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);
        cache.set("lamp", &props(json!({"state": "ON"})), None);

        assert!(cache.remove("lamp"));
        assert!(!cache.remove("lamp"));
        assert!(cache.get("lamp").is_empty());
    }

    #[test]
    fn test_ignored_property_gone_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);
        let merged = cache.set(
            "switch",
            &props(json!({"click": "double", "state": "ON"})),
            None,
        );
        assert_eq!(merged.get("click"), Some(&json!("double")));
        cache.save();

        let reloaded = cache_in(dir.path(), true);
        reloaded.load();
        assert_eq!(Value::Object(reloaded.get("switch")), json!({"state": "ON"}));
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("state.json"), b"{not json").unwrap();

        let cache = cache_in(dir.path(), true);
        cache.load();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_persistence_disabled_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), false);
        cache.set("lamp", &props(json!({"state": "ON"})), None);

        cache.save();
        cache.shutdown(&KeepAll);
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_disabled_no_autosave() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache_in(dir.path(), false));
        cache.set("lamp", &props(json!({"state": "ON"})), None);

        assert!(cache.start_autosave(CancellationToken::new()).is_none());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_writes_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default().cache;
        config.data_dir = dir.path().to_path_buf();
        config.persistent = true;
        config.save_interval_secs = 1;
        let cache = Arc::new(StateCache::new(&config, Arc::new(DeviceOptions::default())));
        let path = config.state_path();

        cache.set("lamp", &props(json!({"state": "ON"})), None);
        let cancel = CancellationToken::new();
        let autosave = cache.start_autosave(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // The write itself runs on the blocking pool
        for _ in 0..100 {
            if read_snapshot(&path).contains_key("lamp") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            Value::Object(read_snapshot(&path)["lamp"].clone()),
            json!({"state": "ON"})
        );

        cancel.cancel();
        autosave.await.unwrap();
        cache.set("plug", &props(json!({"power": 5})), None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!read_snapshot(&path).contains_key("plug"));
    }

    #[test]
    fn test_prune_only_departed_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);
        for entity in ["0x00158d0001a2b3c4", "0x00158d0001ffffff", "living_room_group"] {
            cache.set(entity, &props(json!({"state": "ON"})), None);
        }

        let pruned = cache.prune(&Live(vec!["0x00158d0001a2b3c4"]));
        assert_eq!(pruned, 1);
        assert!(cache.contains("0x00158d0001a2b3c4"));
        assert!(!cache.contains("0x00158d0001ffffff"));
        assert!(cache.contains("living_room_group"));
    }

    #[test]
    fn test_address_like() {
        assert!(is_address_like("0x00158d0001a2b3c4"));
        assert!(!is_address_like("0x1234"));
        assert!(!is_address_like("kitchen"));
        assert!(!is_address_like("0x00158d0001a2b3zz"));
    }

    #[test]
    fn test_default_ignore_list_strips_transients() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), true);
        let mut patch = Properties::new();
        for key in DEFAULT_CACHE_IGNORE.iter().filter(|k| !k.contains('*')) {
            patch.insert(key.to_string(), json!(1));
        }
        patch.insert("action_rate".to_string(), json!(3));
        patch.insert("temperature".to_string(), json!(20.5));

        cache.set("sensor", &patch, None);
        assert_eq!(Value::Object(cache.get("sensor")), json!({"temperature": 20.5}));
    }
}
