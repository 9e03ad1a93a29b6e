use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Properties that describe a momentary event rather than device state.
/// They are published once but never cached.
pub const DEFAULT_CACHE_IGNORE: &[&str] = &[
    "action",
    "action_.*",
    "button",
    "button_left",
    "button_right",
    "click",
    "forgotten",
    "keyerror",
    "step_size",
    "transition_time",
    "group_list",
    "group_capacity",
    "no_occupancy_since",
    "step_mode",
    "elapsed",
    "last_seen",
];

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            if (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''))
            {
                value = &value[1..value.len() - 1];
            }

            // Only set if not already set (env vars take precedence)
            if std::env::var(key).is_err() {
                // SAFETY: We're single-threaded at this point (called before any async runtime)
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Prefix of every outbound state topic
    pub base_topic: String,
    /// Prefix of the topics carrying converted device patches
    pub ingest_topic: String,
    /// Publish the full cached state instead of only the changed properties
    pub cache_state: bool,
    /// How long shutdown waits for queued messages to reach the broker
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub data_dir: PathBuf,
    pub file_name: String,
    /// Whether the cache is loaded from and written to disk
    pub persistent: bool,
    pub save_interval_secs: u64,
    /// Global cache-ignore list, exact names and patterns
    pub ignore: Vec<String>,
}

impl CacheConfig {
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }
}

impl BridgeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zigbee-state-bridge")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: "zigbee-state-bridge".to_string(),
                username: None,
                password: None,
            },
            bridge: BridgeConfig {
                base_topic: "zigbee2mqtt".to_string(),
                ingest_topic: "zigbee2mqtt-converted".to_string(),
                cache_state: true,
                drain_timeout_secs: 5,
            },
            cache: CacheConfig {
                data_dir: default_data_dir(),
                file_name: "state.json".to_string(),
                persistent: true,
                save_interval_secs: 300,
                ignore: DEFAULT_CACHE_IGNORE.iter().map(|s| s.to_string()).collect(),
            },
        }
    }
}

fn env_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // MQTT configuration
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }

        // Bridge topics and publish behavior
        if let Ok(topic) = std::env::var("BRIDGE_BASE_TOPIC") {
            config.bridge.base_topic = topic;
        }
        if let Ok(topic) = std::env::var("BRIDGE_INGEST_TOPIC") {
            config.bridge.ingest_topic = topic;
        }
        if let Ok(flag) = std::env::var("BRIDGE_CACHE_STATE")
            && let Some(f) = env_flag(&flag)
        {
            config.bridge.cache_state = f;
        }

        // State cache persistence
        if let Ok(dir) = std::env::var("BRIDGE_DATA_DIR") {
            config.cache.data_dir = PathBuf::from(dir);
        }
        if let Ok(flag) = std::env::var("BRIDGE_CACHE_PERSISTENT")
            && let Some(f) = env_flag(&flag)
        {
            config.cache.persistent = f;
        }
        if let Ok(interval) = std::env::var("BRIDGE_CACHE_SAVE_INTERVAL")
            && let Ok(i) = interval.parse()
        {
            config.cache.save_interval_secs = i;
        }

        config
    }
}
