//! Persisted Agent Configuration
//!
//! ## Document model
//!
//! The configuration is one JSON document. It is kept as a
//! [`serde_json::Value`] so that keys this version does not know about
//! survive a remote update and a save, and is read through the typed
//! [`AgentSettings`] view.
//!
//! ## Merging
//!
//! Two merges with opposite precedence:
//!
//! | When                  | Function            | Winner            |
//! |-----------------------|---------------------|-------------------|
//! | loading from disk     | [`fill_missing`]    | the file on disk  |
//! | remote config update  | [`merge_update`]    | the update        |
//!
//! Both recurse into objects and never drop sibling keys that the other side
//! did not mention. Non-object values are replaced wholesale.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use log::{info, warn};
use sensorbox_connectors::{MqttConfig, TlsSettings};
use sensorbox_core::constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_KEEP_ALIVE_SECS, RECONNECT_MAX_DELAY_SECS,
    RECONNECT_MIN_DELAY_SECS, WATCHDOG_DEFAULT_PING_TARGET, WATCHDOG_INTERVAL_SECS,
    WATCHDOG_MAX_RECONNECT_ATTEMPTS, WATCHDOG_NETWORK_BAD_REBOOT_DELAY_SECS,
    WATCHDOG_TIMEOUT_SECS,
};
use sensorbox_core::{QoS, WatchdogPolicy};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Default location of the persisted document
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Built-in defaults
pub fn defaults() -> Value {
    json!({
        "intervals": {
            "BME680": 45,
            "VEML7700": 10,
            "SOUND": 6,
            "IP_REFRESH": 300,
            "IamAlive": 3600
        },
        "mqtt": {
            "host": "0.0.0.0",
            "port": 1886,
            "topic": "topic",
            "config_topic": "toipc/commands",
            "username": "",
            "password": "",
            "use_tls": true,
            "ca_cert": "",
            "client_cert": "",
            "client_key": "",
            "insecure_tls": false,
            "keepalive": DEFAULT_KEEP_ALIVE_SECS,
            "qos": 1,
            "reconnect_min_delay": RECONNECT_MIN_DELAY_SECS,
            "reconnect_max_delay": RECONNECT_MAX_DELAY_SECS
        },
        "device": {
            "nodeId": "node1"
        },
        "buffer": {
            "maxlen": DEFAULT_BUFFER_CAPACITY
        },
        "offsets": {
            "BME680": { "temperature": 0.0, "humidity": 0.0, "pressure": 0.0, "gas": 0.0 },
            "VEML7700": { "lux": 0.0 },
            "SOUND": { "dB": 0.0 }
        },
        "sensors": {
            "BME680": { "channels": ["temperature", "humidity", "pressure", "gas"], "command": [] },
            "VEML7700": { "channels": ["lux"], "command": [] },
            "SOUND": { "channels": ["dB"], "command": [] }
        },
        "sensorIds": {
            "temp_avg": "8adf6950-dc5c-40ba-aaa1-b0f1186fad20",
            "temp_min": "269a691c-29d9-4d2c-b251-793c36644b80",
            "temp_max": "60a23b17-d87e-42d3-be9a-23e4ffc3de60",
            "hum_avg": "eb165dad-a828-4f2b-8f24-4144e2d5a2ae",
            "hum_min": "64e6760b-74f4-4073-808a-9dc4bff07d9a",
            "hum_max": "764f78e8-ea8f-4737-abcc-e3ea67111135",
            "press_avg": "9a6dbf01-9831-4281-8909-0b452ef6ff7b",
            "press_min": "14472184-1d7b-4ab2-a392-7c624ac7454c",
            "press_max": "d9e53ae1-4c52-4bb7-b815-d752715c308f",
            "gas_avg": "c684834e-a9c0-471c-b9dd-703474426dc8",
            "gas_min": "a44b7881-fd56-43bc-b04b-1f2d3d4bd1f1",
            "gas_max": "be880eaf-72de-4990-b565-14f57542beb1",
            "aq_avg": "1ea50264-9ed0-41ec-ab99-13b91feae61a",
            "aq_min": "2f0fc77d-975f-445b-a3ab-655f2c7aef0d",
            "aq_max": "dbf246db-8daf-44d6-a54c-8b4327f22720",
            "aq_label_avg": "df1d17e0-70fd-4615-bab5-9f4e7c136b5d",
            "aq_label_min": "3a5acd7e-58f0-41d6-8c35-c0d73a362e2a",
            "aq_label_max": "5d2c3b0d-d843-4a4b-bc60-1cd3a57d4916",
            "lux_avg": "400f7c9c-4648-4d68-9623-6ddba017c739",
            "lux_min": "080fbc9d-7a0a-420e-b1e4-36603386b6b0",
            "lux_max": "f2b6af8e-d051-4819-a4b2-302bfcbb3e9d",
            "sound_avg": "e1b5fa13-3e00-4a34-93c7-0e2c57564d1c",
            "sound_min": "60a6932f-25ac-4702-ba19-a461eccd8557",
            "sound_max": "bb3f059d-130b-41d4-94d8-e8c951350e83",
            "ip_msg": "62fca2aa205c550094bca93f",
            "mac_msg": "63089b5b205c5513f43719c6",
            "alive_msg": "ebfaf8fc-f984-4abf-8e69-5fbf97923939"
        },
        "watchdog": {
            "enabled": true,
            "interval": WATCHDOG_INTERVAL_SECS,
            "timeout": WATCHDOG_TIMEOUT_SECS,
            "max_reconnect_tries": WATCHDOG_MAX_RECONNECT_ATTEMPTS,
            "network_bad_reboot_delay": WATCHDOG_NETWORK_BAD_REBOOT_DELAY_SECS,
            "ping_target": WATCHDOG_DEFAULT_PING_TARGET
        },
        "reboot": {
            "command": ["sudo", "reboot"]
        }
    })
}

/// Copy keys from `defaults` that `target` lacks, at any depth
pub fn fill_missing(target: &mut Value, defaults: &Value) {
    let (Value::Object(target), Value::Object(defaults)) = (target, defaults) else {
        return;
    };

    for (key, default) in defaults {
        match target.get_mut(key) {
            Some(existing) => fill_missing(existing, default),
            None => {
                target.insert(key.clone(), default.clone());
            }
        }
    }
}

/// Merge `update` into `target`; update values win, objects merge recursively
pub fn merge_update(target: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, incoming) in update {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_update(existing, incoming),
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Read the document at `path` merged over the defaults
///
/// A missing, unreadable or non-object file yields the defaults alone.
pub fn load(path: &Path) -> Value {
    let mut document = match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                warn!("{} is not a JSON object, using defaults only", path.display());
                Value::Object(Map::new())
            }
            Err(err) => {
                warn!("Error reading {} ({}), using defaults only", path.display(), err);
                Value::Object(Map::new())
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!("{} not found, using defaults", path.display());
            Value::Object(Map::new())
        }
        Err(err) => {
            warn!("Error reading {} ({}), using defaults only", path.display(), err);
            Value::Object(Map::new())
        }
    };

    fill_missing(&mut document, &defaults());
    document
}

/// Write `document` to `path` as pretty JSON, replacing the file atomically
pub fn save(path: &Path, document: &Value) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let text = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;

    info!("Configuration saved to {}", path.display());
    Ok(())
}

/// Live configuration shared between the main loop and the control channel
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    live: RwLock<Value>,
}

impl ConfigStore {
    /// Load the document at `path` (see [`load`])
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let live = load(&path);
        Self {
            path,
            live: RwLock::new(live),
        }
    }

    /// Store over an in-memory document, persisted to `path` on update
    pub fn with_document(path: impl Into<PathBuf>, document: Value) -> Self {
        Self {
            path: path.into(),
            live: RwLock::new(document),
        }
    }

    /// Where updates are persisted
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> Value {
        self.live.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Typed view of the current document
    pub fn settings(&self) -> Result<AgentSettings, ConfigError> {
        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        Ok(AgentSettings::deserialize(&*live)?)
    }

    /// Merge `update` into the live document and persist the result
    ///
    /// The merged document is validated first; an update that would make
    /// the configuration unreadable is rejected and nothing changes.
    pub fn apply_update(&self, update: &Map<String, Value>) -> Result<Value, ConfigError> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);

        let mut merged = live.clone();
        if let Value::Object(map) = &mut merged {
            merge_update(map, update);
        }
        AgentSettings::deserialize(&merged)?;

        save(&self.path, &merged)?;
        *live = merged.clone();
        Ok(merged)
    }
}

/// Typed view of the configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    pub mqtt: MqttSettings,
    pub device: DeviceSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub intervals: BTreeMap<String, f64>,
    #[serde(default)]
    pub offsets: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub sensors: BTreeMap<String, SensorSettings>,
    #[serde(rename = "sensorIds", default)]
    pub sensor_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub reboot: RebootSettings,
}

impl AgentSettings {
    /// Interval `key` from the `intervals` section, or `default_secs`
    pub fn interval(&self, key: &str, default_secs: f64) -> Duration {
        secs_to_duration(self.intervals.get(key).copied().unwrap_or(default_secs))
    }

    /// Calibration offsets of one sensor
    pub fn offsets_for(&self, sensor: &str) -> BTreeMap<String, f64> {
        self.offsets.get(sensor).cloned().unwrap_or_default()
    }
}

/// `mqtt` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Data topic
    pub topic: String,
    pub config_topic: String,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
    pub insecure_tls: bool,
    pub keepalive: u64,
    pub qos: u8,
    pub reconnect_min_delay: u64,
    pub reconnect_max_delay: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 1886,
            topic: "topic".into(),
            config_topic: "toipc/commands".into(),
            username: String::new(),
            password: String::new(),
            use_tls: true,
            ca_cert: String::new(),
            client_cert: String::new(),
            client_key: String::new(),
            insecure_tls: false,
            keepalive: DEFAULT_KEEP_ALIVE_SECS,
            qos: 1,
            reconnect_min_delay: RECONNECT_MIN_DELAY_SECS,
            reconnect_max_delay: RECONNECT_MAX_DELAY_SECS,
        }
    }
}

/// Negative values clamp to zero, out-of-range ones saturate
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn secs_to_ms(secs: f64) -> u64 {
    u64::try_from(secs_to_duration(secs).as_millis()).unwrap_or(u64::MAX)
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl MqttSettings {
    /// Publish QoS, falling back to at-least-once for bad values
    pub fn qos(&self) -> QoS {
        QoS::from_level(self.qos).unwrap_or_else(|| {
            warn!("mqtt.qos {} out of range, using 1", self.qos);
            QoS::AtLeastOnce
        })
    }

    /// Transport configuration for client `client_id`
    pub fn transport_config(&self, client_id: &str) -> MqttConfig {
        let mut config = MqttConfig::new(&self.host, self.port, client_id)
            .with_credentials(&self.username, &self.password)
            .with_keep_alive(Duration::from_secs(self.keepalive))
            .with_backoff(
                Duration::from_secs(self.reconnect_min_delay),
                Duration::from_secs(self.reconnect_max_delay),
            );
        config.subscribe_qos = self.qos();

        if self.use_tls {
            config = config.with_tls(TlsSettings {
                ca_cert: non_empty_path(&self.ca_cert),
                client_cert: non_empty_path(&self.client_cert),
                client_key: non_empty_path(&self.client_key),
                insecure: self.insecure_tls,
            });
        }
        config
    }
}

/// `device` section
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    /// Device id, also the device control topic
    #[serde(rename = "nodeId", default)]
    pub node_id: String,
}

/// `buffer` section
#[derive(Debug, Clone, Deserialize)]
pub struct BufferSettings {
    pub maxlen: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            maxlen: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// One entry of the `sensors` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Channels aggregated for this sensor
    pub channels: Vec<String>,
    /// Program printing one JSON reading per run; empty disables the sensor
    pub command: Vec<String>,
    /// Per-read timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// `watchdog` section, times in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub interval: f64,
    pub timeout: f64,
    pub max_reconnect_tries: u32,
    pub network_bad_reboot_delay: f64,
    pub ping_target: String,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: WATCHDOG_INTERVAL_SECS as f64,
            timeout: WATCHDOG_TIMEOUT_SECS as f64,
            max_reconnect_tries: WATCHDOG_MAX_RECONNECT_ATTEMPTS,
            network_bad_reboot_delay: WATCHDOG_NETWORK_BAD_REBOOT_DELAY_SECS as f64,
            ping_target: WATCHDOG_DEFAULT_PING_TARGET.into(),
        }
    }
}

impl WatchdogSettings {
    /// Millisecond policy; fractional seconds are kept
    pub fn policy(&self) -> WatchdogPolicy {
        WatchdogPolicy {
            interval_ms: secs_to_ms(self.interval),
            timeout_ms: secs_to_ms(self.timeout),
            max_reconnect_attempts: self.max_reconnect_tries,
            network_bad_reboot_delay_ms: secs_to_ms(self.network_bad_reboot_delay),
        }
    }
}

/// `reboot` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebootSettings {
    /// Program and arguments restarting the device
    pub command: Vec<String>,
}

impl Default for RebootSettings {
    fn default() -> Self {
        Self {
            command: vec!["sudo".into(), "reboot".into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_deserialize() {
        let settings = AgentSettings::deserialize(&defaults()).unwrap();
        assert_eq!(settings.mqtt.port, 1886);
        assert_eq!(settings.device.node_id, "node1");
        assert_eq!(settings.buffer.maxlen, 1000);
        assert_eq!(settings.interval("BME680", 0.0), Duration::from_secs(45));
        assert_eq!(settings.sensors["BME680"].channels.len(), 4);
        assert_eq!(settings.watchdog.policy(), WatchdogPolicy::default());
        assert_eq!(settings.reboot.command, vec!["sudo", "reboot"]);
    }

    #[test]
    fn user_values_win_on_load() {
        let mut user = json!({ "mqtt": { "host": "broker.lan" }, "extra": 1 });
        fill_missing(&mut user, &defaults());

        assert_eq!(user["mqtt"]["host"], "broker.lan");
        assert_eq!(user["mqtt"]["port"], 1886);
        assert_eq!(user["extra"], 1);
        assert!(user["sensorIds"]["temp_avg"].is_string());
    }

    #[test]
    fn update_values_win_and_siblings_survive() {
        let mut live = defaults();
        let update = json!({ "mqtt": { "port": 8883 }, "intervals": { "SOUND": 12 } });

        merge_update(live.as_object_mut().unwrap(), update.as_object().unwrap());

        assert_eq!(live["mqtt"]["port"], 8883);
        assert_eq!(live["mqtt"]["host"], "0.0.0.0");
        assert_eq!(live["intervals"]["SOUND"], 12);
        assert_eq!(live["intervals"]["BME680"], 45);
    }

    #[test]
    fn update_replaces_non_object_values() {
        let mut live = json!({ "reboot": { "command": ["sudo", "reboot"] } });
        let update = json!({ "reboot": { "command": ["systemctl", "reboot"] } });
        merge_update(live.as_object_mut().unwrap(), update.as_object().unwrap());
        assert_eq!(live["reboot"]["command"], json!(["systemctl", "reboot"]));
    }

    #[test]
    fn missing_and_corrupt_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("none.json");
        assert_eq!(load(&missing), defaults());

        let corrupt = dir.path().join("bad.json");
        fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(load(&corrupt), defaults());
    }

    #[test]
    fn store_update_persists_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "device": { "nodeId": "box-7" } }"#).unwrap();

        let store = ConfigStore::open(&path);
        assert_eq!(store.settings().unwrap().device.node_id, "box-7");

        let update = json!({ "buffer": { "maxlen": 5 } });
        store.apply_update(update.as_object().unwrap()).unwrap();

        let reloaded = ConfigStore::open(&path);
        let settings = reloaded.settings().unwrap();
        assert_eq!(settings.buffer.maxlen, 5);
        assert_eq!(settings.device.node_id, "box-7");
    }

    #[test]
    fn invalid_update_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::with_document(&path, defaults());

        let update = json!({ "mqtt": { "port": "not a port" } });
        assert!(matches!(
            store.apply_update(update.as_object().unwrap()),
            Err(ConfigError::Invalid(_))
        ));
        assert_eq!(store.snapshot()["mqtt"]["port"], 1886);
        assert!(!path.exists());
    }

    #[test]
    fn fractional_watchdog_timings_are_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::with_document(&path, defaults());

        let update = json!({ "watchdog": { "interval": 30.0, "timeout": 90.5, "network_bad_reboot_delay": 0.25 } });
        store.apply_update(update.as_object().unwrap()).unwrap();

        let policy = ConfigStore::open(&path).settings().unwrap().watchdog.policy();
        assert_eq!(policy.interval_ms, 30_000);
        assert_eq!(policy.timeout_ms, 90_500);
        assert_eq!(policy.network_bad_reboot_delay_ms, 250);
        assert_eq!(policy.max_reconnect_attempts, 3);
    }

    #[test]
    fn tls_paths_map_to_transport_settings() {
        let mut settings = AgentSettings::deserialize(&defaults()).unwrap().mqtt;
        settings.ca_cert = "/etc/ca.pem".into();
        let config = settings.transport_config("sensorbox-node1");

        let tls = config.tls.unwrap();
        assert_eq!(tls.ca_cert, Some(PathBuf::from("/etc/ca.pem")));
        assert_eq!(tls.client_cert, None);
        assert!(!tls.insecure);

        settings.use_tls = false;
        assert!(settings.transport_config("id").tls.is_none());
    }
}
