//! Remote control of the agent
//!
//! Receives decoded control messages from the transport's network task:
//!
//! - configuration updates are merged into the live document, persisted and
//!   followed by a reboot so the new settings apply from a clean start
//! - `{"type":"command","cmd":"reboot"}` reboots right away
//! - watchdog echoes and fresh connections are forwarded to the watchdog
//!
//! An update that cannot be merged or saved is logged and leaves the device
//! running on its current configuration.

use std::sync::Arc;

use log::{debug, error, info, warn};
use sensorbox_connectors::{InboundHandler, WatchdogHandle};
use sensorbox_core::Rebooter;
use serde_json::{Map, Value};

use crate::config::ConfigStore;

/// Command name that reboots the device
pub const REBOOT_COMMAND: &str = "reboot";

/// Inbound handler owning the configuration store
pub struct ControlChannel {
    store: Arc<ConfigStore>,
    rebooter: Arc<dyn Rebooter>,
    watchdog: Option<WatchdogHandle>,
}

impl ControlChannel {
    /// Channel applying updates to `store` and rebooting through `rebooter`
    pub fn new(store: Arc<ConfigStore>, rebooter: Arc<dyn Rebooter>) -> Self {
        Self {
            store,
            rebooter,
            watchdog: None,
        }
    }

    /// Forward echoes and connects to `watchdog`
    pub fn with_watchdog(mut self, watchdog: WatchdogHandle) -> Self {
        self.watchdog = Some(watchdog);
        self
    }
}

impl InboundHandler for ControlChannel {
    fn on_connected(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.mark_connected();
        }
    }

    fn on_config_update(&self, update: Map<String, Value>) {
        let keys: Vec<&str> = update.keys().map(String::as_str).collect();
        info!("[CONFIG] update received for {:?}", keys);

        match self.store.apply_update(&update) {
            Ok(_) => {
                info!("[CONFIG] saved to {}", self.store.path().display());
                self.rebooter.reboot("configuration updated remotely");
            }
            Err(err) => error!("[CONFIG] update rejected, keeping current configuration: {}", err),
        }
    }

    fn on_watchdog_echo(&self, id: u64) {
        match &self.watchdog {
            Some(watchdog) if watchdog.record_echo(id) => debug!("[WATCHDOG] echo {} received", id),
            Some(_) => debug!("[WATCHDOG] stale echo {} ignored", id),
            None => debug!("[WATCHDOG] echo {} ignored, watchdog disabled", id),
        }
    }

    fn on_command(&self, cmd: Option<&str>) {
        match cmd {
            Some(REBOOT_COMMAND) => self.rebooter.reboot("reboot command received"),
            Some(other) => warn!("[CMD] unknown command '{}', ignoring", other),
            None => warn!("[CMD] command message without 'cmd', ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;
    use sensorbox_core::{FixedTime, WatchdogPolicy};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingRebooter {
        reasons: Mutex<Vec<String>>,
    }

    impl Rebooter for RecordingRebooter {
        fn reboot(&self, reason: &str) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    fn channel(dir: &TempDir) -> (ControlChannel, Arc<RecordingRebooter>) {
        let store = Arc::new(ConfigStore::with_document(dir.path().join("config.json"), defaults()));
        let rebooter = Arc::new(RecordingRebooter::default());
        (ControlChannel::new(store, rebooter.clone()), rebooter)
    }

    #[test]
    fn reboot_command_reboots() {
        let dir = TempDir::new().unwrap();
        let (channel, rebooter) = channel(&dir);

        channel.on_command(Some("reboot"));
        assert_eq!(rebooter.reasons.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_and_missing_commands_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (channel, rebooter) = channel(&dir);

        channel.on_command(Some("selfdestruct"));
        channel.on_command(None);
        assert!(rebooter.reasons.lock().unwrap().is_empty());
    }

    #[test]
    fn accepted_update_is_saved_then_reboots() {
        let dir = TempDir::new().unwrap();
        let (channel, rebooter) = channel(&dir);

        let update = json!({ "intervals": { "SOUND": 12 } });
        channel.on_config_update(update.as_object().unwrap().clone());

        let saved: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap()).unwrap();
        assert_eq!(saved["intervals"]["SOUND"], 12);
        assert_eq!(saved["intervals"]["BME680"], 45);
        assert_eq!(rebooter.reasons.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_save_does_not_reboot() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::with_document(
            dir.path().join("missing-dir").join("config.json"),
            defaults(),
        ));
        let rebooter = Arc::new(RecordingRebooter::default());
        let channel = ControlChannel::new(store.clone(), rebooter.clone());

        let update = json!({ "buffer": { "maxlen": 10 } });
        channel.on_config_update(update.as_object().unwrap().clone());

        assert!(rebooter.reasons.lock().unwrap().is_empty());
        assert_eq!(store.snapshot()["buffer"]["maxlen"], 1000);
    }

    #[test]
    fn echoes_reach_the_watchdog() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedTime::new(1_000));
        let handle = WatchdogHandle::new(WatchdogPolicy::default(), clock.clone());
        let (channel, _) = channel(&dir);
        let channel = channel.with_watchdog(handle.clone());

        let id = handle.watchdog().begin_ping(1_000);
        clock.advance(2_000);
        channel.on_watchdog_echo(id);

        assert_eq!(handle.watchdog().snapshot().last_echo(), Some(3_000));
    }
}
