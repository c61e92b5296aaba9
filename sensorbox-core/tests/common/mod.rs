//! Shared test doubles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sensorbox_core::{ConnectionState, QoS, Transport, TransportError, TransportResult};

/// Transport whose connectivity is flipped by the test
#[derive(Default)]
pub struct ScriptedTransport {
    connected: AtomicBool,
    reject: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn payloads(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn publish(&self, topic: &str, payload: &[u8], _qos: QoS, _retain: bool) -> TransportResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::QueueFull);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn request_reconnect(&self) {}
}
