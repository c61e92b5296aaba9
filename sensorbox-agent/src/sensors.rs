//! Sensor collaborators
//!
//! A sensor produces one [`Reading`] per main-loop tick: a map of channel name
//! to value. Channels missing from a reading simply contribute no sample.
//!
//! [`CommandSensor`] covers the deployed hardware: a helper program per
//! sensor prints one JSON object (`{"temperature": 21.4, ...}`) and exits.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

use crate::config::SensorSettings;

/// One sample per channel
pub type Reading = BTreeMap<String, f64>;

/// Default budget for one external read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Sensor read errors
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("No read command configured")]
    NotConfigured,

    #[error("Failed to run sensor command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Sensor command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sensor command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Sensor output is not a JSON object")]
    NotAnObject,

    #[error("Malformed sensor output: {0}")]
    Json(#[from] serde_json::Error),
}

/// A source of readings
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Name used for windows, offsets, intervals and payloads
    fn name(&self) -> &str;

    /// Channels this sensor reports
    fn channels(&self) -> &[String];

    /// Take one reading
    async fn read(&self) -> Result<Reading, SensorError>;
}

/// Sensor backed by an external program printing a JSON object
#[derive(Debug, Clone)]
pub struct CommandSensor {
    name: String,
    channels: Vec<String>,
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSensor {
    pub fn new(name: impl Into<String>, channels: Vec<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            channels,
            argv,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Build from a `sensors` entry; `None` when no command is configured
    pub fn from_settings(name: &str, settings: &SensorSettings) -> Option<Self> {
        if settings.command.is_empty() {
            return None;
        }

        let mut sensor = Self::new(name, settings.channels.clone(), settings.command.clone());
        if let Some(ms) = settings.timeout_ms {
            sensor.timeout = Duration::from_millis(ms);
        }
        Some(sensor)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sensor for CommandSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> &[String] {
        &self.channels
    }

    async fn read(&self) -> Result<Reading, SensorError> {
        let (program, args) = self.argv.split_first().ok_or(SensorError::NotConfigured)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| SensorError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(SensorError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_reading(&output.stdout)
    }
}

/// Decode a JSON object of channel values, skipping non-numeric entries
pub fn parse_reading(raw: &[u8]) -> Result<Reading, SensorError> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .filter_map(|(channel, value)| value.as_f64().map(|v| (channel, v)))
            .collect()),
        _ => Err(SensorError::NotAnObject),
    }
}

/// Add per-channel calibration offsets in place
pub fn apply_offsets(reading: &mut Reading, offsets: &BTreeMap<String, f64>) {
    for (channel, value) in reading.iter_mut() {
        if let Some(offset) = offsets.get(channel) {
            *value += offset;
        }
    }
}
