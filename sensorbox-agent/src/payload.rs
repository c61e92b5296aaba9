//! Data-topic payloads
//!
//! Every message on the data topic has the same envelope:
//!
//! ```json
//! {"dataType": "SensorData", "data": [
//!   {"nodeId": "node1", "sensorType": "Temperature", "sensorId": "<uuid>",
//!    "value": 21.4, "generatedDate": 1700000000}
//! ]}
//! ```
//!
//! A closed statistics window becomes three records per channel (avg, min,
//! max). The ids come from the `sensorIds` configuration section, keyed
//! `<prefix>_<stat>`; a record whose id is not configured is left out.

use std::collections::BTreeMap;

use log::debug;
use sensorbox_core::FinalizedStat;
use serde::Serialize;
use serde_json::Value;

const DATA_TYPE: &str = "SensorData";
const MESSAGE_TYPE: &str = "Message";
const ALIVE_TEXT: &str = "I am Alive";

/// Gas resistance range (ohms) mapped onto the 0-100 air-quality scale
const AQ_GAS_MIN: f64 = 10_000.0;
const AQ_GAS_MAX: f64 = 67_000.0;

/// Normalize a gas resistance reading to an air-quality score in 0-100
pub fn air_quality_score(gas: f64) -> f64 {
    let clamped = gas.clamp(AQ_GAS_MIN, AQ_GAS_MAX);
    let score = (clamped - AQ_GAS_MIN) / (AQ_GAS_MAX - AQ_GAS_MIN) * 100.0;
    (score * 100.0).round() / 100.0
}

/// Human label for an air-quality score
pub fn air_quality_label(score: f64) -> &'static str {
    match score {
        s if s >= 80.0 => "Good",
        s if s >= 60.0 => "Fair",
        s if s >= 40.0 => "Moderate",
        s if s >= 20.0 => "Poor",
        _ => "Bad",
    }
}

/// `(sensorType, id prefix)` of a channel
pub fn channel_kind(channel: &str) -> (&str, &str) {
    match channel {
        "temperature" => ("Temperature", "temp"),
        "humidity" => ("Humidity", "hum"),
        "pressure" => ("Pressure", "press"),
        "gas" => ("Gas", "gas"),
        "lux" => ("Light", "lux"),
        "dB" => ("Sound", "sound"),
        other => (other, other),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Record<'a> {
    node_id: &'a str,
    sensor_type: &'a str,
    sensor_id: &'a str,
    value: Value,
    generated_date: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    data_type: &'static str,
    data: Vec<Record<'a>>,
}

/// Builds data-topic payloads for one device
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    node_id: String,
    sensor_ids: BTreeMap<String, String>,
}

impl PayloadBuilder {
    pub fn new(node_id: impl Into<String>, sensor_ids: BTreeMap<String, String>) -> Self {
        Self {
            node_id: node_id.into(),
            sensor_ids,
        }
    }

    fn record<'a>(
        &'a self,
        records: &mut Vec<Record<'a>>,
        sensor_type: &'a str,
        id_key: &str,
        value: Value,
        generated_date: u64,
    ) {
        match self.sensor_ids.get(id_key) {
            Some(sensor_id) => records.push(Record {
                node_id: &self.node_id,
                sensor_type,
                sensor_id,
                value,
                generated_date,
            }),
            None => debug!("No sensorId configured for '{}', record skipped", id_key),
        }
    }

    fn stat_records<'a>(
        &'a self,
        records: &mut Vec<Record<'a>>,
        sensor_type: &'a str,
        prefix: &str,
        stat: &FinalizedStat,
        generated_date: u64,
    ) {
        for (suffix, value) in [("avg", stat.avg), ("min", stat.min), ("max", stat.max)] {
            let key = format!("{}_{}", prefix, suffix);
            self.record(records, sensor_type, &key, Value::from(value), generated_date);
        }
    }

    fn air_quality_records<'a>(&'a self, records: &mut Vec<Record<'a>>, gas: &FinalizedStat, generated_date: u64) {
        let scores = [("avg", gas.avg), ("min", gas.min), ("max", gas.max)]
            .map(|(suffix, value)| (suffix, value.map(air_quality_score)));

        for (suffix, score) in scores {
            self.record(records, "AirQuality", &format!("aq_{}", suffix), Value::from(score), generated_date);
        }
        for (suffix, score) in scores {
            let label = score.map_or("Unknown", air_quality_label);
            self.record(
                records,
                MESSAGE_TYPE,
                &format!("aq_label_{}", suffix),
                Value::from(label),
                generated_date,
            );
        }
    }

    fn encode(records: Vec<Record<'_>>) -> Vec<u8> {
        let envelope = Envelope {
            data_type: DATA_TYPE,
            data: records,
        };
        // Maps with string keys and plain values always serialize
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    /// Payload for a closed window, channels in `channels` order
    ///
    /// A `gas` channel additionally yields air-quality scores and labels.
    pub fn window(&self, channels: &[String], stats: &BTreeMap<String, FinalizedStat>, generated_date: u64) -> Vec<u8> {
        let mut records = Vec::new();

        for channel in channels {
            let stat = stats.get(channel).copied().unwrap_or(FinalizedStat::ABSENT);
            let (sensor_type, prefix) = channel_kind(channel);
            self.stat_records(&mut records, sensor_type, prefix, &stat, generated_date);

            if channel == "gas" {
                self.air_quality_records(&mut records, &stat, generated_date);
            }
        }

        Self::encode(records)
    }

    /// IP and MAC announcement
    pub fn identity(&self, ip: &str, mac: &str, generated_date: u64) -> Vec<u8> {
        let mut records = Vec::new();
        self.record(&mut records, MESSAGE_TYPE, "ip_msg", Value::from(ip), generated_date);
        self.record(&mut records, MESSAGE_TYPE, "mac_msg", Value::from(mac), generated_date);
        Self::encode(records)
    }

    /// Periodic liveness message
    pub fn alive(&self, generated_date: u64) -> Vec<u8> {
        let mut records = Vec::new();
        self.record(&mut records, MESSAGE_TYPE, "alive_msg", Value::from(ALIVE_TEXT), generated_date);
        Self::encode(records)
    }
}
