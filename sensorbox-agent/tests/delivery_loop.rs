//! Sampling loop across a broker outage

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sensorbox_agent::config::defaults;
use sensorbox_agent::{Agent, AgentSettings, Reading, Sensor, SensorError};
use sensorbox_core::{ConnectionState, FixedTime, FlushOutcome, QoS, Transport, TransportResult};
use serde::Deserialize;
use serde_json::{json, Value};

struct RampSensor {
    channels: Vec<String>,
    next: Mutex<f64>,
}

#[async_trait]
impl Sensor for RampSensor {
    fn name(&self) -> &str {
        "SOUND"
    }

    fn channels(&self) -> &[String] {
        &self.channels
    }

    async fn read(&self) -> Result<Reading, SensorError> {
        let mut next = self.next.lock().unwrap();
        *next += 10.0;
        Ok(Reading::from([("dB".to_string(), *next)]))
    }
}

#[derive(Default)]
struct Broker {
    online: AtomicBool,
    received: Mutex<Vec<(String, Value)>>,
}

impl Transport for Broker {
    fn state(&self) -> ConnectionState {
        if self.online.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> TransportResult<()> {
        assert_eq!(qos, QoS::AtLeastOnce);
        assert!(!retain);
        let body = serde_json::from_slice(payload).unwrap();
        self.received.lock().unwrap().push((topic.to_string(), body));
        Ok(())
    }

    fn request_reconnect(&self) {}
}

fn settings(maxlen: usize) -> AgentSettings {
    let mut document = defaults();
    document["buffer"] = json!({ "maxlen": maxlen });
    document["mqtt"]["topic"] = json!("plant/data");
    AgentSettings::deserialize(&document).unwrap()
}

fn agent(maxlen: usize, broker: Arc<Broker>, clock: Arc<FixedTime>) -> Agent {
    let sensor = RampSensor {
        channels: vec!["dB".into()],
        next: Mutex::new(0.0),
    };
    Agent::new(settings(maxlen), broker, clock.clone(), clock)
        .with_sensor(Box::new(sensor))
        .with_ip_lookup(|| "10.1.2.3".into())
        .with_mac("b8:27:eb:00:00:07")
}

#[tokio::test]
async fn outage_keeps_newest_messages_and_drains_in_order() {
    let broker = Arc::new(Broker::default());
    let clock = Arc::new(FixedTime::new(0));
    let mut agent = agent(2, broker.clone(), clock.clone());

    // identity, then alive + first window at t=0, then a window every 6 s
    agent.start();
    for now in [0, 6_000, 12_000] {
        clock.set(now);
        assert_eq!(agent.tick().await, FlushOutcome::Offline);
    }
    assert_eq!(agent.buffer().len(), 2);
    assert!(agent.buffer().stats().evicted > 0);

    broker.online.store(true, Ordering::SeqCst);
    assert_eq!(agent.tick().await, FlushOutcome::Sent);
    assert_eq!(agent.tick().await, FlushOutcome::Sent);

    let received = broker.received.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|(topic, _)| topic == "plant/data"));

    // Windows closed at 6 s and 12 s: samples 20 and 30
    let sound_avg: Vec<&Value> = received.iter().map(|(_, body)| &body["data"][0]["value"]).collect();
    assert_eq!(sound_avg, [&json!(20.0), &json!(30.0)]);
}

#[tokio::test]
async fn connected_agent_publishes_one_message_per_tick() {
    let broker = Arc::new(Broker {
        online: AtomicBool::new(true),
        ..Default::default()
    });
    let clock = Arc::new(FixedTime::new(1_700_000_000_000));
    let mut agent = agent(1000, broker.clone(), clock.clone());

    agent.start();
    agent.tick().await;
    assert_eq!(broker.received.lock().unwrap().len(), 1);
    // alive and the first window are still queued
    assert_eq!(agent.buffer().len(), 2);

    agent.tick().await;
    agent.tick().await;
    assert!(agent.buffer().is_empty());
    assert_eq!(agent.tick().await, FlushOutcome::Empty);

    let received = broker.received.lock().unwrap();
    let identity = &received[0].1;
    assert_eq!(identity["dataType"], "SensorData");
    assert_eq!(identity["data"][0]["value"], "10.1.2.3");
    assert_eq!(identity["data"][0]["nodeId"], "node1");
    assert_eq!(identity["data"][0]["generatedDate"], 1_700_000_000u64);
}
