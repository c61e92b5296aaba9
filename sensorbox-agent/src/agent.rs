//! Sampling and delivery loop
//!
//! One [`Agent::tick`] every 100 ms:
//!
//! 1. read every sensor, add its calibration offsets, record into its window
//! 2. refresh the IP address when due and announce it if it changed
//! 3. queue an "I am Alive" message when due
//! 4. close due windows and queue their payloads
//! 5. offer the oldest queued message to the transport
//!
//! Everything runs on the caller's task. The only network call is the
//! non-blocking publish inside [`DeliveryBuffer::try_flush`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use sensorbox_core::constants::MAIN_LOOP_TICK_MS;
use sensorbox_core::time::elapsed_ms;
use sensorbox_core::{
    DeliveryBuffer, DeliveryPolicy, FlushOutcome, OutboundMessage, StatsWindow, TimeSource, Timestamp,
    Transport,
};

use crate::config::AgentSettings;
use crate::device;
use crate::payload::PayloadBuilder;
use crate::sensors::{apply_offsets, Sensor};

/// Window length for sensors without an `intervals` entry
pub const DEFAULT_WINDOW_SECS: f64 = 60.0;
/// Default IP refresh period
pub const DEFAULT_IP_REFRESH_SECS: f64 = 300.0;
/// Default "I am Alive" period
pub const DEFAULT_ALIVE_SECS: f64 = 3600.0;

type IpLookup = Box<dyn Fn() -> String + Send + Sync>;

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Fires once per interval, starting on the first check
#[derive(Debug, Clone)]
struct Schedule {
    interval_ms: u64,
    last: Option<Timestamp>,
}

impl Schedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval_ms: duration_ms(interval),
            last: None,
        }
    }

    fn fire(&mut self, now: Timestamp) -> bool {
        let due = self
            .last
            .map_or(true, |last| elapsed_ms(last, now) >= self.interval_ms);
        if due {
            self.last = Some(now);
        }
        due
    }
}

struct SensorSlot {
    sensor: Box<dyn Sensor>,
    offsets: BTreeMap<String, f64>,
    window: StatsWindow,
}

/// The main loop state
pub struct Agent {
    settings: AgentSettings,
    transport: Arc<dyn Transport>,
    buffer: DeliveryBuffer,
    builder: PayloadBuilder,
    slots: Vec<SensorSlot>,
    clock: Arc<dyn TimeSource>,
    wall: Arc<dyn TimeSource>,
    ip_lookup: IpLookup,
    ip: String,
    mac: String,
    ip_refresh: Schedule,
    alive: Schedule,
}

impl Agent {
    /// Agent over `transport`
    ///
    /// `clock` drives windows and schedules and should be monotonic; `wall`
    /// stamps payloads with their `generatedDate`.
    pub fn new(
        settings: AgentSettings,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn TimeSource>,
        wall: Arc<dyn TimeSource>,
    ) -> Self {
        let policy = DeliveryPolicy {
            qos: settings.mqtt.qos(),
            retain: false,
        };

        Self {
            buffer: DeliveryBuffer::with_policy(settings.buffer.maxlen, policy),
            builder: PayloadBuilder::new(&settings.device.node_id, settings.sensor_ids.clone()),
            ip_refresh: Schedule::new(settings.interval("IP_REFRESH", DEFAULT_IP_REFRESH_SECS)),
            alive: Schedule::new(settings.interval("IamAlive", DEFAULT_ALIVE_SECS)),
            slots: Vec::new(),
            transport,
            clock,
            wall,
            ip_lookup: Box::new(device::local_ip),
            ip: String::new(),
            mac: device::FALLBACK_MAC.to_string(),
            settings,
        }
    }

    /// Sample `sensor` every tick, windowed per its `intervals` entry
    pub fn with_sensor(mut self, sensor: Box<dyn Sensor>) -> Self {
        let name = sensor.name().to_string();
        let interval = self.settings.interval(&name, DEFAULT_WINDOW_SECS);
        let window = StatsWindow::new(&name, sensor.channels().iter().cloned(), duration_ms(interval));

        info!(
            "Sensor {} on channels {:?}, window {:?}",
            name,
            sensor.channels(),
            interval
        );

        self.slots.push(SensorSlot {
            offsets: self.settings.offsets_for(&name),
            sensor,
            window,
        });
        self
    }

    /// Replace the IP lookup
    pub fn with_ip_lookup(mut self, lookup: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.ip_lookup = Box::new(lookup);
        self
    }

    /// Fixed MAC address instead of reading the interface
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    /// Look up the IP and queue the identity message
    pub fn start(&mut self) {
        self.ip = (self.ip_lookup)();
        info!("MAC: {}, initial IP: {}", self.mac, self.ip);

        self.ip_refresh.fire(self.clock.now());
        let payload = self.builder.identity(&self.ip, &self.mac, self.generated_date());
        self.enqueue(payload);
    }

    fn generated_date(&self) -> u64 {
        self.wall.now() / 1000
    }

    fn enqueue(&mut self, payload: Vec<u8>) {
        let message = OutboundMessage::new(self.settings.mqtt.topic.as_str(), payload);
        if self.buffer.push(message).is_some() {
            warn!(
                "Delivery buffer full ({} messages), oldest message dropped",
                self.buffer.capacity()
            );
        }
    }

    async fn sample(&mut self) {
        for slot in &mut self.slots {
            match slot.sensor.read().await {
                Ok(mut reading) => {
                    apply_offsets(&mut reading, &slot.offsets);
                    slot.window.record(reading.iter());
                }
                Err(err) => debug!("{} read failed: {}", slot.sensor.name(), err),
            }
        }
    }

    fn refresh_ip(&mut self, now: Timestamp) {
        if !self.ip_refresh.fire(now) {
            return;
        }

        let ip = (self.ip_lookup)();
        if ip != self.ip {
            info!("IP changed: {} -> {}", self.ip, ip);
            self.ip = ip;
            let payload = self.builder.identity(&self.ip, &self.mac, self.generated_date());
            self.enqueue(payload);
        }
    }

    fn close_windows(&mut self, now: Timestamp) {
        let generated_date = self.generated_date();
        let mut payloads = Vec::new();

        for slot in &mut self.slots {
            if let Some(stats) = slot.window.close_if_due(now) {
                debug!("{} window closed: {:?}", slot.window.name(), stats);
                payloads.push(self.builder.window(slot.sensor.channels(), &stats, generated_date));
            }
        }

        for payload in payloads {
            self.enqueue(payload);
        }
    }

    /// Run one iteration of the loop
    pub async fn tick(&mut self) -> FlushOutcome {
        self.sample().await;

        let now = self.clock.now();
        self.refresh_ip(now);

        if self.alive.fire(now) {
            let payload = self.builder.alive(self.generated_date());
            self.enqueue(payload);
        }

        self.close_windows(now);

        let outcome = self.buffer.try_flush(self.transport.as_ref());
        match &outcome {
            FlushOutcome::Sent => debug!("Published, {} queued", self.buffer.len()),
            FlushOutcome::Failed(err) => warn!("Publish failed ({}), {} queued", err, self.buffer.len()),
            FlushOutcome::Empty | FlushOutcome::Offline => {}
        }
        outcome
    }

    /// [`start`](Self::start), then tick forever
    pub async fn run(mut self) {
        self.start();
        info!("Starting sensor loop with avg/min/max statistics");

        let tick = Duration::from_millis(MAIN_LOOP_TICK_MS);
        loop {
            self.tick().await;
            tokio::time::sleep(tick).await;
        }
    }

    /// Messages waiting for the broker
    pub fn buffer(&self) -> &DeliveryBuffer {
        &self.buffer
    }

    /// Address reported in the last identity message
    pub fn ip(&self) -> &str {
        &self.ip
    }
}
