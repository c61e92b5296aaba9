//! MQTT Transport built on rumqttc
//!
//! ## Overview
//!
//! [`MqttTransport`] wraps a rumqttc [`AsyncClient`] and a background tokio
//! task that drives the client's [`EventLoop`]. The task is the single
//! writer of the connection state and the only place inbound messages are
//! decoded.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected ──poll──► Connecting ──CONNACK──► Connected
//!      ▲                     │                      │
//!      └──── error: sleep backoff ◄─────────────────┘
//!      └──── request_reconnect: drop session ◄──────┘
//! ```
//!
//! On every CONNACK the task subscribes to the configuration topic and the
//! device topic, then calls [`InboundHandler::on_connected`]. Subscriptions
//! are re-issued each time because the session is clean.
//!
//! ## Backoff
//!
//! Failed connection attempts wait `min_delay`, then double each time up to
//! `max_delay`. A successful CONNACK resets the sequence.
//!
//! ## Publishing
//!
//! `publish` uses `try_publish` on the client's bounded request channel, so
//! it returns immediately. `Ok` means queued, not acknowledged; the QoS level
//! decides what the broker guarantees afterwards.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, TlsConfiguration};
use sensorbox_core::constants::{
    DEFAULT_KEEP_ALIVE_SECS, RECONNECT_MAX_DELAY_SECS, RECONNECT_MIN_DELAY_SECS,
};
use sensorbox_core::{
    AtomicConnectionState, ConnectionState, QoS, Transport, TransportError, TransportResult,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::dispatch::{dispatch, ControlTopics, InboundHandler};
use crate::tls::TlsSettings;
use crate::{ConnectionStats, ConnectorError};

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// Username; empty disables authentication
    pub username: String,
    /// Password, only sent with a username
    pub password: String,
    /// TLS material, `None` for plain TCP
    pub tls: Option<TlsSettings>,
    /// MQTT keep-alive
    pub keep_alive: Duration,
    /// QoS used for control subscriptions
    pub subscribe_qos: QoS,
    /// First reconnect delay
    pub reconnect_min_delay: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max_delay: Duration,
    /// Capacity of the client's request channel
    pub request_capacity: usize,
}

impl MqttConfig {
    /// Plain TCP configuration with default timings
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: String::new(),
            password: String::new(),
            tls: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            subscribe_qos: QoS::AtLeastOnce,
            reconnect_min_delay: Duration::from_secs(RECONNECT_MIN_DELAY_SECS),
            reconnect_max_delay: Duration::from_secs(RECONNECT_MAX_DELAY_SECS),
            request_capacity: 64,
        }
    }

    /// Authenticate with username and password
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Enable TLS
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Override the keep-alive interval
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Override the reconnect backoff bounds
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min_delay = min;
        self.reconnect_max_delay = max;
        self
    }

    /// Multi-line summary for the startup log, secrets masked
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Host/Port:       {}:{}", self.host, self.port),
            format!("Client id:       {}", self.client_id),
            format!(
                "Username:        {}",
                if self.username.is_empty() { "<empty>" } else { self.username.as_str() }
            ),
            format!("Password (mask): {}", mask_secret(&self.password)),
            format!("Use TLS:         {}", self.tls.is_some()),
        ];

        if let Some(tls) = &self.tls {
            lines.push(format!("CA file:         {}", describe_file(tls.ca_cert.as_deref())));
            lines.push(format!("Client cert:     {}", describe_file(tls.client_cert.as_deref())));
            lines.push(format!("Client key:      {}", describe_file(tls.client_key.as_deref())));
            lines.push(format!("Insecure TLS:    {}", tls.insecure));
        }

        lines.push(format!("Keepalive:       {}s", self.keep_alive.as_secs()));
        lines.join("\n")
    }

    fn mqtt_options(&self) -> Result<MqttOptions, ConnectorError> {
        if self.host.is_empty() {
            return Err(ConnectorError::ConfigError("mqtt host is empty".into()));
        }
        if self.reconnect_min_delay > self.reconnect_max_delay {
            return Err(ConnectorError::ConfigError(format!(
                "reconnect_min_delay {:?} exceeds reconnect_max_delay {:?}",
                self.reconnect_min_delay, self.reconnect_max_delay
            )));
        }

        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(5)));
        options.set_clean_session(true);

        if !self.username.is_empty() {
            options.set_credentials(&self.username, &self.password);
        }

        if let Some(tls) = &self.tls {
            let client_config = tls.build_client_config()?;
            options.set_transport(rumqttc::Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        Ok(options)
    }
}

/// Mask all but the first and last character; short secrets fully
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    match chars.len() {
        0 => "<empty>".to_string(),
        n if n <= 4 => "*".repeat(n),
        n => format!("{}{}{}", chars[0], "*".repeat(n - 2), chars[n - 1]),
    }
}

fn describe_file(path: Option<&Path>) -> String {
    match path {
        None => "n/a".to_string(),
        Some(path) => match std::fs::metadata(path) {
            Ok(meta) => format!("{} (ok, size={}B)", path.display(), meta.len()),
            Err(err) => format!("{} (missing/err: {})", path.display(), err),
        },
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    /// Delays start at `min` and never exceed `max`
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Back to `min` after a successful connect
    pub fn reset(&mut self) {
        self.current = None;
    }
}

struct Shared {
    state: AtomicConnectionState,
    reconnect: Notify,
    stats: Mutex<ConnectionStats>,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// MQTT implementation of the core [`Transport`]
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
}

impl MqttTransport {
    /// Validate `config`, create the client and spawn the network task
    ///
    /// Must be called inside a tokio runtime. Configuration and TLS errors
    /// are returned here; connection failures are not, they are retried in
    /// the background.
    pub fn connect(
        config: MqttConfig,
        topics: ControlTopics,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(Self, JoinHandle<()>), ConnectorError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConnectorError::NoRuntime)?;

        info!("MQTT configuration:\n{}", config.summary());
        let options = config.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));

        let shared = Arc::new(Shared {
            state: AtomicConnectionState::default(),
            reconnect: Notify::new(),
            stats: Mutex::new(ConnectionStats::default()),
        });

        let network = NetworkTask {
            eventloop,
            client: client.clone(),
            shared: Arc::clone(&shared),
            topics,
            handler,
            backoff: Backoff::new(config.reconnect_min_delay, config.reconnect_max_delay),
            subscribe_qos: to_mqtt_qos(config.subscribe_qos),
        };

        info!("MQTT connecting (async) to {}:{}", config.host, config.port);
        let task = runtime.spawn(network.run());

        Ok((Self { client, shared }, task))
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats().clone()
    }
}

impl Transport for MqttTransport {
    fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> TransportResult<()> {
        let result = self
            .client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload.to_vec());

        let mut stats = self.shared.stats();
        match result {
            Ok(()) => {
                stats.messages_sent += 1;
                stats.bytes_sent += payload.len() as u64;
                debug!("queued {} bytes for '{}' ({:?}, retain={})", payload.len(), topic, qos, retain);
                Ok(())
            }
            Err(err) => {
                stats.messages_failed += 1;
                stats.last_error = Some(err.to_string());
                Err(match err {
                    ClientError::TryRequest(_) => TransportError::QueueFull,
                    ClientError::Request(_) => TransportError::Closed,
                })
            }
        }
    }

    fn request_reconnect(&self) {
        info!("MQTT reconnect requested");
        self.shared.reconnect.notify_one();
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

struct NetworkTask {
    eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    topics: ControlTopics,
    handler: Arc<dyn InboundHandler>,
    backoff: Backoff,
    subscribe_qos: rumqttc::QoS,
}

impl NetworkTask {
    async fn run(mut self) {
        let mut connected_once = false;

        loop {
            if self.shared.state.load() == ConnectionState::Disconnected {
                self.shared.state.swap(ConnectionState::Connecting);
            }

            tokio::select! {
                biased;

                _ = self.shared.reconnect.notified() => {
                    self.shared.state.swap(ConnectionState::Disconnected);
                    self.eventloop.clean();
                    info!("MQTT session dropped, reconnecting");
                }

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        self.shared.state.swap(ConnectionState::Connected);
                        self.backoff.reset();
                        if connected_once {
                            self.shared.stats().reconnections += 1;
                        }
                        connected_once = true;
                        info!("MQTT connected (session_present={})", ack.session_present);

                        self.subscribe();
                        self.handler.on_connected();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(self.handler.as_ref(), &self.topics, &publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        self.shared.state.swap(ConnectionState::Disconnected);
                        warn!("MQTT broker sent DISCONNECT");
                    }
                    Ok(_) => {}
                    Err(rumqttc::ConnectionError::RequestsDone) => {
                        self.shared.state.swap(ConnectionState::Disconnected);
                        info!("MQTT client dropped, network task exiting");
                        return;
                    }
                    Err(err) => {
                        self.shared.state.swap(ConnectionState::Disconnected);
                        self.shared.stats().last_error = Some(err.to_string());

                        let delay = self.backoff.next_delay();
                        warn!("MQTT connection error: {} (retrying in {:?})", err, delay);
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }

    fn subscribe(&self) {
        subscribe_control(&self.topics, |topic| self.client.try_subscribe(topic, self.subscribe_qos));
    }
}

/// Issue one subscription per non-empty control topic
///
/// Returns how many were queued; a failed topic does not stop the others.
fn subscribe_control<E, F>(topics: &ControlTopics, mut subscribe: F) -> usize
where
    E: fmt::Display,
    F: FnMut(&str) -> Result<(), E>,
{
    let mut queued = 0;
    for topic in topics.subscriptions() {
        match subscribe(topic) {
            Ok(()) => {
                queued += 1;
                info!("MQTT subscribed to '{}'", topic);
            }
            Err(err) => warn!("MQTT subscribe to '{}' failed: {}", topic, err),
        }
    }
    queued
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret(""), "<empty>");
        assert_eq!(mask_secret("abc"), "***");
        assert_eq!(mask_secret("hunter22"), "h******2");
    }

    #[test]
    fn summary_never_contains_password() {
        let config = MqttConfig::new("broker", 8883, "id").with_credentials("user", "supersecret");
        let summary = config.summary();
        assert!(summary.contains("user"));
        assert!(summary.contains("s*********t"));
        assert!(!summary.contains("supersecret"));
    }

    #[test]
    fn tls_without_ca_fails_at_construction() {
        let config = MqttConfig::new("broker", 8883, "id").with_tls(TlsSettings::default());
        assert!(matches!(
            config.mqtt_options(),
            Err(ConnectorError::Tls(crate::tls::TlsError::MissingCa))
        ));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = MqttConfig::new("broker", 1883, "id")
            .with_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(matches!(config.mqtt_options(), Err(ConnectorError::ConfigError(_))));
    }

    #[test]
    fn connect_outside_runtime_is_an_error() {
        struct Noop;
        impl InboundHandler for Noop {
            fn on_config_update(&self, _update: serde_json::Map<String, serde_json::Value>) {}
            fn on_watchdog_echo(&self, _id: u64) {}
            fn on_command(&self, _cmd: Option<&str>) {}
        }

        let topics = ControlTopics {
            config: "cfg".into(),
            device: "node1".into(),
        };
        let result = MqttTransport::connect(MqttConfig::new("broker", 1883, "id"), topics, Arc::new(Noop));
        assert!(matches!(result, Err(ConnectorError::NoRuntime)));
    }

    #[tokio::test]
    async fn starts_disconnected_and_publish_queues() {
        struct Noop;
        impl InboundHandler for Noop {
            fn on_config_update(&self, _update: serde_json::Map<String, serde_json::Value>) {}
            fn on_watchdog_echo(&self, _id: u64) {}
            fn on_command(&self, _cmd: Option<&str>) {}
        }

        let topics = ControlTopics {
            config: "cfg".into(),
            device: "node1".into(),
        };
        // Nothing listens on port 1 of localhost
        let config = MqttConfig::new("127.0.0.1", 1, "test-client");
        let (transport, task) = MqttTransport::connect(config, topics, Arc::new(Noop)).unwrap();

        assert!(!transport.is_connected());
        assert!(transport.publish("data", b"hello", QoS::AtLeastOnce, false).is_ok());
        assert_eq!(transport.stats().messages_sent, 1);
        assert_eq!(transport.stats().bytes_sent, 5);

        task.abort();
    }

    #[test]
    fn connack_subscribes_config_then_device_topic() {
        let topics = ControlTopics {
            config: "plant/config".into(),
            device: "node1".into(),
        };
        let mut seen = Vec::new();
        let queued = subscribe_control(&topics, |topic| {
            seen.push(topic.to_string());
            Ok::<_, String>(())
        });

        assert_eq!(queued, 2);
        assert_eq!(seen, ["plant/config", "node1"]);
    }

    #[test]
    fn connack_skips_empty_topics_and_survives_failures() {
        let topics = ControlTopics {
            config: "plant/config".into(),
            device: String::new(),
        };
        let mut seen = Vec::new();
        let queued = subscribe_control(&topics, |topic| {
            seen.push(topic.to_string());
            Err("request queue full")
        });

        assert_eq!(queued, 0);
        assert_eq!(seen, ["plant/config"]);
    }

    #[test]
    fn connack_subscriptions_reach_the_client_queue() {
        let topics = ControlTopics {
            config: "cfg".into(),
            device: "node1".into(),
        };
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("id", "localhost", 1883), 10);

        let queued = subscribe_control(&topics, |topic| client.try_subscribe(topic, rumqttc::QoS::AtLeastOnce));
        assert_eq!(queued, 2);
    }
}
