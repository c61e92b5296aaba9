//! Broker Connectivity for SensorBox Agents
//!
//! ## Overview
//!
//! This crate is the `std` + tokio half of the agent's delivery path. It owns
//! everything that talks to the network:
//!
//! - [`mqtt::MqttTransport`]: the rumqttc client implementing the core
//!   [`Transport`](sensorbox_core::Transport) seam, with TLS, authentication
//!   and exponential reconnect backoff
//! - [`dispatch`]: decoding of inbound control messages and routing to an
//!   [`InboundHandler`]
//! - [`probe`]: the network reachability check
//! - [`watchdog::WatchdogMonitor`]: the ping/echo liveness loop and its
//!   escalation to reconnect, probe and reboot
//!
//! ## Execution contexts
//!
//! ```text
//!  main loop ──try_flush──► MqttTransport::publish ──► request channel
//!                                                         │
//!  network task ◄── EventLoop::poll ◄─────────────────────┘
//!        │  ConnAck ──► subscribe(config, device) ──► on_connected
//!        │  Publish ──► dispatch ──► InboundHandler
//!        ▼
//!  watchdog task ──ping──► publish    silence ──► request_reconnect / probe / reboot
//! ```
//!
//! The network task is the only writer of the connection state. Everything
//! else reads it without locking.
//!
//! ## MQTT settings
//!
//! - Username/password only when a username is configured
//! - TLS requires a CA bundle; a missing one is a startup error
//! - Reconnect backoff doubles from 1 s up to 60 s, reset on every CONNACK
//! - Publishes never block: a full request queue is reported and the caller
//!   retries on its next tick
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorbox_connectors::{dispatch::ControlTopics, mqtt::{MqttConfig, MqttTransport}, InboundHandler};
//! # use serde_json::{Map, Value};
//! # struct Handler;
//! # impl InboundHandler for Handler {
//! #     fn on_config_update(&self, _update: Map<String, Value>) {}
//! #     fn on_watchdog_echo(&self, _id: u64) {}
//! #     fn on_command(&self, _cmd: Option<&str>) {}
//! # }
//!
//! # async fn run() -> Result<(), sensorbox_connectors::ConnectorError> {
//! let config = MqttConfig::new("broker.local", 8883, "sensorbox-node1")
//!     .with_credentials("node1", "secret");
//! let topics = ControlTopics {
//!     config: "sensors/config".into(),
//!     device: "node1".into(),
//! };
//!
//! let (transport, _network) = MqttTransport::connect(config, topics, Arc::new(Handler))?;
//! # let _ = transport;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod mqtt;
pub mod probe;
pub mod tls;
pub mod watchdog;

// Re-export common types
pub use dispatch::{ControlMessage, ControlTopics, DispatchError, InboundHandler};
pub use mqtt::{Backoff, MqttConfig, MqttTransport};
pub use probe::{NetworkProbe, PingProbe};
pub use tls::{TlsError, TlsSettings};
pub use watchdog::{WatchdogHandle, WatchdogMonitor};

use thiserror::Error;

/// Common connector errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Settings that cannot produce client options
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Certificates or keys could not be loaded
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    /// The network task needs a running tokio runtime
    #[error("Not inside a tokio runtime")]
    NoRuntime,
}

/// Connection statistics of the broker session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages handed to the client successfully
    pub messages_sent: u64,
    /// Publishes the client refused
    pub messages_failed: u64,
    /// Payload bytes handed to the client
    pub bytes_sent: u64,
    /// Successful connects after the first one
    pub reconnections: u32,
    /// Last connection or publish error
    pub last_error: Option<String>,
}
