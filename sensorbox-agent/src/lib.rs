//! SensorBox Telemetry Agent
//!
//! ## Overview
//!
//! Wires the core delivery logic and the broker connectivity into a running
//! device agent:
//!
//! - [`config`]: the persisted JSON configuration, its defaults and merges
//! - [`control`]: the [`InboundHandler`](sensorbox_connectors::InboundHandler)
//!   applying remote configuration and commands
//! - [`sensors`]: sensor collaborators and calibration offsets
//! - [`payload`]: the data-topic message format
//! - [`agent`]: the 100 ms sampling and delivery loop
//! - [`device`]: IP and MAC lookup
//! - [`reboot`]: the OS restart capability
//!
//! ## Startup order
//!
//! ```text
//! ConfigStore ──► WatchdogHandle ──► ControlChannel ──► MqttTransport::connect
//!                                                            │
//!                        WatchdogMonitor ◄── transport ──────┤
//!                        Agent           ◄── transport ──────┘
//! ```
//!
//! The watchdog handle exists before the transport so the control channel can
//! forward echoes from the very first session.

pub mod agent;
pub mod config;
pub mod control;
pub mod device;
pub mod payload;
pub mod reboot;
pub mod sensors;

pub use agent::Agent;
pub use config::{AgentSettings, ConfigError, ConfigStore};
pub use control::ControlChannel;
pub use payload::PayloadBuilder;
pub use reboot::CommandReboot;
pub use sensors::{CommandSensor, Reading, Sensor, SensorError};

/// Crate version, reported in startup logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
