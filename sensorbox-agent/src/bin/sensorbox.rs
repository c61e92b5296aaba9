//! SensorBox agent binary
//!
//! Loads the configuration, connects to the broker, starts the watchdog and
//! runs the sampling loop until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use sensorbox_agent::config::DEFAULT_CONFIG_PATH;
use sensorbox_agent::{Agent, CommandReboot, CommandSensor, ConfigStore, ControlChannel};
use sensorbox_connectors::{ControlTopics, MqttTransport, PingProbe, WatchdogHandle, WatchdogMonitor};
use sensorbox_core::time::{MonotonicTime, SystemTime};
use sensorbox_core::{Rebooter, Transport};

/// Telemetry agent for SensorBox devices
#[derive(Parser, Debug)]
#[command(name = "sensorbox", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "SENSORBOX_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("SensorBox agent {} starting", sensorbox_agent::VERSION);

    let store = Arc::new(ConfigStore::open(&args.config));
    let settings = store
        .settings()
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;
    let node_id = settings.device.node_id.clone();

    let rebooter: Arc<dyn Rebooter> = Arc::new(CommandReboot::new(settings.reboot.command.clone()));

    let watchdog = if !settings.watchdog.enabled {
        info!("[WATCHDOG] disabled in configuration");
        None
    } else if node_id.is_empty() {
        warn!("[WATCHDOG] no device.nodeId configured, watchdog not started");
        None
    } else {
        Some(WatchdogHandle::new(settings.watchdog.policy(), Arc::new(SystemTime)))
    };

    let mut control = ControlChannel::new(store.clone(), rebooter.clone());
    if let Some(handle) = &watchdog {
        control = control.with_watchdog(handle.clone());
    }

    let topics = ControlTopics {
        config: settings.mqtt.config_topic.clone(),
        device: node_id.clone(),
    };
    let client_id = if node_id.is_empty() {
        "sensorbox".to_string()
    } else {
        format!("sensorbox-{}", node_id)
    };

    let (transport, network) = MqttTransport::connect(
        settings.mqtt.transport_config(&client_id),
        topics,
        Arc::new(control),
    )
    .context("Failed to set up MQTT transport")?;
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let monitor = watchdog.map(|handle| {
        let probe = Arc::new(PingProbe::new(settings.watchdog.ping_target.clone()));
        WatchdogMonitor::new(handle, transport.clone(), probe, rebooter.clone(), node_id.clone()).spawn()
    });

    let mut agent = Agent::new(
        settings.clone(),
        transport,
        Arc::new(MonotonicTime::new()),
        Arc::new(SystemTime),
    )
    .with_mac(sensorbox_agent::device::mac_address());

    for (name, sensor_settings) in &settings.sensors {
        match CommandSensor::from_settings(name, sensor_settings) {
            Some(sensor) => agent = agent.with_sensor(Box::new(sensor)),
            None => warn!("Sensor {} has no read command, skipped", name),
        }
    }

    tokio::select! {
        _ = agent.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    network.abort();
    Ok(())
}
