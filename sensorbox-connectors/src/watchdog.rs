//! Watchdog monitor task
//!
//! Runs beside the main loop on its own tokio task:
//!
//! 1. publish `{"type":"watchdog","id","ts","deviceId"}` on the device topic
//! 2. sleep one interval
//! 3. if no echo arrived within the timeout: request a reconnect, probe the
//!    network, and reboot once both escalation limits are reached
//!
//! Echoes arrive on the transport's network task and reach the shared
//! [`Watchdog`] through a [`WatchdogHandle`].

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use sensorbox_core::{
    EchoCheck, QoS, Rebooter, TimeSource, Transport, Watchdog, WatchdogPolicy, WatchdogStatus,
};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::probe::NetworkProbe;

/// Cloneable access to the shared watchdog state for the echo path
#[derive(Clone)]
pub struct WatchdogHandle {
    watchdog: Arc<Watchdog>,
    clock: Arc<dyn TimeSource>,
}

impl WatchdogHandle {
    /// Fresh watchdog state with `policy`, timed by `clock`
    pub fn new(policy: WatchdogPolicy, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            watchdog: Arc::new(Watchdog::new(policy)),
            clock,
        }
    }

    /// Record an echo for ping `id`; false if stale
    pub fn record_echo(&self, id: u64) -> bool {
        self.watchdog.record_echo(id, self.clock.now())
    }

    /// Restart the echo clock after a fresh broker session
    pub fn mark_connected(&self) {
        self.watchdog.mark_connected(self.clock.now());
    }

    /// Shared state, for inspection
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }
}

/// The ping/echo loop and its escalation
pub struct WatchdogMonitor {
    handle: WatchdogHandle,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn NetworkProbe>,
    rebooter: Arc<dyn Rebooter>,
    device_id: String,
}

impl WatchdogMonitor {
    /// Wire the monitor to its collaborators
    ///
    /// `device_id` is also the device topic pings are published on.
    pub fn new(
        handle: WatchdogHandle,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn NetworkProbe>,
        rebooter: Arc<dyn Rebooter>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            transport,
            probe,
            rebooter,
            device_id: device_id.into(),
        }
    }

    /// Echo-side handle sharing this monitor's state
    pub fn handle(&self) -> WatchdogHandle {
        self.handle.clone()
    }

    fn policy(&self) -> &WatchdogPolicy {
        self.handle.watchdog.policy()
    }

    /// Allocate a ping id and publish the ping
    ///
    /// A failed publish is logged only; the missing echo will be noticed by
    /// the next evaluation.
    pub fn send_ping(&self) -> u64 {
        let now = self.handle.clock.now();
        let id = self.handle.watchdog.begin_ping(now);

        let payload = json!({
            "type": "watchdog",
            "id": id,
            "ts": now as f64 / 1000.0,
            "deviceId": self.device_id,
        });

        if let Err(err) = self.transport.publish(
            &self.device_id,
            payload.to_string().as_bytes(),
            QoS::AtLeastOnce,
            false,
        ) {
            warn!("[WATCHDOG] ping {} publish error: {}", id, err);
        }
        id
    }

    /// Run one check of the echo clock and, when silent, the recovery steps
    pub async fn evaluate(&self) -> WatchdogStatus {
        let now = self.handle.clock.now();
        let elapsed_ms = match self.handle.watchdog.check(now) {
            EchoCheck::Healthy => return WatchdogStatus::Healthy,
            EchoCheck::Silent { elapsed_ms } => elapsed_ms,
        };

        warn!(
            "[WATCHDOG] no echo for {:.1}s, checking MQTT and network",
            elapsed_ms as f64 / 1000.0
        );

        self.transport.request_reconnect();
        let attempts = self.handle.watchdog.record_reconnect_attempt();
        info!("[WATCHDOG] reconnect attempt {}", attempts);

        let reachable = self.probe.is_reachable().await;
        let status = self.handle.watchdog.assess_network(now, reachable);

        match status {
            WatchdogStatus::Recovering { .. } => {
                info!("[NET] network OK, likely a broker/topic issue, not rebooting")
            }
            WatchdogStatus::NetworkSuspect { bad_for_ms: 0, .. } => {
                warn!("[NET] network appears down, starting outage timer")
            }
            WatchdogStatus::NetworkSuspect { bad_for_ms, .. } => {
                warn!("[NET] network down for {:.1}s", bad_for_ms as f64 / 1000.0)
            }
            WatchdogStatus::Escalated { bad_for_ms, attempts } => error!(
                "[WATCHDOG] network down {:.1}s after {} reconnect attempts, escalating",
                bad_for_ms as f64 / 1000.0,
                attempts
            ),
            WatchdogStatus::Healthy | WatchdogStatus::Silent { .. } => {}
        }

        status
    }

    /// Loop until escalation, then reboot
    pub async fn run(self) {
        let interval = Duration::from_millis(self.policy().interval_ms);
        info!(
            "[WATCHDOG] started: interval={:?}, timeout={}s, device topic '{}'",
            interval,
            self.policy().timeout_ms / 1000,
            self.device_id
        );

        loop {
            self.send_ping();
            tokio::time::sleep(interval).await;

            if let WatchdogStatus::Escalated { bad_for_ms, attempts } = self.evaluate().await {
                let reason = format!(
                    "watchdog: network down {}s and {} reconnect attempts without echo",
                    bad_for_ms / 1000,
                    attempts
                );
                self.rebooter.reboot(&reason);
                return;
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
