//! Network reachability probe used by the watchdog

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

/// Answers "is the local network up?"
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// True if the probe target answered
    async fn is_reachable(&self) -> bool;
}

/// One ICMP echo through the system `ping` binary
///
/// Runs `ping -c 1 -W 2 <target>`. A spawn failure or a hung process counts
/// as unreachable.
#[derive(Debug, Clone)]
pub struct PingProbe {
    target: String,
    timeout: Duration,
}

impl PingProbe {
    /// Probe `target` (host name or address)
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Upper bound on the whole probe, including process start
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe target
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl NetworkProbe for PingProbe {
    async fn is_reachable(&self) -> bool {
        let mut command = Command::new("ping");
        command
            .args(["-c", "1", "-W", "2", self.target.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) => {
                debug!("ping {} -> {}", self.target, status);
                status.success()
            }
            Ok(Err(err)) => {
                warn!("ping {} could not run: {}", self.target, err);
                false
            }
            Err(_) => {
                warn!("ping {} timed out after {:?}", self.target, self.timeout);
                false
            }
        }
    }
}
