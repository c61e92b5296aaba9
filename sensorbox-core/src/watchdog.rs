//! End-to-End Liveness Watchdog
//!
//! ## Overview
//!
//! A TCP keep-alive only proves the socket to the broker is open. It misses
//! a broker that stops routing, or a firewall that drops one direction. The
//! watchdog closes that gap with an application-level ping: every interval a
//! ping with a fresh id is published on the device topic, and the collector
//! echoes it back on the same topic.
//!
//! ## State machine
//!
//! ```text
//!            echo within timeout
//!   ┌──────────────────────────────────────────┐
//!   ▼                                          │
//! Healthy ──timeout──► Silent ──reconnect──► Recovering
//!                                              │ probe fails
//!                                              ▼
//!                                        NetworkSuspect ──both limits──► Escalated
//!                                                                        (reboot)
//! ```
//!
//! `Escalated` requires two independent pieces of evidence at the same time:
//!
//! - the network probe has failed continuously for longer than
//!   `network_bad_reboot_delay_ms`, and
//! - at least `max_reconnect_attempts` reconnects were tried.
//!
//! A single network blip or one slow reconnect never reboots the device.
//!
//! ## Attempt counter
//!
//! `reconnect_attempts` goes back to zero only on a healthy check (an echo
//! arrived within the timeout). A probe that succeeds clears
//! `network_bad_since` but keeps the counter, so a flapping network still
//! accumulates attempts across cycles.
//!
//! ## Concurrency
//!
//! [`WatchdogState`] is a plain value. With `std`, [`Watchdog`] puts it behind
//! one mutex shared by the monitor loop and the echo handler running on the
//! transport's network task.

use crate::constants::{
    WATCHDOG_INTERVAL_SECS, WATCHDOG_MAX_RECONNECT_ATTEMPTS, WATCHDOG_NETWORK_BAD_REBOOT_DELAY_SECS,
    WATCHDOG_TIMEOUT_SECS,
};
use crate::time::{elapsed_ms, secs_to_ms, Timestamp};

/// Timing and escalation limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogPolicy {
    /// Pause between pings
    pub interval_ms: u64,
    /// Silence longer than this starts recovery
    pub timeout_ms: u64,
    /// Reconnect attempts required before a reboot
    pub max_reconnect_attempts: u32,
    /// Continuous network failure required before a reboot
    pub network_bad_reboot_delay_ms: u64,
}

impl WatchdogPolicy {
    /// Build a policy from values in seconds, as stored in configuration
    pub const fn from_secs(
        interval: u64,
        timeout: u64,
        max_reconnect_attempts: u32,
        network_bad_reboot_delay: u64,
    ) -> Self {
        Self {
            interval_ms: secs_to_ms(interval),
            timeout_ms: secs_to_ms(timeout),
            max_reconnect_attempts,
            network_bad_reboot_delay_ms: secs_to_ms(network_bad_reboot_delay),
        }
    }
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self::from_secs(
            WATCHDOG_INTERVAL_SECS,
            WATCHDOG_TIMEOUT_SECS,
            WATCHDOG_MAX_RECONNECT_ATTEMPTS,
            WATCHDOG_NETWORK_BAD_REBOOT_DELAY_SECS,
        )
    }
}

/// Outcome of comparing the echo clock against the timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoCheck {
    /// Echo seen within the timeout; counters were reset
    Healthy,
    /// No echo for longer than the timeout
    Silent {
        /// Time since the last echo
        elapsed_ms: u64,
    },
}

/// Where the escalation stands after one monitor iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// Echoes arrive on time
    Healthy,
    /// Echoes stopped, recovery not started yet
    Silent {
        /// Time since the last echo
        elapsed_ms: u64,
    },
    /// Reconnect requested, network reachable: broker-side fault
    Recovering {
        /// Reconnects tried so far
        attempts: u32,
    },
    /// Reconnect requested and the network probe failed
    NetworkSuspect {
        /// How long the probe has been failing
        bad_for_ms: u64,
        /// Reconnects tried so far
        attempts: u32,
    },
    /// Both limits exceeded: the device must reboot
    Escalated {
        /// How long the probe has been failing
        bad_for_ms: u64,
        /// Reconnects tried so far
        attempts: u32,
    },
}

impl WatchdogStatus {
    /// True for the terminal state
    pub fn is_escalated(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }
}

/// Shared watchdog bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogState {
    last_echo: Option<Timestamp>,
    last_ping_id: Option<u64>,
    network_bad_since: Option<Timestamp>,
    reconnect_attempts: u32,
}

impl WatchdogState {
    /// Fresh state: no ping sent, no echo seen
    pub const fn new() -> Self {
        Self {
            last_echo: None,
            last_ping_id: None,
            network_bad_since: None,
            reconnect_attempts: 0,
        }
    }

    /// Allocate the id of the next ping and remember it
    ///
    /// Ids are derived from `now` and forced strictly increasing, so two
    /// pings in the same millisecond still differ. The echo clock starts at
    /// the first ping.
    pub fn begin_ping(&mut self, now: Timestamp) -> u64 {
        let id = match self.last_ping_id {
            Some(previous) if now <= previous => previous + 1,
            _ => now,
        };

        self.last_ping_id = Some(id);
        if self.last_echo.is_none() {
            self.last_echo = Some(now);
        }
        id
    }

    /// Record an echo; only the most recent ping id counts
    pub fn record_echo(&mut self, id: u64, now: Timestamp) -> bool {
        if self.last_ping_id != Some(id) {
            return false;
        }

        self.last_echo = Some(now);
        true
    }

    /// A fresh broker session restarts the echo clock
    pub fn mark_connected(&mut self, now: Timestamp) {
        self.last_echo = Some(now);
    }

    /// Compare the time since the last echo with the timeout
    pub fn check(&mut self, now: Timestamp, policy: &WatchdogPolicy) -> EchoCheck {
        let elapsed = self.last_echo.map_or(0, |echo| elapsed_ms(echo, now));

        if elapsed <= policy.timeout_ms {
            self.reconnect_attempts = 0;
            self.network_bad_since = None;
            return EchoCheck::Healthy;
        }

        EchoCheck::Silent { elapsed_ms: elapsed }
    }

    /// Count one reconnect request, returns the new total
    pub fn record_reconnect_attempt(&mut self) -> u32 {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.reconnect_attempts
    }

    /// Fold a network probe result into the escalation decision
    pub fn assess_network(
        &mut self,
        now: Timestamp,
        reachable: bool,
        policy: &WatchdogPolicy,
    ) -> WatchdogStatus {
        let attempts = self.reconnect_attempts;

        if reachable {
            self.network_bad_since = None;
            return WatchdogStatus::Recovering { attempts };
        }

        let since = *self.network_bad_since.get_or_insert(now);
        let bad_for_ms = elapsed_ms(since, now);

        if bad_for_ms > policy.network_bad_reboot_delay_ms && attempts >= policy.max_reconnect_attempts {
            WatchdogStatus::Escalated { bad_for_ms, attempts }
        } else {
            WatchdogStatus::NetworkSuspect { bad_for_ms, attempts }
        }
    }

    /// Time of the last accepted echo
    pub fn last_echo(&self) -> Option<Timestamp> {
        self.last_echo
    }

    /// Id of the most recent ping
    pub fn last_ping_id(&self) -> Option<u64> {
        self.last_ping_id
    }

    /// Start of the current network outage
    pub fn network_bad_since(&self) -> Option<Timestamp> {
        self.network_bad_since
    }

    /// Reconnects requested since the last healthy check
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }
}

/// [`WatchdogState`] behind a mutex, shared across threads
///
/// Every method takes the lock for its whole duration and never holds it
/// across I/O. A poisoned lock is recovered, the state stays usable.
#[cfg(feature = "std")]
#[derive(Debug, Default)]
pub struct Watchdog {
    policy: WatchdogPolicy,
    state: std::sync::Mutex<WatchdogState>,
}

#[cfg(feature = "std")]
impl Watchdog {
    /// New watchdog with `policy`
    pub fn new(policy: WatchdogPolicy) -> Self {
        Self {
            policy,
            state: std::sync::Mutex::new(WatchdogState::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchdogState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Limits in use
    pub fn policy(&self) -> &WatchdogPolicy {
        &self.policy
    }

    /// See [`WatchdogState::begin_ping`]
    pub fn begin_ping(&self, now: Timestamp) -> u64 {
        self.lock().begin_ping(now)
    }

    /// See [`WatchdogState::record_echo`]
    pub fn record_echo(&self, id: u64, now: Timestamp) -> bool {
        let accepted = self.lock().record_echo(id, now);
        if !accepted {
            log_debug!("watchdog: ignoring stale echo id {}", id);
        }
        accepted
    }

    /// See [`WatchdogState::mark_connected`]
    pub fn mark_connected(&self, now: Timestamp) {
        self.lock().mark_connected(now);
    }

    /// See [`WatchdogState::check`]
    pub fn check(&self, now: Timestamp) -> EchoCheck {
        self.lock().check(now, &self.policy)
    }

    /// See [`WatchdogState::record_reconnect_attempt`]
    pub fn record_reconnect_attempt(&self) -> u32 {
        self.lock().record_reconnect_attempt()
    }

    /// See [`WatchdogState::assess_network`]
    pub fn assess_network(&self, now: Timestamp, reachable: bool) -> WatchdogStatus {
        self.lock().assess_network(now, reachable, &self.policy)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> WatchdogState {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1000;

    fn policy() -> WatchdogPolicy {
        WatchdogPolicy::from_secs(30, 90, 3, 300)
    }

    #[test]
    fn ping_ids_strictly_increase() {
        let mut state = WatchdogState::new();
        let a = state.begin_ping(1_000);
        let b = state.begin_ping(1_000);
        let c = state.begin_ping(500);
        let d = state.begin_ping(5_000);
        assert!(a < b && b < c && c < d);
        assert_eq!(d, 5_000);
    }

    #[test]
    fn mismatched_echo_is_ignored() {
        let mut state = WatchdogState::new();
        let id = state.begin_ping(0);

        assert!(!state.record_echo(id + 1, 50 * SEC));
        assert_eq!(state.last_echo(), Some(0));

        assert!(state.record_echo(id, 60 * SEC));
        assert_eq!(state.last_echo(), Some(60 * SEC));
    }

    #[test]
    fn echo_for_older_ping_is_stale() {
        let mut state = WatchdogState::new();
        let first = state.begin_ping(0);
        state.begin_ping(30 * SEC);
        assert!(!state.record_echo(first, 31 * SEC));
    }

    #[test]
    fn silent_after_timeout_without_echo() {
        let p = policy();
        let mut state = WatchdogState::new();
        state.begin_ping(0);

        assert_eq!(state.check(90 * SEC, &p), EchoCheck::Healthy);
        assert_eq!(
            state.check(91 * SEC, &p),
            EchoCheck::Silent {
                elapsed_ms: 91 * SEC
            }
        );
    }

    #[test]
    fn healthy_check_resets_counters() {
        let p = policy();
        let mut state = WatchdogState::new();
        let id = state.begin_ping(0);
        state.record_reconnect_attempt();
        state.assess_network(100 * SEC, false, &p);

        state.record_echo(id, 200 * SEC);
        assert_eq!(state.check(210 * SEC, &p), EchoCheck::Healthy);
        assert_eq!(state.reconnect_attempts(), 0);
        assert_eq!(state.network_bad_since(), None);
    }

    #[test]
    fn bad_network_with_few_attempts_does_not_escalate() {
        let p = policy();
        let mut state = WatchdogState::new();
        state.begin_ping(0);
        state.record_reconnect_attempt();

        state.assess_network(100 * SEC, false, &p);
        let status = state.assess_network(500 * SEC, false, &p);
        assert_eq!(
            status,
            WatchdogStatus::NetworkSuspect {
                bad_for_ms: 400 * SEC,
                attempts: 1
            }
        );
    }

    #[test]
    fn escalates_only_when_both_limits_hit() {
        let p = policy();
        let mut state = WatchdogState::new();
        for _ in 0..3 {
            state.record_reconnect_attempt();
        }

        state.assess_network(0, false, &p);
        assert!(!state.assess_network(300 * SEC, false, &p).is_escalated());
        assert_eq!(
            state.assess_network(301 * SEC, false, &p),
            WatchdogStatus::Escalated {
                bad_for_ms: 301 * SEC,
                attempts: 3
            }
        );
    }

    #[test]
    fn reachable_probe_clears_outage_but_keeps_attempts() {
        let p = policy();
        let mut state = WatchdogState::new();
        state.record_reconnect_attempt();
        state.record_reconnect_attempt();
        state.assess_network(0, false, &p);

        assert_eq!(
            state.assess_network(10 * SEC, true, &p),
            WatchdogStatus::Recovering { attempts: 2 }
        );
        assert_eq!(state.network_bad_since(), None);
        assert_eq!(state.reconnect_attempts(), 2);

        // Outage clock restarts from the next failure
        let status = state.assess_network(400 * SEC, false, &p);
        assert_eq!(
            status,
            WatchdogStatus::NetworkSuspect {
                bad_for_ms: 0,
                attempts: 2
            }
        );
    }

    #[test]
    fn reconnect_restarts_echo_clock() {
        let p = policy();
        let mut state = WatchdogState::new();
        state.begin_ping(0);
        state.mark_connected(100 * SEC);
        assert_eq!(state.check(150 * SEC, &p), EchoCheck::Healthy);
    }

    #[cfg(feature = "std")]
    #[test]
    fn shared_watchdog_records_echo_from_other_thread() {
        use std::sync::Arc;

        let watchdog = Arc::new(Watchdog::new(policy()));
        let id = watchdog.begin_ping(0);

        let handle = {
            let watchdog = Arc::clone(&watchdog);
            std::thread::spawn(move || watchdog.record_echo(id, 80 * SEC))
        };
        assert!(handle.join().unwrap());

        assert_eq!(watchdog.check(160 * SEC), EchoCheck::Healthy);
        assert_eq!(watchdog.snapshot().last_echo(), Some(80 * SEC));
    }
}
