//! Default timings and sizes for the delivery and watchdog subsystems
//!
//! Every value here is a fallback for a configuration key; deployments
//! override them through the persisted configuration document.

// ===== DELIVERY =====

/// Default DeliveryBuffer capacity (messages).
///
/// At the default window lengths a device produces roughly 700 messages an
/// hour, so 1000 entries ride out a bit more than an hour of broker outage
/// before the oldest readings are evicted.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Main loop tick in milliseconds.
///
/// One flush attempt happens per tick, so this bounds drain throughput at
/// 10 messages/second after a reconnect.
pub const MAIN_LOOP_TICK_MS: u64 = 100;

/// Decimal places kept in finalized statistics.
pub const STATS_DECIMALS: i32 = 2;

// ===== TRANSPORT =====

/// Lower bound of the reconnect backoff (seconds).
pub const RECONNECT_MIN_DELAY_SECS: u64 = 1;

/// Upper bound of the reconnect backoff (seconds).
pub const RECONNECT_MAX_DELAY_SECS: u64 = 60;

/// MQTT keep-alive (seconds).
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

// ===== WATCHDOG =====

/// Seconds between watchdog pings.
pub const WATCHDOG_INTERVAL_SECS: u64 = 30;

/// Seconds without an echo before the link is considered silent.
///
/// Three ping intervals: a single lost echo never trips recovery.
pub const WATCHDOG_TIMEOUT_SECS: u64 = 90;

/// Reconnect attempts required before a reboot may happen.
pub const WATCHDOG_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Seconds the network probe must keep failing before a reboot may happen.
pub const WATCHDOG_NETWORK_BAD_REBOOT_DELAY_SECS: u64 = 300;

/// Default reachability probe target (typical home/office gateway).
pub const WATCHDOG_DEFAULT_PING_TARGET: &str = "192.168.1.1";
