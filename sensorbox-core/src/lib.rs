//! Core delivery and resilience logic for SensorBox
//!
//! Turns raw sensor samples into rolling statistics, holds outbound telemetry
//! in a bounded buffer until the broker is reachable, and tracks end-to-end
//! liveness for the watchdog that decides when a device must be restarted.
//!
//! Nothing in here touches the network or the operating system directly. The
//! transport and the reboot capability are traits ([`Transport`],
//! [`Rebooter`]) implemented by `sensorbox-connectors` and `sensorbox-agent`.
//!
//! Key constraints:
//! - Builds for `no_std` + `alloc` (the `std` feature adds the locked watchdog
//!   handle, wall clocks and logging)
//! - No blocking calls: every operation finishes within one main-loop tick
//! - Data loss under sustained backpressure is a policy, never an error
//!
//! ```no_run
//! use sensorbox_core::{DeliveryBuffer, OutboundMessage, StatsAggregator};
//!
//! let mut stats = StatsAggregator::new(["temperature", "humidity"]);
//! stats.update([("temperature", 21.5), ("humidity", 40.0)]);
//!
//! let finalized = stats.finalize();
//! let mut buffer = DeliveryBuffer::new(1000);
//! buffer.push(OutboundMessage::new("sensors/data", format!("{:?}", finalized)));
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod buffer;
pub mod constants;
pub mod errors;
pub mod stats;
pub mod time;
pub mod traits;
pub mod watchdog;

// Public API
pub use buffer::{BufferStats, DeliveryBuffer, DeliveryPolicy, FlushOutcome, OutboundMessage};
pub use errors::{TransportError, TransportResult};
pub use stats::{ChannelAccumulator, FinalizedStat, StatsAggregator, StatsWindow};
pub use time::{FixedTime, TimeSource, Timestamp};
pub use traits::{AtomicConnectionState, ConnectionState, QoS, Rebooter, Transport};
pub use watchdog::{EchoCheck, WatchdogPolicy, WatchdogState, WatchdogStatus};

#[cfg(feature = "std")]
pub use watchdog::Watchdog;

/// Crate version, reported in startup logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
