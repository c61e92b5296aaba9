//! Error Types for the Delivery Path
//!
//! ## Design Philosophy
//!
//! Errors in this crate describe *transient* conditions. None of them is
//! fatal to the agent: the main loop logs them and retries on its normal
//! schedule. The taxonomy the rest of the workspace follows is:
//!
//! 1. **Transient I/O**: publish or reconnect failures, represented by
//!    [`TransportError`]. Retried next tick.
//! 2. **Malformed input**: bad JSON on a control topic. Logged and dropped
//!    by the dispatcher in `sensorbox-connectors`.
//! 3. **Configuration errors**: TLS requested without CA material. Raised at
//!    startup by the transport constructor, fatal by design.
//! 4. **Sustained failure**: no echo, no network, reconnects exhausted. Not
//!    an error value at all; the watchdog reports
//!    [`WatchdogStatus::Escalated`](crate::WatchdogStatus::Escalated) and the
//!    caller reboots.
//!
//! ## Error Handling Strategy
//!
//! ```rust
//! use sensorbox_core::{DeliveryBuffer, FlushOutcome, Transport};
//!
//! fn tick<T: Transport>(buffer: &mut DeliveryBuffer, transport: &T) {
//!     match buffer.try_flush(transport) {
//!         FlushOutcome::Sent => {}
//!         FlushOutcome::Empty | FlushOutcome::Offline => {
//!             // Nothing to do this tick
//!         }
//!         FlushOutcome::Failed(_err) => {
//!             // Head stays in place, retried next tick
//!         }
//!     }
//! }
//! ```

use alloc::string::String;
use thiserror_no_std::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-level failures, all of them retryable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No broker session is currently established
    #[error("Not connected")]
    NotConnected,

    /// The client's outgoing request queue is full
    #[error("Request queue full")]
    QueueFull,

    /// The client refused the request
    #[error("Request rejected: {reason}")]
    Rejected {
        /// Human readable reason from the client library
        reason: String,
    },

    /// The network task is gone, nothing can be sent any more
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Build a `Rejected` error from anything printable
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}
