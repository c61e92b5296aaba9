//! Seams between the core and the outside world
//!
//! The core never opens sockets or spawns processes. It talks to the broker
//! through [`Transport`] and restarts the device through [`Rebooter`]; both
//! are implemented by the std crates and by test doubles.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::errors::TransportResult;

/// Delivery guarantee requested for one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged, may duplicate
    #[default]
    AtLeastOnce,
    /// Four-way handshake
    ExactlyOnce,
}

impl QoS {
    /// Map an MQTT level (0, 1, 2) to a QoS
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    /// Numeric MQTT level
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Broker session state as seen by the network task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No session, no attempt in progress
    Disconnected = 0,
    /// TCP/TLS/CONNECT handshake in progress
    Connecting = 1,
    /// CONNACK received
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Lock-free cell for [`ConnectionState`]
///
/// Written only by the network task, read from anywhere. Readers may see a
/// value one scheduling quantum stale.
#[derive(Debug)]
pub struct AtomicConnectionState {
    raw: AtomicU8,
}

impl AtomicConnectionState {
    /// New cell starting at `state`
    pub const fn new(state: ConnectionState) -> Self {
        Self {
            raw: AtomicU8::new(state as u8),
        }
    }

    /// Current state
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Replace the state, returning the previous one
    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.raw.swap(state as u8, Ordering::AcqRel))
    }

    /// Shorthand for `load() == Connected`
    pub fn is_connected(&self) -> bool {
        self.load() == ConnectionState::Connected
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

/// Publish/subscribe transport to the collector
///
/// All methods are non-blocking. `publish` returning `Ok` means the message
/// was queued locally, not that the broker acknowledged it.
pub trait Transport: Send + Sync {
    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// True while a broker session is established
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue one message for delivery
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> TransportResult<()>;

    /// Drop the current session and reconnect as soon as possible
    fn request_reconnect(&self);
}

/// OS-level restart capability
///
/// Fire-and-forget: callers must not rely on `reboot` returning.
pub trait Rebooter: Send + Sync {
    /// Restart the device, `reason` ends up in the logs
    fn reboot(&self, reason: &str);
}
