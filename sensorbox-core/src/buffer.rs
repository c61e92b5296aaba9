//! Bounded Outbound Buffer with Drop-Oldest Eviction
//!
//! ## Overview
//!
//! The sampling loop produces telemetry whether or not the broker is
//! reachable. [`DeliveryBuffer`] holds those messages until the transport can
//! take them, with two hard rules:
//!
//! 1. **Bounded**: the length never exceeds the configured capacity. When a
//!    push would overflow, the oldest message is evicted first. Fresh
//!    readings are worth more than a stale backlog, so this loss is a policy
//!    and never reported as an error.
//! 2. **Ordered**: exactly one publish attempt per flush, always for the
//!    head. Whatever is eventually delivered leaves in push order.
//!
//! ```text
//!   push ──►  [ m3 | m2 | m1 ]  ──► try_flush ──► Transport::publish(m1)
//!   (tail)       capacity 3        (head)          Ok  → pop m1
//!   full? evict head first                         Err → keep m1 at head
//! ```
//!
//! ## Backpressure
//!
//! While the transport reports disconnected, `try_flush` leaves the buffer
//! untouched, so it fills up to capacity and then starts dropping its oldest
//! entries. Once the session is back, the main loop drains one message per
//! tick.
//!
//! ## Threading
//!
//! The buffer is owned by the main loop, which both pushes and flushes, so
//! it carries no lock.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::errors::TransportError;
use crate::traits::{QoS, Transport};

/// One serialized payload and the topic it is bound for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    topic: String,
    payload: Vec<u8>,
}

impl OutboundMessage {
    /// Create a message; it is never mutated afterwards
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Destination topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialized payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Publish options applied to every message of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryPolicy {
    /// Requested delivery guarantee
    pub qos: QoS,
    /// Ask the broker to retain the message
    pub retain: bool,
}

/// Result of one flush attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered
    Empty,
    /// Transport not connected, buffer unchanged
    Offline,
    /// Head was accepted by the transport and removed
    Sent,
    /// Transport refused the head; it stays in place for the next tick
    Failed(TransportError),
}

/// Lifetime counters of a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Messages accepted by `push`
    pub pushed: u64,
    /// Messages handed to the transport successfully
    pub sent: u64,
    /// Messages dropped to make room
    pub evicted: u64,
    /// Publish attempts the transport refused
    pub failed_attempts: u64,
}

/// Bounded FIFO of outbound messages
#[derive(Debug, Clone)]
pub struct DeliveryBuffer {
    queue: VecDeque<OutboundMessage>,
    capacity: usize,
    policy: DeliveryPolicy,
    stats: BufferStats,
}

impl DeliveryBuffer {
    /// Create a buffer holding at most `capacity` messages
    ///
    /// A capacity of 0 is raised to 1 so the newest message always survives.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, DeliveryPolicy::default())
    }

    /// Create a buffer with explicit publish options
    pub fn with_policy(capacity: usize, policy: DeliveryPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
            stats: BufferStats::default(),
        }
    }

    /// Append a message, evicting the oldest one when full
    ///
    /// Returns the evicted message, if any.
    pub fn push(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        let evicted = if self.queue.len() >= self.capacity {
            self.stats.evicted += 1;
            self.queue.pop_front()
        } else {
            None
        };

        if evicted.is_some() {
            log_debug!("delivery buffer full ({}), dropped oldest message", self.capacity);
        }

        self.queue.push_back(message);
        self.stats.pushed += 1;
        evicted
    }

    /// Try to publish the head message
    ///
    /// At most one publish per call. The head is removed only after the
    /// transport accepted it.
    pub fn try_flush<T>(&mut self, transport: &T) -> FlushOutcome
    where
        T: Transport + ?Sized,
    {
        let Some(head) = self.queue.front() else {
            return FlushOutcome::Empty;
        };

        if !transport.is_connected() {
            return FlushOutcome::Offline;
        }

        match transport.publish(head.topic(), head.payload(), self.policy.qos, self.policy.retain) {
            Ok(()) => {
                self.queue.pop_front();
                self.stats.sent += 1;
                FlushOutcome::Sent
            }
            Err(err) => {
                self.stats.failed_attempts += 1;
                log_warn!("publish to '{}' failed, will retry: {}", head.topic(), err);
                FlushOutcome::Failed(err)
            }
        }
    }

    /// Oldest buffered message
    pub fn peek(&self) -> Option<&OutboundMessage> {
        self.queue.front()
    }

    /// Messages from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.queue.iter()
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish options in use
    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Lifetime counters
    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}

impl Default for DeliveryBuffer {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportResult;
    use crate::traits::ConnectionState;
    use alloc::format;
    use core::sync::atomic::{AtomicBool, Ordering};
    use proptest::prelude::*;
    use std::sync::Mutex;

    struct MockTransport {
        connected: AtomicBool,
        fail: AtomicBool,
        sent: Mutex<Vec<(String, Vec<u8>, QoS, bool)>>,
    }

    impl MockTransport {
        fn new(connected: bool) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                fail: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for MockTransport {
        fn state(&self) -> ConnectionState {
            if self.connected.load(Ordering::SeqCst) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }

        fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> TransportResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::QueueFull);
            }
            self.sent
                .lock()
                .unwrap()
                .push((String::from(topic), payload.to_vec(), qos, retain));
            Ok(())
        }

        fn request_reconnect(&self) {}
    }

    fn msg(n: u32) -> OutboundMessage {
        OutboundMessage::new("data", format!("m{}", n))
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut buffer = DeliveryBuffer::new(2);
        assert!(buffer.push(msg(1)).is_none());
        assert!(buffer.push(msg(2)).is_none());

        let evicted = buffer.push(msg(3)).unwrap();
        assert_eq!(evicted, msg(1));

        let kept: Vec<_> = buffer.iter().cloned().collect();
        assert_eq!(kept, [msg(2), msg(3)]);
        assert_eq!(buffer.stats().evicted, 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut buffer = DeliveryBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push(msg(1));
        buffer.push(msg(2));
        assert_eq!(buffer.peek(), Some(&msg(2)));
    }

    #[test]
    fn flush_empty_is_noop() {
        let transport = MockTransport::new(true);
        let mut buffer = DeliveryBuffer::new(4);
        assert_eq!(buffer.try_flush(&transport), FlushOutcome::Empty);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn flush_offline_leaves_buffer_untouched() {
        let transport = MockTransport::new(false);
        let mut buffer = DeliveryBuffer::new(4);
        buffer.push(msg(1));

        assert_eq!(buffer.try_flush(&transport), FlushOutcome::Offline);
        assert_eq!(buffer.len(), 1);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_publish_keeps_head() {
        let transport = MockTransport::new(true);
        transport.fail.store(true, Ordering::SeqCst);
        let mut buffer = DeliveryBuffer::new(4);
        buffer.push(msg(1));
        buffer.push(msg(2));

        assert_eq!(
            buffer.try_flush(&transport),
            FlushOutcome::Failed(TransportError::QueueFull)
        );
        assert_eq!(buffer.peek(), Some(&msg(1)));
        assert_eq!(buffer.stats().failed_attempts, 1);

        transport.fail.store(false, Ordering::SeqCst);
        assert_eq!(buffer.try_flush(&transport), FlushOutcome::Sent);
        assert_eq!(buffer.peek(), Some(&msg(2)));
    }

    #[test]
    fn flush_uses_message_topic_and_policy() {
        let transport = MockTransport::new(true);
        let policy = DeliveryPolicy {
            qos: QoS::ExactlyOnce,
            retain: true,
        };
        let mut buffer = DeliveryBuffer::with_policy(4, policy);
        buffer.push(OutboundMessage::new("site/a", "x"));

        buffer.try_flush(&transport);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0], (String::from("site/a"), b"x".to_vec(), QoS::ExactlyOnce, true));
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..16, pushes in 0u32..64) {
            let mut buffer = DeliveryBuffer::new(capacity);
            for n in 0..pushes {
                buffer.push(msg(n));
                prop_assert!(buffer.len() <= capacity);
            }

            // Exactly the newest survivors, oldest first
            let expected_start = pushes.saturating_sub(capacity as u32);
            let kept: Vec<_> = buffer.iter().cloned().collect();
            let expected: Vec<_> = (expected_start..pushes).map(msg).collect();
            prop_assert_eq!(kept, expected);
        }

        #[test]
        fn flush_removes_only_head(len in 1u32..12) {
            let transport = MockTransport::new(true);
            let mut buffer = DeliveryBuffer::new(16);
            for n in 0..len {
                buffer.push(msg(n));
            }

            prop_assert_eq!(buffer.try_flush(&transport), FlushOutcome::Sent);
            let rest: Vec<_> = buffer.iter().cloned().collect();
            let expected: Vec<_> = (1..len).map(msg).collect();
            prop_assert_eq!(rest, expected);
        }
    }
}
