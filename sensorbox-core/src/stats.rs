//! Rolling avg/min/max statistics over aggregation windows
//!
//! ## Overview
//!
//! Sensors are sampled every main-loop tick but published only once per
//! window (tens of seconds). In between, each channel keeps a running
//! `{sum, count, min, max}` accumulator, which costs four words per channel
//! no matter how many samples arrive.
//!
//! ```text
//! tick ──► read() ──► StatsAggregator::update ──► ChannelAccumulator (×channels)
//!                                                         │
//!                             window closes ──► finalize ─┴─► FinalizedStat {avg,min,max}
//! ```
//!
//! ## Absent values
//!
//! A channel that saw no samples in a window finalizes to
//! [`FinalizedStat::ABSENT`]: all three fields are `None` and serialize as
//! JSON `null`. Consumers must treat that as "no data this window"; it is
//! never coerced to zero.
//!
//! ## Unknown channels
//!
//! Sensor drivers often report extra diagnostic fields (raw ADC counts,
//! altitude, voltages). Keys that were not declared at construction are
//! skipped without error, and so are non-finite values.

use alloc::collections::BTreeMap;
use alloc::string::String;
use core::borrow::Borrow;

use crate::constants::STATS_DECIMALS;
use crate::time::{elapsed_ms, Timestamp};

/// Round to the number of decimals published in payloads
///
/// Ties go to the even neighbour, so `0.125` becomes `0.12`.
pub fn round_stat(value: f64) -> f64 {
    let factor = libm::pow(10.0, STATS_DECIMALS as f64);
    libm::rint(value * factor) / factor
}

/// Running statistics for one channel within one window
///
/// `min`/`max` start at the unbounded sentinels (+∞/−∞), so the first
/// recorded sample always replaces both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelAccumulator {
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl ChannelAccumulator {
    /// Fresh accumulator with no samples
    pub const fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Add one sample
    pub fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Number of samples recorded
    pub fn count(&self) -> u64 {
        self.count
    }

    /// True when no sample was recorded yet
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of all recorded samples
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Compute the rounded summary, or [`FinalizedStat::ABSENT`] without data
    pub fn finalize(&self) -> FinalizedStat {
        if self.count == 0 {
            return FinalizedStat::ABSENT;
        }

        FinalizedStat {
            avg: Some(round_stat(self.sum / self.count as f64)),
            min: Some(round_stat(self.min)),
            max: Some(round_stat(self.max)),
        }
    }
}

impl Default for ChannelAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one channel over one closed window
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FinalizedStat {
    /// Mean of the window, rounded to 2 decimals
    pub avg: Option<f64>,
    /// Smallest sample, rounded to 2 decimals
    pub min: Option<f64>,
    /// Largest sample, rounded to 2 decimals
    pub max: Option<f64>,
}

impl FinalizedStat {
    /// The "no data this window" summary
    pub const ABSENT: Self = Self {
        avg: None,
        min: None,
        max: None,
    };

    /// True when the window saw no samples
    pub fn is_absent(&self) -> bool {
        self.avg.is_none()
    }
}

/// Per-channel accumulators for one aggregation window
///
/// ## Example
///
/// ```rust
/// use sensorbox_core::StatsAggregator;
///
/// let mut stats = StatsAggregator::new(["x"]);
/// for value in [10.0, 20.0, 30.0] {
///     stats.update([("x", value)]);
/// }
///
/// let summary = stats.finalize()["x"];
/// assert_eq!(summary.avg, Some(20.0));
/// assert_eq!(summary.min, Some(10.0));
/// assert_eq!(summary.max, Some(30.0));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    channels: BTreeMap<String, ChannelAccumulator>,
}

impl StatsAggregator {
    /// Create accumulators for `channels`, all starting empty
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels
                .into_iter()
                .map(|name| (name.into(), ChannelAccumulator::new()))
                .collect(),
        }
    }

    /// Fold one sensor reading into the accumulators
    ///
    /// Accepts anything that iterates `(channel, value)` pairs, including
    /// `&BTreeMap<String, f64>` and arrays of `(&str, f64)`.
    pub fn update<I, K, V>(&mut self, samples: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<f64>,
    {
        for (channel, value) in samples {
            let value = *value.borrow();
            if !value.is_finite() {
                log_debug!("stats: ignoring non-finite sample for '{}'", channel.as_ref());
                continue;
            }

            if let Some(acc) = self.channels.get_mut(channel.as_ref()) {
                acc.record(value);
            }
        }
    }

    /// Summaries for every declared channel, absent ones included
    pub fn finalize(&self) -> BTreeMap<String, FinalizedStat> {
        self.channels
            .iter()
            .map(|(name, acc)| (name.clone(), acc.finalize()))
            .collect()
    }

    /// Start a new window: every accumulator back to empty
    pub fn reset(&mut self) {
        for acc in self.channels.values_mut() {
            *acc = ChannelAccumulator::new();
        }
    }

    /// Accumulator for one channel, if declared
    pub fn accumulator(&self, channel: &str) -> Option<&ChannelAccumulator> {
        self.channels.get(channel)
    }

    /// Declared channel names in sorted order
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}

/// A [`StatsAggregator`] that closes itself on a fixed interval
///
/// The first window closes on the first check, so a freshly started agent
/// publishes right away instead of waiting a full interval.
#[derive(Debug, Clone)]
pub struct StatsWindow {
    name: String,
    interval_ms: u64,
    last_close: Option<Timestamp>,
    aggregator: StatsAggregator,
}

impl StatsWindow {
    /// Create a window over `channels` that closes every `interval_ms`
    pub fn new<I, S>(name: impl Into<String>, channels: I, interval_ms: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            interval_ms,
            last_close: None,
            aggregator: StatsAggregator::new(channels),
        }
    }

    /// Window name (the sensor it aggregates)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one reading into the open window
    pub fn record<I, K, V>(&mut self, samples: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<f64>,
    {
        self.aggregator.update(samples);
    }

    /// True once the interval has elapsed since the last close
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.last_close {
            None => true,
            Some(closed_at) => elapsed_ms(closed_at, now) >= self.interval_ms,
        }
    }

    /// Finalize and restart the window if it is due
    pub fn close_if_due(&mut self, now: Timestamp) -> Option<BTreeMap<String, FinalizedStat>> {
        if !self.is_due(now) {
            return None;
        }

        let summary = self.aggregator.finalize();
        self.aggregator.reset();
        self.last_close = Some(now);
        Some(summary)
    }

    /// Read-only access to the open window
    pub fn aggregator(&self) -> &StatsAggregator {
        &self.aggregator
    }
}
