//! Synthetic RED queue with Westwood+ style bandwidth estimation.
//!
//! Decides whether a chunk of participating traffic may be forwarded. The queue is
//! never materialised: accepted bytes are assumed to drain at the nominal bandwidth,
//! and the resulting occupancy is tracked as an EWMA. Between the two thresholds
//! traffic is dropped with a small, size-weighted probability (RED); above the upper
//! threshold everything offered with a positive factor is dropped.
//!
//! The accepted byte rate is estimated separately, Westwood+ style, sampled at most
//! once per 50 ms round.

use std::fmt;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::errors::ConfigurationError;
use crate::util::time_source::{RealTime, TimeSource};

/// Upper bound for the base RED drop probability.
pub const MAX_DROP_PROBABILITY: f64 = 0.0002;

/// Length of one estimation round. Aging happens at most once per round.
pub const ROUND_MS: u64 = 50;

const DECAY_FACTOR: f64 = 8.0;

/// An idle gap is decayed in per-round steps, up to this many.
const MAX_DECAY_ROUNDS: u64 = 16;

const MAX_ADJUSTED_PROBABILITY: f64 = 0.99;

const DEFAULT_MIN_THRESHOLD_DIV: u64 = 4;
const DEFAULT_MAX_THRESHOLD_DIV: u64 = 2;

/// EWMA keeping 7/8 of the old value.
fn westwood_filter(old: f64, new: f64) -> f64 {
    ((DECAY_FACTOR - 1.0) * old + new) / DECAY_FACTOR
}

/// How many whole rounds of an idle gap get decayed one by one.
fn decay_rounds(delta_ms: u64) -> u64 {
    if delta_ms > 2 * ROUND_MS {
        (delta_ms / ROUND_MS - 1).min(MAX_DECAY_ROUNDS)
    } else {
        0
    }
}

/// Default RED thresholds for a nominal bandwidth in bytes/s: a quarter and half a
/// second worth of traffic.
pub fn default_thresholds(bandwidth_bps: u64) -> (u64, u64) {
    (
        (bandwidth_bps / DEFAULT_MIN_THRESHOLD_DIV).max(1),
        (bandwidth_bps / DEFAULT_MAX_THRESHOLD_DIV).max(1),
    )
}

struct RedState {
    /// Smoothed bandwidth estimate, bytes/ms.
    bandwidth_filtered: f64,
    /// Bandwidth samples before the second smoothing pass, bytes/ms.
    bandwidth_raw: f64,
    /// Bytes accepted since the last bandwidth sample. `None` until the first sample.
    bytes_acked: Option<u64>,
    last_ack_ms: u64,
    avg_queue: f64,
    queue_estimate: f64,
    /// Bytes accepted since the last queue update.
    new_data: u64,
    last_queue_update_ms: u64,
    /// Accepted offers since the last drop, -1 right after a random survival.
    drop_count: i32,
    rng: SmallRng,
}

impl RedState {
    fn decay_bandwidth(&mut self) {
        self.bandwidth_raw *= (DECAY_FACTOR - 1.0) / DECAY_FACTOR;
        self.bandwidth_filtered = westwood_filter(self.bandwidth_filtered, self.bandwidth_raw);
    }

    fn decay_queue(&mut self, elapsed_ms: u64, drain_per_ms: f64) {
        self.queue_estimate -= elapsed_ms as f64 * drain_per_ms;
        if self.queue_estimate < 1.0 {
            self.queue_estimate = 0.0;
        }
        self.avg_queue = westwood_filter(self.avg_queue, self.queue_estimate);
    }

    fn update_queue(&mut self, now_ms: u64, drain_per_ms: f64) {
        let elapsed = now_ms.saturating_sub(self.last_queue_update_ms);
        let rounds = decay_rounds(elapsed);
        for _ in 0..rounds {
            if self.avg_queue <= 0.0 {
                break;
            }
            self.decay_queue(ROUND_MS, drain_per_ms);
        }
        let remaining = elapsed - rounds * ROUND_MS;

        let new_data = self.new_data;
        if new_data > 0 {
            let mut queued = new_data as f64 - remaining as f64 * drain_per_ms;
            if queued < 1.0 {
                queued = 0.0;
            }
            self.queue_estimate = westwood_filter(self.queue_estimate, queued);
            self.avg_queue = westwood_filter(self.avg_queue, self.queue_estimate);
            self.new_data = 0;
        } else {
            self.decay_queue(remaining, drain_per_ms);
        }
        self.last_queue_update_ms = now_ms;
        tracing::trace!(
            elapsed_ms = elapsed,
            new_data,
            queue_estimate = self.queue_estimate,
            avg_queue = self.avg_queue,
            "Queue update"
        );
    }

    /// Fold the bytes accepted since the last sample into the estimate. Returns the
    /// smoothed estimate in bytes/ms.
    fn update_bandwidth(&mut self, now_ms: u64) -> f64 {
        let Some(acked) = self.bytes_acked else {
            return 0.0;
        };
        let elapsed = now_ms.saturating_sub(self.last_ack_ms);
        let rounds = decay_rounds(elapsed);
        for _ in 0..rounds {
            self.decay_bandwidth();
        }
        let remaining = (elapsed - rounds * ROUND_MS).max(1);

        if acked > 0 {
            let sample = acked as f64 / remaining as f64;
            self.bandwidth_raw = westwood_filter(self.bandwidth_raw, sample);
            self.bandwidth_filtered = westwood_filter(self.bandwidth_filtered, self.bandwidth_raw);
        } else {
            self.decay_bandwidth();
        }
        self.last_ack_ms = now_ms;
        self.bytes_acked = Some(0);
        self.bandwidth_filtered
    }
}

/// Admission gate for one class of relayed traffic.
///
/// All operations take one short internal lock, so a single instance can be shared
/// by every sender of the traffic class.
pub struct CongestionEstimator<T: TimeSource = RealTime> {
    state: Mutex<RedState>,
    min_threshold: u64,
    max_threshold: u64,
    bandwidth_bps: u64,
    drain_per_ms: f64,
    time_source: T,
}

impl CongestionEstimator<RealTime> {
    /// Estimator draining at `bandwidth_bps` bytes/s, with explicit RED thresholds in
    /// bytes.
    pub fn new(
        bandwidth_bps: u64,
        min_threshold: u64,
        max_threshold: u64,
    ) -> Result<Self, ConfigurationError> {
        Self::with_time_source(
            bandwidth_bps,
            min_threshold,
            max_threshold,
            RealTime::new(),
            SmallRng::from_entropy(),
        )
    }

    /// Estimator using [`default_thresholds`].
    pub fn with_default_thresholds(bandwidth_bps: u64) -> Result<Self, ConfigurationError> {
        let (min, max) = default_thresholds(bandwidth_bps);
        Self::new(bandwidth_bps, min, max)
    }
}

impl<T: TimeSource> CongestionEstimator<T> {
    pub fn with_time_source(
        bandwidth_bps: u64,
        min_threshold: u64,
        max_threshold: u64,
        time_source: T,
        rng: SmallRng,
    ) -> Result<Self, ConfigurationError> {
        if bandwidth_bps == 0 {
            return Err(ConfigurationError::ZeroBandwidth);
        }
        if min_threshold >= max_threshold {
            return Err(ConfigurationError::InvalidThresholds {
                min: min_threshold,
                max: max_threshold,
            });
        }
        let now = time_source.now_millis();
        tracing::debug!(
            bandwidth_bps,
            min_threshold,
            max_threshold,
            "Configured congestion estimator"
        );
        Ok(Self {
            state: Mutex::new(RedState {
                bandwidth_filtered: 0.0,
                bandwidth_raw: 0.0,
                bytes_acked: None,
                last_ack_ms: now,
                avg_queue: 0.0,
                queue_estimate: 0.0,
                new_data: 0,
                last_queue_update_ms: now,
                drop_count: -1,
                rng,
            }),
            min_threshold,
            max_threshold,
            bandwidth_bps,
            drain_per_ms: bandwidth_bps as f64 / 1000.0,
            time_source,
        })
    }

    /// Nominal drain rate in bytes/s, as configured.
    pub fn nominal_bandwidth(&self) -> u64 {
        self.bandwidth_bps
    }

    pub fn thresholds(&self) -> (u64, u64) {
        (self.min_threshold, self.max_threshold)
    }

    /// Account for `size` bytes without ever dropping them.
    pub fn add_sample(&self, size: usize) {
        self.offer(size, 0.0);
    }

    /// Ask whether `size` bytes may be forwarded.
    ///
    /// `factor` scales the drop probability; zero or less disables dropping for this
    /// call and only accounts the bytes. A `false` return means the caller must drop
    /// the traffic.
    pub fn offer(&self, size: usize, factor: f64) -> bool {
        let now = self.time_source.now_millis();
        let mut state = self.state.lock();

        if state.bytes_acked.is_none() {
            let elapsed = now.saturating_sub(state.last_ack_ms).max(ROUND_MS);
            let sample = size as f64 / elapsed as f64;
            state.bandwidth_filtered = sample;
            state.bandwidth_raw = sample;
            state.bytes_acked = Some(0);
            state.last_ack_ms = now;
            state.last_queue_update_ms = now;
            state.new_data = size as u64;
            tracing::debug!(size, elapsed_ms = elapsed, "First congestion sample");
            return true;
        }

        let queue_age = now.saturating_sub(state.last_queue_update_ms);
        if queue_age > ROUND_MS {
            state.update_queue(now, self.drain_per_ms);
        }

        if factor > 0.0 && !self.admit(&mut state, size, factor) {
            return false;
        }

        state.new_data += size as u64;
        if let Some(acked) = state.bytes_acked.as_mut() {
            *acked += size as u64;
        }
        if now.saturating_sub(state.last_ack_ms) >= ROUND_MS {
            state.update_bandwidth(now);
        }
        tracing::trace!(size, factor, avg_queue = state.avg_queue, "Accepted bytes");
        true
    }

    /// RED decision for one offer with dropping enabled.
    fn admit(&self, state: &mut RedState, size: usize, factor: f64) -> bool {
        let min = self.min_threshold as f64;
        let max = self.max_threshold as f64;

        if state.avg_queue > max {
            state.drop_count = 0;
            tracing::warn!(
                size,
                avg_queue = state.avg_queue,
                max_threshold = self.max_threshold,
                "Dropping bytes, queue above max threshold"
            );
            return false;
        }
        if state.avg_queue <= min {
            return true;
        }

        state.drop_count += 1;
        let base = (size as f64 / 1024.0) * factor * MAX_DROP_PROBABILITY
            * (state.avg_queue - min)
            / (max - min);
        let base = base.min(MAX_DROP_PROBABILITY);
        let denominator = (1.0 - f64::from(state.drop_count) * base).max(f64::MIN_POSITIVE);
        let probability = (base / denominator).min(MAX_ADJUSTED_PROBABILITY);

        if state.rng.gen::<f64>() < probability {
            state.drop_count = 0;
            tracing::warn!(
                size,
                factor,
                probability,
                avg_queue = state.avg_queue,
                "Dropping bytes, probabilistic"
            );
            return false;
        }
        state.drop_count = -1;
        true
    }

    /// Smoothed accepted-bytes rate in bytes/ms.
    ///
    /// Brought current first when the last sample is at least one round old, so
    /// repeated calls within a round return the same value.
    pub fn bandwidth_estimate(&self) -> f64 {
        let now = self.time_source.now_millis();
        let mut state = self.state.lock();
        if now.saturating_sub(state.last_ack_ms) >= ROUND_MS {
            return state.update_bandwidth(now);
        }
        state.bandwidth_filtered
    }

    /// Average modelled queue occupancy in bytes, aged the same way as
    /// [`bandwidth_estimate`](Self::bandwidth_estimate).
    pub fn queue_size_estimate(&self) -> f64 {
        let now = self.time_source.now_millis();
        let mut state = self.state.lock();
        if now.saturating_sub(state.last_queue_update_ms) >= ROUND_MS {
            state.update_queue(now, self.drain_per_ms);
        }
        state.avg_queue
    }
}

impl<T: TimeSource> fmt::Display for CongestionEstimator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (bandwidth, avg_queue) = {
            let state = self.state.lock();
            (state.bandwidth_filtered, state.avg_queue)
        };
        if bandwidth > 0.0 {
            write!(f, "Bandwidth: {} B/s / ", (bandwidth * 1000.0) as u64)?;
        }
        if avg_queue > 0.0 {
            write!(f, "Average queue size: {} B / ", avg_queue as u64)?;
        }
        write!(f, "Limit: {} B/s", self.bandwidth_bps)
    }
}

impl<T: TimeSource> fmt::Debug for CongestionEstimator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CongestionEstimator")
            .field("bandwidth_bps", &self.bandwidth_bps)
            .field("min_threshold", &self.min_threshold)
            .field("max_threshold", &self.max_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::util::time_source::VirtualTime;

    fn estimator(bandwidth_bps: u64, min: u64, max: u64) -> (VirtualTime, CongestionEstimator<VirtualTime>) {
        let time = VirtualTime::new();
        let red = CongestionEstimator::with_time_source(
            bandwidth_bps,
            min,
            max,
            time.clone(),
            SmallRng::seed_from_u64(0x5eed),
        )
        .expect("valid thresholds");
        (time, red)
    }

    fn default_estimator(bandwidth_bps: u64) -> (VirtualTime, CongestionEstimator<VirtualTime>) {
        let (min, max) = default_thresholds(bandwidth_bps);
        estimator(bandwidth_bps, min, max)
    }

    #[test]
    fn rejects_inverted_or_equal_thresholds() {
        for (min, max) in [(500, 500), (600, 500), (1, 0)] {
            let err = CongestionEstimator::new(1000, min, max).unwrap_err();
            assert_eq!(err, ConfigurationError::InvalidThresholds { min, max });
        }
        assert_eq!(
            CongestionEstimator::new(0, 1, 2).unwrap_err(),
            ConfigurationError::ZeroBandwidth
        );
    }

    #[test]
    fn default_thresholds_are_quarter_and_half() {
        assert_eq!(default_thresholds(100_000), (25_000, 50_000));
        assert_eq!(default_thresholds(3), (1, 1));
        // too small to yield distinct thresholds
        assert!(CongestionEstimator::with_default_thresholds(3).is_err());
        let red = CongestionEstimator::with_default_thresholds(1000).unwrap();
        assert_eq!(red.thresholds(), (250, 500));
        assert_eq!(red.nominal_bandwidth(), 1000);
    }

    #[test]
    fn first_sample_bootstraps_and_admits() {
        let (time, red) = default_estimator(100_000);
        time.advance(Duration::from_millis(10));
        assert!(red.offer(1_000_000, 100.0));
        // elapsed is floored at one round: 1_000_000 B / 50 ms
        assert_eq!(red.bandwidth_estimate(), 20_000.0);
    }

    #[test]
    fn bandwidth_estimate_is_stable_within_a_round() {
        let (time, red) = default_estimator(100_000);
        red.add_sample(1000);
        let first = red.bandwidth_estimate();
        assert_eq!(first, red.bandwidth_estimate());

        time.advance(Duration::from_millis(60));
        let aged = red.bandwidth_estimate();
        assert!(aged < first, "idle round decays the estimate");
        time.advance(Duration::from_millis(49));
        assert_eq!(aged, red.bandwidth_estimate());
    }

    #[test]
    fn queue_estimate_is_stable_within_a_round() {
        let (time, red) = default_estimator(1000);
        red.add_sample(10_000);
        time.advance(Duration::from_millis(60));
        let first = red.queue_size_estimate();
        assert!(first > 0.0);
        time.advance(Duration::from_millis(20));
        assert_eq!(first, red.queue_size_estimate());
    }

    #[test]
    fn zero_factor_never_drops() {
        let (time, red) = default_estimator(1000);
        for _ in 0..500 {
            assert!(red.offer(100_000, 0.0));
            time.advance(Duration::from_millis(10));
        }
        assert!(red.queue_size_estimate() > 500.0, "queue is far above max");
        assert!(red.offer(100_000, 0.0));
        assert!(red.offer(100_000, -1.0));
    }

    #[test]
    fn queue_above_max_always_drops() {
        let (time, red) = default_estimator(1000);
        red.add_sample(100_000);
        time.advance(Duration::from_millis(60));
        red.add_sample(0);
        let queue = red.queue_size_estimate();
        assert!(queue > 500.0, "avg queue {queue} should exceed max threshold");
        for _ in 0..100 {
            assert!(!red.offer(1, 1.0));
        }
    }

    #[test]
    fn between_thresholds_drops_are_rare_for_small_offers() {
        let (time, red) = default_estimator(1000);
        // avg queue ends up at (24_060 - 60) / 64 = 375 bytes, between 250 and 500
        red.add_sample(24_060);
        time.advance(Duration::from_millis(60));
        red.add_sample(0);
        let queue = red.queue_size_estimate();
        assert!((250.0..500.0).contains(&queue), "avg queue {queue}");

        let admitted = (0..1000).filter(|_| red.offer(1024, 1.0)).count();
        assert!(admitted >= 990, "admitted {admitted}");
    }

    #[test]
    fn sustained_overload_produces_drops() {
        let (time, red) = estimator(100_000, 25_000, 50_000);
        let mut dropped = 0;
        let mut crossed_min = false;
        for _ in 0..200 {
            if !red.offer(40_000, 1.0) {
                dropped += 1;
            }
            crossed_min |= red.queue_size_estimate() > 25_000.0;
            time.advance(Duration::from_millis(10));
        }
        assert!(crossed_min);
        assert!(dropped > 0);
    }

    #[test]
    fn idle_rounds_drain_queue() {
        let (time, red) = default_estimator(1000);
        red.add_sample(100_000);
        time.advance(Duration::from_millis(60));
        let loaded = red.queue_size_estimate();
        time.advance(Duration::from_secs(600));
        red.queue_size_estimate();
        for _ in 0..40 {
            time.advance(Duration::from_millis(60));
            red.queue_size_estimate();
        }
        let drained = red.queue_size_estimate();
        assert!(drained < loaded, "{drained} >= {loaded}");
    }

    #[test]
    fn display_summarises_state() {
        let (time, red) = default_estimator(100_000);
        assert_eq!(red.to_string(), "Limit: 100000 B/s");
        red.add_sample(100_000);
        time.advance(Duration::from_millis(60));
        red.queue_size_estimate();
        let shown = red.to_string();
        assert!(shown.starts_with("Bandwidth: "), "{shown}");
        assert!(shown.contains("Average queue size"), "{shown}");
        assert!(shown.ends_with("Limit: 100000 B/s"), "{shown}");
    }
}
