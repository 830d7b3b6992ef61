//! Periodic bandwidth refill loop.
//!
//! Every [`REPLENISH_FREQUENCY`] the scheduler converts the configured rates into a
//! byte allowance for the elapsed time and hands it to the [`BandwidthLimiter`].
//! Rates are re-read from the [`ConfigSource`] once a minute. The scheduler also owns
//! the [`CongestionEstimator`] for participating traffic and replaces it whenever the
//! share of bandwidth offered to other routers changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;

use super::congestion_estimator::{default_thresholds, CongestionEstimator};
use super::errors::ConfigurationError;
use super::limiter::{BandwidthLimiter, DirectionRefill, LimiterSettings, Refill};
use crate::config::{BandwidthSettings, ConfigSource, DEFAULT_BURST_SECONDS};
use crate::util::time_source::{RealTime, TimeSource};

pub const REPLENISH_FREQUENCY: Duration = Duration::from_millis(40);
const REPLENISH_MS: u64 = 40;
/// Elapsed times at or above this are treated as clock skew.
const MAX_REFILL_ELAPSED_MS: u64 = REPLENISH_MS * 50;
pub const CONFIG_CHECK_PERIOD: Duration = Duration::from_secs(60);

pub const MIN_RATE_KBPS: u64 = 5;
/// Ceiling for the outbound rate. Higher rates overflow the false positive budget of
/// the duplicate message filter.
pub const MAX_OUTBOUND_KBPS: u64 = 16384;
pub const MIN_BURST_POOL_KBYTES: u64 = 5;

/// Cap on the fraction of bandwidth shared with participating traffic.
const MAX_SHARE_FRACTION: f64 = 0.90;
const SHARE_LIMIT_FACTOR: f64 = 0.95;
/// Floor for the participating bandwidth, keeps the estimator thresholds distinct.
const MIN_PARTICIPATING_BPS: u64 = 1024;

/// Rates after clamping, in KB/s and KB. A zero steady rate means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceRates {
    pub inbound_kbps: u64,
    pub outbound_kbps: u64,
    pub inbound_burst_kbps: u64,
    pub outbound_burst_kbps: u64,
    pub inbound_burst_kbytes: u64,
    pub outbound_burst_kbytes: u64,
    pub share_percentage: u8,
}

fn clamp_steady(kbps: u64) -> u64 {
    if kbps == 0 {
        0
    } else {
        kbps.max(MIN_RATE_KBPS)
    }
}

fn clamp_burst(burst_kbps: Option<u64>, steady_kbps: u64) -> u64 {
    match burst_kbps {
        Some(burst) if burst > 0 => burst.max(steady_kbps),
        _ => steady_kbps,
    }
}

fn clamp_pool(pool_kbytes: Option<u64>, burst_kbps: u64) -> u64 {
    pool_kbytes
        .unwrap_or(DEFAULT_BURST_SECONDS.saturating_mul(burst_kbps))
        .max(MIN_BURST_POOL_KBYTES)
        .max(burst_kbps)
}

/// Bytes earned at `kbps` over `elapsed_ms`, saturating for absurd rates.
fn kbytes_over(kbps: u64, elapsed_ms: u64) -> u64 {
    kbps.saturating_mul(1024).saturating_mul(elapsed_ms) / 1000
}

impl AllowanceRates {
    pub fn from_settings(settings: &BandwidthSettings) -> Self {
        let inbound_kbps = clamp_steady(settings.inbound_kbps);
        let outbound_kbps = clamp_steady(settings.outbound_kbps).min(MAX_OUTBOUND_KBPS);
        let inbound_burst_kbps = clamp_burst(settings.inbound_burst_kbps, inbound_kbps);
        let outbound_burst_kbps = clamp_burst(settings.outbound_burst_kbps, outbound_kbps);
        Self {
            inbound_kbps,
            outbound_kbps,
            inbound_burst_kbps,
            outbound_burst_kbps,
            inbound_burst_kbytes: clamp_pool(settings.inbound_burst_kbytes, inbound_burst_kbps),
            outbound_burst_kbytes: clamp_pool(settings.outbound_burst_kbytes, outbound_burst_kbps),
            share_percentage: settings.share_percentage.min(100),
        }
    }

    /// Bytes/s offered to participating traffic.
    pub fn share_bandwidth(&self) -> u64 {
        let effective = |kbps: u64| if kbps == 0 { MAX_OUTBOUND_KBPS } else { kbps };
        let max_kbps = effective(self.inbound_kbps).min(effective(self.outbound_kbps));
        let share = (f64::from(self.share_percentage) / 100.0).min(MAX_SHARE_FRACTION);
        let bps = (max_kbps as f64 * share * 1024.0 * SHARE_LIMIT_FACTOR) as u64;
        bps.max(MIN_PARTICIPATING_BPS)
    }

    fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            inbound_bps: self.inbound_kbps.saturating_mul(1024),
            outbound_bps: self.outbound_kbps.saturating_mul(1024),
            inbound_burst_bps: self.inbound_burst_kbps.saturating_mul(1024),
            outbound_burst_bps: self.outbound_burst_kbps.saturating_mul(1024),
            inbound_burst_pool: self.inbound_burst_kbytes.saturating_mul(1024),
            outbound_burst_pool: self.outbound_burst_kbytes.saturating_mul(1024),
        }
    }

    fn refill(&self, elapsed_ms: u64) -> Refill {
        let direction = |kbps: u64, burst_kbps: u64| {
            if kbps == 0 {
                return DirectionRefill::UNLIMITED;
            }
            DirectionRefill {
                bytes: kbytes_over(kbps, elapsed_ms),
                burst_bytes: kbytes_over(burst_kbps.saturating_sub(kbps), elapsed_ms),
                unlimited: false,
            }
        };
        Refill {
            inbound: direction(self.inbound_kbps, self.inbound_burst_kbps),
            outbound: direction(self.outbound_kbps, self.outbound_burst_kbps),
        }
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllowanceStats {
    pub ticks: u64,
    pub refills: u64,
    /// Ticks that came too early to refill anything.
    pub skipped_refills: u64,
    /// Elapsed times that were non-positive or implausibly large.
    pub clock_anomalies: u64,
    pub estimator_replacements: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    refills: AtomicU64,
    skipped_refills: AtomicU64,
    clock_anomalies: AtomicU64,
    estimator_replacements: AtomicU64,
}

struct AllowanceState {
    rates: AllowanceRates,
    last_refill_ms: u64,
    last_config_check_ms: u64,
    /// Wraps every 256 ticks, which triggers a participating bandwidth refresh.
    tick: u8,
}

pub struct AllowanceScheduler<T: TimeSource = RealTime> {
    config: Arc<dyn ConfigSource>,
    limiter: Arc<dyn BandwidthLimiter>,
    participating: ArcSwap<CongestionEstimator<T>>,
    state: Mutex<AllowanceState>,
    running: AtomicBool,
    counters: Counters,
    /// Seeds the RNG of each new estimator.
    seeds: Mutex<SmallRng>,
    time_source: T,
}

impl AllowanceScheduler<RealTime> {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        limiter: Arc<dyn BandwidthLimiter>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_time_source(config, limiter, RealTime::new(), SmallRng::from_entropy())
    }
}

impl<T: TimeSource> AllowanceScheduler<T> {
    pub fn with_time_source(
        config: Arc<dyn ConfigSource>,
        limiter: Arc<dyn BandwidthLimiter>,
        time_source: T,
        mut seeds: SmallRng,
    ) -> Result<Self, ConfigurationError> {
        let now = time_source.now_millis();
        let rates = AllowanceRates::from_settings(&config.bandwidth());
        limiter.configure(&rates.limiter_settings());
        let estimator = Self::build_estimator(rates.share_bandwidth(), &time_source, &mut seeds)?;
        tracing::debug!(?rates, "Allowance scheduler initialised");
        Ok(Self {
            config,
            limiter,
            participating: ArcSwap::from_pointee(estimator),
            state: Mutex::new(AllowanceState {
                rates,
                last_refill_ms: now,
                last_config_check_ms: now,
                tick: 0,
            }),
            running: AtomicBool::new(true),
            counters: Counters::default(),
            seeds: Mutex::new(seeds),
            time_source,
        })
    }

    fn build_estimator(
        bandwidth_bps: u64,
        time_source: &T,
        seeds: &mut SmallRng,
    ) -> Result<CongestionEstimator<T>, ConfigurationError> {
        let (min, max) = default_thresholds(bandwidth_bps);
        CongestionEstimator::with_time_source(
            bandwidth_bps,
            min,
            max,
            time_source.clone(),
            SmallRng::seed_from_u64(seeds.gen()),
        )
    }

    /// One iteration of the loop: config check, participating refresh, refill.
    pub fn tick(&self) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let mut now = self.time_source.now_millis();
        let mut state = self.state.lock();

        if now >= state.last_config_check_ms + CONFIG_CHECK_PERIOD.as_millis() as u64 {
            self.check_config(&mut state);
            now = self.time_source.now_millis();
            state.last_config_check_ms = now;
        }

        state.tick = state.tick.wrapping_add(1);
        let refresh = state.tick == 0;
        let rates = state.rates;

        let refill = self.refill_for(&state, now);
        if refill.is_some() {
            state.last_refill_ms = now;
        }
        drop(state);

        if refresh {
            self.refresh_participating(&rates);
        }
        if let Some(refill) = refill {
            self.counters.refills.fetch_add(1, Ordering::Relaxed);
            self.limiter.refill(refill);
        }
    }

    fn check_config(&self, state: &mut AllowanceState) {
        let rates = AllowanceRates::from_settings(&self.config.bandwidth());
        if rates != state.rates {
            tracing::debug!(old = ?state.rates, new = ?rates, "Bandwidth rates changed");
            state.rates = rates;
        }
        self.limiter.configure(&rates.limiter_settings());
    }

    fn refill_for(&self, state: &AllowanceState, now: u64) -> Option<Refill> {
        let mut elapsed = now.saturating_sub(state.last_refill_ms);
        if elapsed == 0 || elapsed >= MAX_REFILL_ELAPSED_MS {
            self.counters.clock_anomalies.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(elapsed_ms = elapsed, "Unexpected refill interval, using nominal tick");
            elapsed = REPLENISH_MS;
        }
        if elapsed < REPLENISH_MS {
            self.counters.skipped_refills.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(elapsed_ms = elapsed, "Refresh delay too short");
            return None;
        }
        Some(state.rates.refill(elapsed))
    }

    fn refresh_participating(&self, rates: &AllowanceRates) {
        let share = rates.share_bandwidth();
        if share != self.participating.load().nominal_bandwidth() {
            if let Err(error) = self.replace_congestion_estimator(share) {
                tracing::warn!(%error, share, "Keeping previous congestion estimator");
            }
        }
        tracing::debug!(
            participating_bps = self.current_participating_bandwidth(),
            queue_bytes = self.participating_queue_bytes(),
            "Participating traffic"
        );
    }

    /// Discard the participating estimator and start a fresh one at
    /// `bandwidth_bps`. All smoothed history is lost.
    pub fn replace_congestion_estimator(&self, bandwidth_bps: u64) -> Result<(), ConfigurationError> {
        let estimator = Self::build_estimator(bandwidth_bps, &self.time_source, &mut self.seeds.lock())?;
        let previous = self.participating.swap(Arc::new(estimator));
        self.counters
            .estimator_replacements
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            previous_bps = previous.nominal_bandwidth(),
            bandwidth_bps,
            "Replaced participating congestion estimator"
        );
        Ok(())
    }

    /// Admission decision for `size` bytes of participating traffic.
    pub fn record_participating_bytes(&self, size: usize, factor: f64) -> bool {
        self.participating.load().offer(size, factor)
    }

    /// Estimated participating throughput in bytes/s.
    pub fn current_participating_bandwidth(&self) -> u64 {
        (self.participating.load().bandwidth_estimate() * 1000.0) as u64
    }

    pub fn participating_queue_bytes(&self) -> u64 {
        self.participating.load().queue_size_estimate() as u64
    }

    pub fn congestion_estimator(&self) -> Arc<CongestionEstimator<T>> {
        self.participating.load_full()
    }

    pub fn rates(&self) -> AllowanceRates {
        self.state.lock().rates
    }

    pub fn stats(&self) -> AllowanceStats {
        AllowanceStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            refills: self.counters.refills.load(Ordering::Relaxed),
            skipped_refills: self.counters.skipped_refills.load(Ordering::Relaxed),
            clock_anomalies: self.counters.clock_anomalies.load(Ordering::Relaxed),
            estimator_replacements: self.counters.estimator_replacements.load(Ordering::Relaxed),
        }
    }

    /// Ask the loop to stop. Takes effect at the next tick.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tick every [`REPLENISH_FREQUENCY`] until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) {
        self.state.lock().last_refill_ms = self.time_source.now_millis();
        while self.is_running() {
            self.tick();
            self.time_source.sleep(REPLENISH_FREQUENCY).await;
        }
        tracing::debug!("Allowance scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
