//! Token buckets gating actual send and receive volume.
//!
//! The [`AllowanceScheduler`](super::AllowanceScheduler) owns the clock: it computes
//! how many bytes each direction earned since the last tick and pushes them here
//! through [`BandwidthLimiter::refill`]. Senders reserve bytes and sleep for the wait
//! time they get back.

use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Bytes earned by one direction during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionRefill {
    /// Steady-rate allowance.
    pub bytes: u64,
    /// Extra allowance that may be drawn from the burst pool.
    pub burst_bytes: u64,
    /// The direction has no configured limit; byte counts are zero.
    pub unlimited: bool,
}

impl DirectionRefill {
    pub const UNLIMITED: Self = Self {
        bytes: 0,
        burst_bytes: 0,
        unlimited: true,
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Refill {
    pub inbound: DirectionRefill,
    pub outbound: DirectionRefill,
}

/// Rates and pool sizes in bytes, pushed whenever the configuration is re-read.
/// A zero rate means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterSettings {
    pub inbound_bps: u64,
    pub outbound_bps: u64,
    pub inbound_burst_bps: u64,
    pub outbound_burst_bps: u64,
    pub inbound_burst_pool: u64,
    pub outbound_burst_pool: u64,
}

/// Sink for the scheduler's periodic allowances.
///
/// Called from the scheduler loop on every tick; implementations must not block.
pub trait BandwidthLimiter: Send + Sync + 'static {
    fn refill(&self, refill: Refill);

    fn configure(&self, settings: &LimiterSettings);
}

/// Token bucket for one direction.
///
/// Tokens may go negative: a reservation larger than what is available is granted
/// immediately as debt, and the caller is told how long to wait before sending.
/// Debt is repaid first from refills, then from the burst pool at up to the burst
/// rate. Steady tokens beyond one second of traffic overflow into the burst pool.
#[derive(Debug, Default)]
struct Bucket {
    available: i64,
    capacity: u64,
    burst_pool: u64,
    burst_pool_capacity: u64,
    rate_bps: u64,
    unlimited: bool,
}

impl Bucket {
    fn configure(&mut self, rate_bps: u64, burst_pool_capacity: u64) {
        let first = self.capacity == 0;
        self.rate_bps = rate_bps;
        self.unlimited = rate_bps == 0;
        self.capacity = rate_bps;
        self.burst_pool_capacity = burst_pool_capacity;
        self.burst_pool = self.burst_pool.min(burst_pool_capacity);
        if first {
            // start full
            self.available = clamp_i64(self.capacity);
        } else {
            self.available = self.available.min(clamp_i64(self.capacity));
        }
    }

    fn refill(&mut self, refill: DirectionRefill) {
        self.unlimited = refill.unlimited;
        if refill.unlimited {
            return;
        }
        self.available = self.available.saturating_add(clamp_i64(refill.bytes));
        if self.available < 0 {
            let debt = self.available.unsigned_abs();
            let draw = debt.min(refill.burst_bytes).min(self.burst_pool);
            self.burst_pool -= draw;
            self.available += clamp_i64(draw);
        }
        let capacity = clamp_i64(self.capacity);
        if self.available > capacity {
            let excess = (self.available - capacity) as u64;
            self.burst_pool = self
                .burst_pool
                .saturating_add(excess)
                .min(self.burst_pool_capacity);
            self.available = capacity;
        }
    }

    fn reserve(&mut self, bytes: usize) -> Duration {
        if self.unlimited || self.rate_bps == 0 {
            return Duration::ZERO;
        }
        self.available = self.available.saturating_sub(clamp_i64(bytes as u64));
        if self.available >= 0 {
            return Duration::ZERO;
        }
        let deficit = self.available.unsigned_abs();
        Duration::from_secs_f64(deficit as f64 / self.rate_bps as f64)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Limiter with one [`Bucket`] per direction.
///
/// Uses a reserve-then-wait pattern: tokens are deducted by
/// [`reserve`](Self::reserve), which returns how long the caller must wait before
/// transmitting.
#[derive(Debug, Default)]
pub struct TokenBucketLimiter {
    inbound: Mutex<Bucket>,
    outbound: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, direction: Direction) -> &Mutex<Bucket> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Deduct `bytes` from the direction and return how long to wait before
    /// transmitting them.
    pub fn reserve(&self, direction: Direction, bytes: usize) -> Duration {
        self.bucket(direction).lock().reserve(bytes)
    }

    /// Tokens currently available, negative while in debt.
    pub fn available(&self, direction: Direction) -> i64 {
        self.bucket(direction).lock().available
    }

    pub fn burst_pool(&self, direction: Direction) -> u64 {
        self.bucket(direction).lock().burst_pool
    }

    pub fn is_unlimited(&self, direction: Direction) -> bool {
        self.bucket(direction).lock().unlimited
    }
}

impl BandwidthLimiter for TokenBucketLimiter {
    fn refill(&self, refill: Refill) {
        self.inbound.lock().refill(refill.inbound);
        self.outbound.lock().refill(refill.outbound);
    }

    fn configure(&self, settings: &LimiterSettings) {
        self.inbound
            .lock()
            .configure(settings.inbound_bps, settings.inbound_burst_pool);
        self.outbound
            .lock()
            .configure(settings.outbound_bps, settings.outbound_burst_pool);
        tracing::debug!(?settings, "Token buckets reconfigured");
    }
}
