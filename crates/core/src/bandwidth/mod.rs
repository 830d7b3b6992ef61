//! Bandwidth admission: the periodic refill loop feeding the token buckets, and the
//! synthetic RED gate for participating traffic.

pub mod allowance;
pub mod congestion_estimator;
pub mod errors;
pub mod limiter;

pub use allowance::{AllowanceRates, AllowanceScheduler, AllowanceStats};
pub use congestion_estimator::CongestionEstimator;
pub use errors::ConfigurationError;
pub use limiter::{BandwidthLimiter, Direction, Refill, TokenBucketLimiter};
