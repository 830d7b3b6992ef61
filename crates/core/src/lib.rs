/// Participating-traffic admission and the periodic bandwidth refill loop.
pub mod bandwidth;

/// Router configuration: command line, config file and live reloading.
pub mod config;

/// Outbound message dispatch across transports.
pub mod dispatch;

/// Peer identity, ban list and send-result profiles.
pub mod peer;

/// Tracing and logging setup.
pub mod tracing;

/// Transport capability, bids and per-peer reachability.
pub mod transport;

pub mod util;

pub use bandwidth::{AllowanceScheduler, CongestionEstimator, TokenBucketLimiter};
pub use dispatch::{DispatchFailure, Dispatcher, OutboundMessage, SendCompletion};
pub use peer::PeerId;
pub use transport::{Bid, ReachabilityTracker, Transport, TransportId};
