//! Transport capability and the transport-independent peer reachability state.
//!
//! A transport (NTCP, SSU, an in-memory test double, ...) is anything that can bid
//! for a message and then send it asynchronously. How it physically moves bytes is
//! its own business; this crate only decides whether and through whom a message
//! leaves the router.

use std::fmt;

use futures::future::BoxFuture;

pub mod bid;
pub mod peer_ips;
pub mod reachability;

pub use bid::{select_lowest, Bid, TRANSIENT_FAIL};
pub use peer_ips::PeerIpStore;
pub use reachability::{ConnectivityStatus, ReachabilityTracker};

use crate::dispatch::{OutboundMessage, SendCompletion};
use crate::peer::PeerId;

/// Short name identifying a transport, e.g. `"NTCP"` or `"SSU"`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(&'static str);

impl TransportId {
    pub const fn new(style: &'static str) -> Self {
        Self(style)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportId({})", self.0)
    }
}

/// A way of carrying messages to other routers.
///
/// Implementations are registered with the [`Dispatcher`](crate::dispatch::Dispatcher),
/// which asks every one of them for a bid and hands the message to the cheapest.
pub trait Transport: Send + Sync + 'static {
    /// Stable identifier, unique among the registered transports.
    fn id(&self) -> TransportId;

    /// What it would cost this transport to carry `size_hint` bytes to `target`.
    ///
    /// `None` means the transport is unwilling or unable. Bids are collected
    /// concurrently and each is subject to the dispatcher's bid timeout, a bid that
    /// does not resolve in time counts as `None`.
    fn bid(&self, target: &PeerId, size_hint: usize) -> BoxFuture<'_, Option<Bid>>;

    /// Start sending the message. Must not block.
    ///
    /// The transport owns the message until it reports the outcome through
    /// `completion`, exactly once, from whatever task finishes the send.
    fn send(&self, msg: OutboundMessage, completion: SendCompletion);
}
