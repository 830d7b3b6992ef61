//! Per-peer reachability history, shared by all transports.
//!
//! Two independent, expiring marks are kept for each peer:
//!
//! - *unreachable*: set when we fail to reach the peer, cleared by any later contact
//!   (inbound or outbound). Short window.
//! - *was unreachable*: set together with the first one but only cleared by an
//!   outbound success. An inbound connection proves the peer is alive, not that we
//!   can reach it. Long window.
//!
//! Entries are pruned lazily on lookup and by a periodic sweep. The tracker also owns
//! the [`PeerIpStore`] of last seen peer addresses.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::peer_ips::PeerIpStore;
use crate::config::ReachabilitySettings;
use crate::peer::{Banlist, PeerId};
use crate::util::time_source::{RealTime, TimeSource};

/// How long a peer stays unreachable after a failure.
pub const UNREACHABLE_PERIOD: Duration = Duration::from_secs(5 * 60);
/// How long a peer is remembered as having been unreachable.
pub const WAS_UNREACHABLE_PERIOD: Duration = Duration::from_secs(30 * 60);
/// Both windows when local addresses are allowed. Test networks restart often and
/// would otherwise exclude each other for half an hour.
pub const LOCAL_UNREACHABLE_PERIOD: Duration = Duration::from_secs(60);

/// Overall connectivity of the router, as seen by the comm system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityStatus {
    #[default]
    Unknown,
    Ok,
    Firewalled,
    Disconnected,
    /// No usable port or address. Nothing gets through.
    Hosed,
}

impl ConnectivityStatus {
    /// In these states every peer looks unreachable, so failures carry no signal.
    pub fn suppresses_unreachable(self) -> bool {
        matches!(self, Self::Disconnected | Self::Hosed)
    }
}

/// What a successful contact does to a permanent ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbanPolicy {
    /// Legacy rule: if any transport can reach the peer it should not stay banned.
    ForgiveOnReachable,
    /// Operator bans always stick.
    KeepPermanentBans,
}

impl UnbanPolicy {
    fn from_settings(settings: &ReachabilitySettings) -> Self {
        if settings.forgive_banned_on_reachable {
            Self::ForgiveOnReachable
        } else {
            Self::KeepPermanentBans
        }
    }
}

pub struct ReachabilityTracker<T: TimeSource = RealTime> {
    /// Peer -> time (nanos) of the last failure. Cleared by any contact.
    unreachable: DashMap<PeerId, u64>,
    /// Peer -> time (nanos) of the last failure. Cleared by outbound success only.
    was_unreachable: DashMap<PeerId, u64>,
    /// Last peer found reachable, short-circuits repeated queries.
    last_reachable: ArcSwapOption<PeerId>,
    banlist: Arc<dyn Banlist>,
    ips: PeerIpStore,
    status: watch::Receiver<ConnectivityStatus>,
    unreachable_period: Duration,
    was_unreachable_period: Duration,
    unban_policy: UnbanPolicy,
    time_source: T,
}

impl ReachabilityTracker<RealTime> {
    pub fn new(
        settings: &ReachabilitySettings,
        banlist: Arc<dyn Banlist>,
        status: watch::Receiver<ConnectivityStatus>,
    ) -> Self {
        Self::with_time_source(settings, banlist, status, RealTime::new())
    }
}

impl<T: TimeSource> ReachabilityTracker<T> {
    pub fn with_time_source(
        settings: &ReachabilitySettings,
        banlist: Arc<dyn Banlist>,
        status: watch::Receiver<ConnectivityStatus>,
        time_source: T,
    ) -> Self {
        let (unreachable_period, was_unreachable_period) = if settings.allow_local {
            (LOCAL_UNREACHABLE_PERIOD, LOCAL_UNREACHABLE_PERIOD)
        } else {
            (UNREACHABLE_PERIOD, WAS_UNREACHABLE_PERIOD)
        };
        Self {
            unreachable: DashMap::new(),
            was_unreachable: DashMap::new(),
            last_reachable: ArcSwapOption::empty(),
            banlist,
            ips: PeerIpStore::new(settings.ip_cache_capacity()),
            status,
            unreachable_period,
            was_unreachable_period,
            unban_policy: UnbanPolicy::from_settings(settings),
            time_source,
        }
    }

    pub fn unreachable_period(&self) -> Duration {
        self.unreachable_period
    }

    pub fn was_unreachable_period(&self) -> Duration {
        self.was_unreachable_period
    }

    pub fn unban_policy(&self) -> UnbanPolicy {
        self.unban_policy
    }

    pub fn time_source(&self) -> &T {
        &self.time_source
    }

    /// Called when we could not reach a peer.
    pub fn mark_unreachable(&self, peer: &PeerId) {
        let status = *self.status.borrow();
        if status.suppresses_unreachable() {
            tracing::trace!(%peer, ?status, "Ignoring unreachable mark while disconnected");
            return;
        }
        let now = self.time_source.now_nanos();
        self.unreachable.insert(*peer, now);
        self.was_unreachable.insert(*peer, now);
        self.clear_cached(peer);
        tracing::debug!(%peer, "Marked unreachable");
    }

    /// Called when a connection with the peer is established, `inbound` telling who
    /// initiated it.
    pub fn mark_reachable(&self, peer: &PeerId, inbound: bool) {
        self.forgive_ban_on_reachable(peer);
        self.unreachable.remove(peer);
        if !inbound {
            self.was_unreachable.remove(peer);
        }
    }

    /// Lift a permanent ban on a peer that turned out to be reachable, when the
    /// configured [`UnbanPolicy`] allows it. Returns whether a ban was lifted.
    pub fn forgive_ban_on_reachable(&self, peer: &PeerId) -> bool {
        if self.unban_policy != UnbanPolicy::ForgiveOnReachable
            || !self.banlist.is_banned_forever(peer)
        {
            return false;
        }
        tracing::warn!(%peer, "Unbanning peer, it is now reachable");
        self.banlist.unban(peer);
        true
    }

    /// Whether we recently failed to reach the peer and have not heard from it since.
    pub fn is_unreachable(&self, peer: &PeerId) -> bool {
        if self.is_cached(peer) {
            return false;
        }
        let Some(when) = self.unreachable.get(peer).map(|w| *w) else {
            self.cache_reachable(peer);
            return false;
        };
        let now = self.time_source.now_nanos();
        let unreachable = when.saturating_add(self.unreachable_period.as_nanos() as u64) >= now;
        if !unreachable {
            self.unreachable.remove_if(peer, |_, w| *w == when);
            self.cache_reachable(peer);
        }
        unreachable
    }

    /// Whether the last outbound attempt to the peer failed, within the long window.
    /// Not reset by inbound contact.
    pub fn was_unreachable(&self, peer: &PeerId) -> bool {
        let Some(when) = self.was_unreachable.get(peer).map(|w| *w) else {
            return false;
        };
        let now = self.time_source.now_nanos();
        if when.saturating_add(self.was_unreachable_period.as_nanos() as u64) < now {
            self.was_unreachable.remove_if(peer, |_, w| *w == when);
            self.unreachable.remove(peer);
            return false;
        }
        true
    }

    /// Drop every record whose window has passed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.time_source.now_nanos();
        let before = self.unreachable.len() + self.was_unreachable.len();
        let limit = now.saturating_sub(self.unreachable_period.as_nanos() as u64);
        self.unreachable.retain(|_, when| *when >= limit);
        let limit = now.saturating_sub(self.was_unreachable_period.as_nanos() as u64);
        self.was_unreachable.retain(|_, when| *when >= limit);
        let removed = before.saturating_sub(self.unreachable.len() + self.was_unreachable.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired reachability records");
        }
        removed
    }

    /// Number of peers with a live or stale record in either window.
    pub fn tracked(&self) -> (usize, usize) {
        (self.unreachable.len(), self.was_unreachable.len())
    }

    /// Run [`sweep`](Self::sweep) periodically until `shutdown` is set.
    ///
    /// The first sweep happens after twice the short window, then every half window.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let initial = self.unreachable_period * 2;
        let period = self.unreachable_period / 2;
        tokio::spawn(async move {
            self.time_source.sleep(initial).await;
            while !shutdown.load(Ordering::Acquire) {
                self.sweep();
                self.time_source.sleep(period).await;
            }
            tracing::debug!("Reachability sweeper stopped");
        })
    }

    /// Record the address a transport saw for the peer. Returns whether it changed.
    pub fn set_ip(&self, peer: PeerId, ip: IpAddr) -> bool {
        self.ips.set_ip(peer, ip)
    }

    pub fn ip(&self, peer: &PeerId) -> Option<IpAddr> {
        self.ips.ip(peer)
    }

    pub fn peer_ips(&self) -> &PeerIpStore {
        &self.ips
    }

    /// Forget every remembered address, e.g. after our own address changed.
    pub fn clear_ips(&self) {
        self.ips.clear();
    }

    fn is_cached(&self, peer: &PeerId) -> bool {
        self.last_reachable
            .load()
            .as_deref()
            .is_some_and(|cached| cached == peer)
    }

    /// Cache the peer as reachable. A concurrent `mark_unreachable` may have
    /// inserted it after our lookup, so the map is checked again once cached.
    fn cache_reachable(&self, peer: &PeerId) {
        self.last_reachable.store(Some(Arc::new(*peer)));
        if self.unreachable.contains_key(peer) {
            self.clear_cached(peer);
        }
    }

    fn clear_cached(&self, peer: &PeerId) {
        if self.is_cached(peer) {
            self.last_reachable.store(None);
        }
    }
}
