use std::time::Duration;

use dashmap::DashMap;

use super::PeerId;
use crate::util::time_source::{RealTime, TimeSource};

/// Peers this router refuses to contact.
///
/// Bans are either temporary (expire after a duration) or permanent. Only permanent
/// bans short-circuit dispatch; temporary bans are advisory for transports.
pub trait Banlist: Send + Sync + 'static {
    /// Whether the peer is currently banned, temporarily or permanently.
    fn is_banned(&self, peer: &PeerId) -> bool;

    /// Whether the peer is under a permanent ban.
    fn is_banned_forever(&self, peer: &PeerId) -> bool;

    /// Ban the peer for the given duration. Never shortens an existing ban.
    fn ban(&self, peer: PeerId, reason: &str, duration: Duration);

    /// Ban the peer permanently.
    fn ban_forever(&self, peer: PeerId, reason: &str);

    /// Lift any ban on the peer.
    fn unban(&self, peer: &PeerId);
}

#[derive(Debug, Clone)]
struct BanEntry {
    reason: String,
    /// `None` for a permanent ban.
    expires_at_nanos: Option<u64>,
}

/// Concurrent in-memory ban list.
pub struct InMemoryBanlist<T: TimeSource = RealTime> {
    entries: DashMap<PeerId, BanEntry>,
    time_source: T,
}

impl Default for InMemoryBanlist<RealTime> {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBanlist<RealTime> {
    pub fn new() -> Self {
        Self::with_time_source(RealTime::new())
    }
}

impl<T: TimeSource> InMemoryBanlist<T> {
    pub fn with_time_source(time_source: T) -> Self {
        Self {
            entries: DashMap::new(),
            time_source,
        }
    }

    /// The reason recorded for the peer's current ban, if any.
    pub fn reason(&self, peer: &PeerId) -> Option<String> {
        self.active(peer).map(|entry| entry.reason)
    }

    /// Number of tracked entries, including expired ones not yet looked up.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn active(&self, peer: &PeerId) -> Option<BanEntry> {
        let now = self.time_source.now_nanos();
        let entry = self.entries.get(peer)?.clone();
        match entry.expires_at_nanos {
            Some(expires) if expires <= now => {
                self.entries
                    .remove_if(peer, |_, e| e.expires_at_nanos == Some(expires));
                None
            }
            _ => Some(entry),
        }
    }
}

impl<T: TimeSource> Banlist for InMemoryBanlist<T> {
    fn is_banned(&self, peer: &PeerId) -> bool {
        self.active(peer).is_some()
    }

    fn is_banned_forever(&self, peer: &PeerId) -> bool {
        self.active(peer)
            .is_some_and(|entry| entry.expires_at_nanos.is_none())
    }

    fn ban(&self, peer: PeerId, reason: &str, duration: Duration) {
        let expires = self
            .time_source
            .now_nanos()
            .saturating_add(duration.as_nanos() as u64);
        let mut entry = self.entries.entry(peer).or_insert_with(|| BanEntry {
            reason: reason.to_owned(),
            expires_at_nanos: Some(expires),
        });
        if let Some(current) = entry.expires_at_nanos {
            if current < expires {
                entry.expires_at_nanos = Some(expires);
                entry.reason = reason.to_owned();
            }
        }
        tracing::debug!(%peer, reason, ?duration, "Peer banned");
    }

    fn ban_forever(&self, peer: PeerId, reason: &str) {
        self.entries.insert(
            peer,
            BanEntry {
                reason: reason.to_owned(),
                expires_at_nanos: None,
            },
        );
        tracing::info!(%peer, reason, "Peer banned permanently");
    }

    fn unban(&self, peer: &PeerId) {
        if self.entries.remove(peer).is_some() {
            tracing::debug!(%peer, "Peer unbanned");
        }
    }
}
