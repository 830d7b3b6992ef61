//! Last known address of recently contacted peers.
//!
//! Shared by every transport: whichever one last connected to a peer records the
//! address it saw, so another transport can reuse it. The store is bounded and evicts
//! the least recently used peer when full.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use parking_lot::Mutex;

use crate::peer::PeerId;

#[derive(Debug, Default)]
struct Entries {
    ips: HashMap<PeerId, IpAddr>,
    /// Least recently used first.
    lru_order: VecDeque<PeerId>,
}

impl Entries {
    fn touch(&mut self, peer: &PeerId) {
        // Linear scan, bounded by the store capacity.
        self.lru_order.retain(|p| p != peer);
        self.lru_order.push_back(*peer);
    }
}

#[derive(Debug)]
pub struct PeerIpStore {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl PeerIpStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remember the address a transport saw for the peer. Returns `true` when the
    /// address is new or differs from the one stored before.
    pub fn set_ip(&self, peer: PeerId, ip: IpAddr) -> bool {
        let mut entries = self.entries.lock();
        let previous = entries.ips.insert(peer, ip);
        entries.touch(&peer);
        while entries.ips.len() > self.capacity {
            let Some(oldest) = entries.lru_order.pop_front() else {
                break;
            };
            entries.ips.remove(&oldest);
            tracing::trace!(peer = %oldest, "Evicted peer address");
        }
        let changed = previous != Some(ip);
        if changed {
            tracing::debug!(%peer, %ip, ?previous, "Peer address updated");
        }
        changed
    }

    /// Address from the last connection with the peer, in or out, on any transport.
    pub fn ip(&self, peer: &PeerId) -> Option<IpAddr> {
        let mut entries = self.entries.lock();
        let ip = entries.ips.get(peer).copied()?;
        entries.touch(peer);
        Some(ip)
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.ips.clear();
        entries.lru_order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
