//! Peer identity and the per-peer collaborators consulted during dispatch.
//!
//! The dispatcher and the reachability tracker never keep global peer state of their
//! own: the ban list and the send-result profile store are injected at construction,
//! so several independent routers (or tests) can live in one process.

mod banlist;
mod profile;

pub use banlist::{Banlist, InMemoryBanlist};
pub use profile::{InMemoryProfiles, PeerProfiles, ProfileCounters, SendRecord};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length in bytes of a router identity hash.
pub const PEER_ID_LEN: usize = 32;

/// Number of base58 characters shown when a peer id is displayed.
const DISPLAY_PREFIX: usize = 6;

/// The identity hash of a router on the network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn new(hash: [u8; PEER_ID_LEN]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Full base58 encoding of the hash.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Random identity, mostly useful for tests and simulations.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl From<[u8; PEER_ID_LEN]> for PeerId {
    fn from(hash: [u8; PEER_ID_LEN]) -> Self {
        Self(hash)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base58();
        let end = encoded.len().min(DISPLAY_PREFIX);
        write!(f, "[{}]", &encoded[..end])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}
