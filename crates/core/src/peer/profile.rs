use std::time::Duration;

use dashmap::DashMap;

use super::PeerId;
use crate::transport::TransportId;

/// Outcome of one terminal send attempt, reported to the profile store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRecord {
    /// Transport that carried (or last failed to carry) the message. `None` when
    /// no transport was ever selected.
    pub transport: Option<TransportId>,
    pub success: bool,
    /// Time from the start of the send to its outcome.
    pub elapsed: Duration,
    /// Size of the message payload in bytes.
    pub size: usize,
}

/// Peer scoring collaborator notified of every terminal dispatch outcome.
pub trait PeerProfiles: Send + Sync + 'static {
    fn record_send_result(&self, peer: &PeerId, record: SendRecord);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProfileCounters {
    pub sent: u64,
    pub failed: u64,
    pub bytes_sent: u64,
    pub last_transport: Option<TransportId>,
}

/// Minimal concurrent profile store keeping success and failure counters per peer.
#[derive(Default)]
pub struct InMemoryProfiles {
    counters: DashMap<PeerId, ProfileCounters>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self, peer: &PeerId) -> ProfileCounters {
        self.counters
            .get(peer)
            .map(|c| *c)
            .unwrap_or_default()
    }
}

impl PeerProfiles for InMemoryProfiles {
    fn record_send_result(&self, peer: &PeerId, record: SendRecord) {
        let mut counters = self.counters.entry(*peer).or_default();
        if record.success {
            counters.sent += 1;
            counters.bytes_sent += record.size as u64;
        } else {
            counters.failed += 1;
        }
        if record.transport.is_some() {
            counters.last_transport = record.transport;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_successes_and_failures() {
        let profiles = InMemoryProfiles::new();
        let peer = PeerId::new([9; 32]);
        let ntcp = TransportId::new("NTCP");
        profiles.record_send_result(
            &peer,
            SendRecord {
                transport: Some(ntcp),
                success: true,
                elapsed: Duration::from_millis(20),
                size: 512,
            },
        );
        profiles.record_send_result(
            &peer,
            SendRecord {
                transport: None,
                success: false,
                elapsed: Duration::ZERO,
                size: 512,
            },
        );
        let counters = profiles.counters(&peer);
        assert_eq!(counters.sent, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.bytes_sent, 512);
        assert_eq!(counters.last_transport, Some(ntcp));
    }
}
