use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::peer::PeerId;
use crate::transport::TransportId;

/// Work scheduled to run when a message reaches a terminal outcome.
///
/// Jobs run on whichever task reports the outcome and must not block.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A message on its way out of the router, plus everything needed to finish it.
///
/// Ownership travels with the message: the dispatcher hands it to a transport, which
/// gives it back through its [`SendCompletion`](super::SendCompletion). Cleanup
/// consumes it, so it can only happen once. A handed message dropped by its
/// transport without being finished runs its failure jobs on drop.
pub struct OutboundMessage {
    id: MessageId,
    target: PeerId,
    payload: Option<Bytes>,
    size: usize,
    /// Absolute deadline on the dispatcher's clock.
    expiration: Option<Duration>,
    on_send: Option<Job>,
    on_failed_send: Option<Job>,
    on_failed_reply: Option<Job>,
    awaits_reply: bool,
    failed_transports: BTreeSet<TransportId>,
    transport: Option<TransportId>,
    send_begin: Option<Duration>,
    /// Shared with the completion of the current hand-off; set once finished.
    settled: Option<Arc<AtomicBool>>,
}

impl OutboundMessage {
    pub fn new(id: MessageId, target: PeerId, payload: Bytes) -> Self {
        Self {
            id,
            target,
            size: payload.len(),
            payload: Some(payload),
            expiration: None,
            on_send: None,
            on_failed_send: None,
            on_failed_reply: None,
            awaits_reply: false,
            failed_transports: BTreeSet::new(),
            transport: None,
            send_begin: None,
            settled: None,
        }
    }

    pub fn expires_at(mut self, deadline: Duration) -> Self {
        self.expiration = Some(deadline);
        self
    }

    pub fn on_send(mut self, job: impl FnOnce() + Send + 'static) -> Self {
        self.on_send = Some(Box::new(job));
        self
    }

    pub fn on_failed_send(mut self, job: impl FnOnce() + Send + 'static) -> Self {
        self.on_failed_send = Some(Box::new(job));
        self
    }

    /// Job to run if no reply can arrive because the send failed. Implies
    /// [`expect_reply`](Self::expect_reply).
    pub fn on_failed_reply(mut self, job: impl FnOnce() + Send + 'static) -> Self {
        self.on_failed_reply = Some(Box::new(job));
        self.awaits_reply = true;
        self
    }

    /// A reply matcher is registered for this message and must be dropped if the
    /// send fails.
    pub fn expect_reply(mut self) -> Self {
        self.awaits_reply = true;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn target(&self) -> PeerId {
        self.target
    }

    /// `None` once the message has been finished.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Payload size in bytes, kept after the payload is released.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    pub fn is_expired(&self, now: Duration) -> bool {
        self.expiration.is_some_and(|deadline| deadline <= now)
    }

    pub fn awaits_reply(&self) -> bool {
        self.awaits_reply
    }

    /// Transports that already failed to carry this message.
    pub fn failed_transports(&self) -> &BTreeSet<TransportId> {
        &self.failed_transports
    }

    pub fn failure_count(&self) -> usize {
        self.failed_transports.len()
    }

    pub fn has_failed_on(&self, transport: TransportId) -> bool {
        self.failed_transports.contains(&transport)
    }

    /// Transport the message was last handed to.
    pub fn transport(&self) -> Option<TransportId> {
        self.transport
    }

    pub(crate) fn record_failure(&mut self, transport: TransportId) -> usize {
        self.failed_transports.insert(transport);
        self.failed_transports.len()
    }

    /// Returns the settled flag the transport's completion shares with the message.
    pub(crate) fn begin_send(&mut self, transport: TransportId, now: Duration) -> Arc<AtomicBool> {
        self.transport = Some(transport);
        self.send_begin = Some(now);
        let settled = Arc::new(AtomicBool::new(false));
        self.settled = Some(settled.clone());
        settled
    }

    pub(crate) fn send_elapsed(&self, now: Duration) -> Duration {
        self.send_begin
            .map(|begin| now.saturating_sub(begin))
            .unwrap_or_default()
    }

    pub(crate) fn take_on_send(&mut self) -> Option<Job> {
        self.on_send.take()
    }

    /// Failure jobs, send job first.
    pub(crate) fn take_failure_jobs(&mut self) -> impl Iterator<Item = Job> {
        [self.on_failed_send.take(), self.on_failed_reply.take()]
            .into_iter()
            .flatten()
    }

    pub(crate) fn discard_payload(&mut self) {
        self.payload = None;
        self.on_send = None;
        self.on_failed_send = None;
        self.on_failed_reply = None;
        if let Some(settled) = self.settled.take() {
            settled.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for OutboundMessage {
    fn drop(&mut self) {
        // only a handed message can be lost unfinished
        if self.payload.is_none() || self.transport.is_none() {
            return;
        }
        let mut ran = 0;
        for job in self.take_failure_jobs() {
            job();
            ran += 1;
        }
        if ran > 0 {
            tracing::debug!(msg_id = %self.id, target = %self.target, jobs = ran, "Dropped unfinished message");
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("size", &self.size)
            .field("discarded", &self.payload.is_none())
            .field("expiration", &self.expiration)
            .field("awaits_reply", &self.awaits_reply)
            .field("failed_transports", &self.failed_transports)
            .field("transport", &self.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn failure_jobs_are_taken_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (a, b) = (runs.clone(), runs.clone());
        let mut msg = OutboundMessage::new(MessageId::new(1), PeerId::new([1; 32]), Bytes::from_static(b"hi"))
            .on_failed_send(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_failed_reply(move || {
                b.fetch_add(10, Ordering::SeqCst);
            });
        assert!(msg.awaits_reply());
        msg.take_failure_jobs().for_each(|job| job());
        msg.take_failure_jobs().for_each(|job| job());
        assert_eq!(runs.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn failures_accumulate_per_transport() {
        let mut msg = OutboundMessage::new(MessageId::random(), PeerId::new([2; 32]), Bytes::new());
        let ntcp = TransportId::new("NTCP");
        assert_eq!(msg.record_failure(ntcp), 1);
        assert_eq!(msg.record_failure(ntcp), 1);
        assert_eq!(msg.record_failure(TransportId::new("SSU")), 2);
        assert!(msg.has_failed_on(ntcp));
    }

    #[test]
    fn expiry_is_inclusive() {
        let msg = OutboundMessage::new(MessageId::new(3), PeerId::new([3; 32]), Bytes::from_static(b"x"))
            .expires_at(Duration::from_secs(10));
        assert!(!msg.is_expired(Duration::from_secs(9)));
        assert!(msg.is_expired(Duration::from_secs(10)));
    }

    #[test]
    fn dropping_handed_message_runs_failure_jobs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = |runs: &Arc<AtomicUsize>| {
            let runs = runs.clone();
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        };
        let build = || {
            OutboundMessage::new(MessageId::new(5), PeerId::new([5; 32]), Bytes::from_static(b"x"))
                .on_failed_send(job(&runs))
        };

        // never handed out
        drop(build());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let mut finished = build();
        let settled = finished.begin_send(TransportId::new("NTCP"), Duration::ZERO);
        finished.discard_payload();
        assert!(settled.load(Ordering::SeqCst));
        drop(finished);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let mut lost = build();
        let settled = lost.begin_send(TransportId::new("NTCP"), Duration::ZERO);
        drop(lost);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!settled.load(Ordering::SeqCst));
    }

    #[test]
    fn size_survives_discard() {
        let mut msg = OutboundMessage::new(MessageId::new(4), PeerId::new([4; 32]), Bytes::from(vec![0; 64]));
        msg.discard_payload();
        assert!(msg.payload().is_none());
        assert_eq!(msg.size(), 64);
    }
}
