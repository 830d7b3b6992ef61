use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;

use super::message::{MessageId, OutboundMessage};
use super::DispatchFailure;
use crate::config::DispatchSettings;
use crate::peer::{Banlist, InMemoryProfiles, PeerId, PeerProfiles, SendRecord};
use crate::transport::{select_lowest, Bid, ReachabilityTracker, Transport, TransportId};
use crate::util::time_source::{RealTime, TimeSource};

/// Temporary ban for a peer no transport is willing to reach.
pub const NO_TRANSPORT_BAN: Duration = Duration::from_secs(30 * 60);
pub const NO_TRANSPORT_BAN_LOCAL: Duration = Duration::from_secs(60);

/// Pending reply matchers, dropped when the message they wait on fails.
pub trait ReplyRegistry: Send + Sync + 'static {
    fn unregister_pending(&self, message: MessageId);
}

/// Registry for routers that never wait on replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplies;

impl ReplyRegistry for NoReplies {
    fn unregister_pending(&self, _message: MessageId) {}
}

/// What [`Dispatcher::dispatch`] did with a message. The final outcome of a handed
/// message is only known once its transport reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDisposition {
    Handed { transport: TransportId, cost: u32 },
    Failed(DispatchFailure),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub handed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub bid_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    handed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    bid_timeouts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum SendOutcome {
    Succeeded,
    Failed { allow_requeue: bool },
}

/// What the dispatcher still knows about a handed message whose completion was
/// dropped unused.
#[derive(Debug, Clone, Copy)]
struct Handoff {
    msg_id: MessageId,
    target: PeerId,
    size: usize,
    awaits_reply: bool,
    begin: Duration,
}

trait CompletionSink: Send + Sync + 'static {
    fn complete(self: Arc<Self>, msg: OutboundMessage, transport: TransportId, outcome: SendOutcome);

    fn abandoned(self: Arc<Self>, transport: TransportId, handoff: Handoff);
}

/// One-shot handle a transport uses to report how a send ended.
///
/// Consuming it hands the message back to the dispatcher, which then runs the
/// success or failure cleanup, or requeues the message onto another transport.
/// Dropping it unused counts as a failed send on its transport.
pub struct SendCompletion {
    sink: Option<Arc<dyn CompletionSink>>,
    transport: TransportId,
    handoff: Handoff,
    settled: Arc<AtomicBool>,
}

impl SendCompletion {
    pub fn transport(&self) -> TransportId {
        self.transport
    }

    pub fn succeeded(mut self, msg: OutboundMessage) {
        if let Some(sink) = self.sink.take() {
            sink.complete(msg, self.transport, SendOutcome::Succeeded);
        }
    }

    /// With `allow_requeue` the message is offered to the transports that have not
    /// failed it yet, unless it expired in the meantime.
    pub fn failed(mut self, msg: OutboundMessage, allow_requeue: bool) {
        if let Some(sink) = self.sink.take() {
            sink.complete(msg, self.transport, SendOutcome::Failed { allow_requeue });
        }
    }
}

impl Drop for SendCompletion {
    fn drop(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        // finished some other way, e.g. expired while held
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        sink.abandoned(self.transport, self.handoff);
    }
}

impl fmt::Debug for SendCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendCompletion")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

struct DispatchShared<T: TimeSource> {
    self_id: PeerId,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    banlist: Arc<dyn Banlist>,
    profiles: Arc<dyn PeerProfiles>,
    replies: Arc<dyn ReplyRegistry>,
    reachability: Arc<ReachabilityTracker<T>>,
    bid_timeout: Duration,
    no_transport_ban: Duration,
    counters: Counters,
    time_source: T,
}

impl<T: TimeSource> DispatchShared<T> {
    fn finish_success(&self, mut msg: OutboundMessage, transport: TransportId, now: Duration) {
        let target = msg.target();
        let elapsed = msg.send_elapsed(now);
        tracing::debug!(
            msg_id = %msg.id(),
            %target,
            %transport,
            ?elapsed,
            "Message sent"
        );
        if let Some(job) = msg.take_on_send() {
            job();
        }
        self.reachability.mark_reachable(&target, false);
        self.profiles.record_send_result(
            &target,
            SendRecord {
                transport: Some(transport),
                success: true,
                elapsed,
                size: msg.size(),
            },
        );
        msg.discard_payload();
        Counters::bump(&self.counters.succeeded);
    }

    /// The single failure path: jobs, reply matcher, profile, payload.
    fn finish_failure(&self, mut msg: OutboundMessage, failure: DispatchFailure, now: Duration) {
        let target = msg.target();
        tracing::debug!(
            msg_id = %msg.id(),
            %target,
            %failure,
            failed_transports = ?msg.failed_transports(),
            "Message failed"
        );
        for job in msg.take_failure_jobs() {
            job();
        }
        if msg.awaits_reply() {
            self.replies.unregister_pending(msg.id());
        }
        if failure != DispatchFailure::SelfSend {
            self.profiles.record_send_result(
                &target,
                SendRecord {
                    transport: msg.transport(),
                    success: false,
                    elapsed: msg.send_elapsed(now),
                    size: msg.size(),
                },
            );
        }
        msg.discard_payload();
        Counters::bump(&self.counters.failed);
    }

    /// Reachability consequences of a transport-level failure.
    fn penalize(&self, target: &PeerId, failure: DispatchFailure) {
        match failure {
            DispatchFailure::NoTransports => {
                self.banlist
                    .ban(*target, "no transports available", self.no_transport_ban);
                self.reachability.mark_unreachable(target);
            }
            DispatchFailure::AllTransportsFailed | DispatchFailure::TransportFailed { .. } => {
                self.reachability.mark_unreachable(target);
            }
            DispatchFailure::Banned | DispatchFailure::SelfSend | DispatchFailure::Expired => {}
        }
    }
}

impl<T: TimeSource> CompletionSink for DispatchShared<T> {
    fn abandoned(self: Arc<Self>, transport: TransportId, handoff: Handoff) {
        let now = self.time_source.now();
        tracing::warn!(
            msg_id = %handoff.msg_id,
            target = %handoff.target,
            %transport,
            "Transport dropped send completion without reporting"
        );
        if handoff.awaits_reply {
            self.replies.unregister_pending(handoff.msg_id);
        }
        self.profiles.record_send_result(
            &handoff.target,
            SendRecord {
                transport: Some(transport),
                success: false,
                elapsed: now.saturating_sub(handoff.begin),
                size: handoff.size,
            },
        );
        Counters::bump(&self.counters.failed);
        self.penalize(&handoff.target, DispatchFailure::TransportFailed { transport });
    }

    fn complete(self: Arc<Self>, mut msg: OutboundMessage, transport: TransportId, outcome: SendOutcome) {
        let now = self.time_source.now();
        let allow_requeue = match outcome {
            SendOutcome::Succeeded => {
                self.finish_success(msg, transport, now);
                return;
            }
            SendOutcome::Failed { allow_requeue } => allow_requeue,
        };

        let failures = msg.record_failure(transport);
        let expired = msg.is_expired(now);
        tracing::debug!(
            msg_id = %msg.id(),
            target = %msg.target(),
            %transport,
            failures,
            allow_requeue,
            expired,
            "Transport failed to send"
        );

        if allow_requeue && !expired && msg.payload().is_some() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    Counters::bump(&self.counters.requeued);
                    let dispatcher = Dispatcher { shared: self };
                    handle.spawn(async move {
                        dispatcher.dispatch(msg).await;
                    });
                    return;
                }
                Err(_) => {
                    tracing::warn!(msg_id = %msg.id(), "No runtime to requeue on, failing message");
                }
            }
        }

        let failure = if expired {
            DispatchFailure::Expired
        } else {
            DispatchFailure::TransportFailed { transport }
        };
        let target = msg.target();
        self.finish_failure(msg, failure, now);
        self.penalize(&target, failure);
    }
}

/// Chooses a transport for every outbound message.
///
/// Cheap to clone; clones share transports and state.
pub struct Dispatcher<T: TimeSource = RealTime> {
    shared: Arc<DispatchShared<T>>,
}

impl<T: TimeSource> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: TimeSource> Dispatcher<T> {
    pub fn builder(
        self_id: PeerId,
        banlist: Arc<dyn Banlist>,
        reachability: Arc<ReachabilityTracker<T>>,
    ) -> DispatcherBuilder<T> {
        DispatcherBuilder {
            self_id,
            banlist,
            reachability,
            profiles: Arc::new(InMemoryProfiles::new()),
            replies: Arc::new(NoReplies),
            bid_timeout: DispatchSettings::default().bid_timeout(),
            no_transport_ban: NO_TRANSPORT_BAN,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.shared.self_id
    }

    pub fn reachability(&self) -> &Arc<ReachabilityTracker<T>> {
        &self.shared.reachability
    }

    /// Add a transport. Registration order breaks ties between equal bids.
    /// Returns `false` if a transport with the same id is already registered.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> bool {
        let mut transports = self.shared.transports.write();
        let id = transport.id();
        if transports.iter().any(|t| t.id() == id) {
            tracing::warn!(transport = %id, "Transport already registered");
            return false;
        }
        transports.push(transport);
        tracing::info!(transport = %id, "Registered transport");
        true
    }

    pub fn transport_count(&self) -> usize {
        self.shared.transports.read().len()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.shared.counters;
        DispatchStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            handed: c.handed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            bid_timeouts: c.bid_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Route a message to the cheapest willing transport.
    ///
    /// Returns once the message was handed over or failed; the send itself completes
    /// later through the transport's [`SendCompletion`].
    pub async fn dispatch(&self, mut msg: OutboundMessage) -> DispatchDisposition {
        let shared = &self.shared;
        Counters::bump(&shared.counters.dispatched);
        let target = msg.target();
        let now = shared.time_source.now();
        let transports: Vec<Arc<dyn Transport>> = shared.transports.read().clone();

        let rejected = if shared.banlist.is_banned_forever(&target) {
            Some(DispatchFailure::Banned)
        } else if target == shared.self_id {
            Some(DispatchFailure::SelfSend)
        } else if msg.is_expired(now) {
            Some(DispatchFailure::Expired)
        } else if !transports.is_empty() && msg.failure_count() >= transports.len() {
            Some(DispatchFailure::AllTransportsFailed)
        } else {
            None
        };
        if let Some(failure) = rejected {
            shared.finish_failure(msg, failure, now);
            shared.penalize(&target, failure);
            return DispatchDisposition::Failed(failure);
        }

        let size = msg.size();
        let bid_timeout = shared.bid_timeout;
        let counters = &shared.counters;
        let time_source = &shared.time_source;
        let bids: Vec<Option<Bid>> = join_all(transports.iter().map(|transport| {
            let skip = msg.has_failed_on(transport.id());
            async move {
                if skip {
                    return None;
                }
                let id = transport.id();
                match time_source.timeout(bid_timeout, transport.bid(&target, size)).await {
                    // stamp with the asking transport so selection maps back to it
                    Some(bid) => bid.map(|bid| Bid::new(bid.cost(), id)),
                    None => {
                        Counters::bump(&counters.bid_timeouts);
                        tracing::debug!(transport = %id, %target, ?bid_timeout, "Bid timed out");
                        None
                    }
                }
            }
        }))
        .await;

        let selected = select_lowest(bids.iter().flatten().copied()).and_then(|bid| {
            bids.iter()
                .position(|candidate| *candidate == Some(bid))
                .map(|index| (bid, index))
        });
        let Some((bid, index)) = selected else {
            let failure = if msg.failure_count() == 0 {
                DispatchFailure::NoTransports
            } else {
                DispatchFailure::AllTransportsFailed
            };
            shared.finish_failure(msg, failure, now);
            if transports.is_empty() {
                tracing::warn!(%target, "No transports registered");
            } else {
                shared.penalize(&target, failure);
            }
            return DispatchDisposition::Failed(failure);
        };

        let transport = &transports[index];
        tracing::trace!(msg_id = %msg.id(), %target, %bid, "Selected transport");
        let settled = msg.begin_send(bid.transport(), now);
        Counters::bump(&shared.counters.handed);
        let sink: Arc<dyn CompletionSink> = self.shared.clone();
        let handoff = Handoff {
            msg_id: msg.id(),
            target,
            size,
            awaits_reply: msg.awaits_reply(),
            begin: now,
        };
        transport.send(
            msg,
            SendCompletion {
                sink: Some(sink),
                transport: bid.transport(),
                handoff,
                settled,
            },
        );
        DispatchDisposition::Handed {
            transport: bid.transport(),
            cost: bid.cost(),
        }
    }

    /// Fail a message that timed out while queued outside the dispatcher.
    pub fn expire(&self, msg: OutboundMessage) {
        let now = self.shared.time_source.now();
        self.shared
            .finish_failure(msg, DispatchFailure::Expired, now);
    }
}

pub struct DispatcherBuilder<T: TimeSource> {
    self_id: PeerId,
    banlist: Arc<dyn Banlist>,
    reachability: Arc<ReachabilityTracker<T>>,
    profiles: Arc<dyn PeerProfiles>,
    replies: Arc<dyn ReplyRegistry>,
    bid_timeout: Duration,
    no_transport_ban: Duration,
}

impl<T: TimeSource> DispatcherBuilder<T> {
    pub fn settings(mut self, settings: &DispatchSettings) -> Self {
        self.bid_timeout = settings.bid_timeout();
        self
    }

    /// Local test networks get a short ban for unroutable peers.
    pub fn allow_local(mut self, allow_local: bool) -> Self {
        self.no_transport_ban = if allow_local {
            NO_TRANSPORT_BAN_LOCAL
        } else {
            NO_TRANSPORT_BAN
        };
        self
    }

    pub fn profiles(mut self, profiles: Arc<dyn PeerProfiles>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn replies(mut self, replies: Arc<dyn ReplyRegistry>) -> Self {
        self.replies = replies;
        self
    }

    pub fn build(self) -> Dispatcher<T> {
        let time_source = self.reachability.time_source().clone();
        Dispatcher {
            shared: Arc::new(DispatchShared {
                self_id: self.self_id,
                transports: RwLock::new(Vec::new()),
                banlist: self.banlist,
                profiles: self.profiles,
                replies: self.replies,
                reachability: self.reachability,
                bid_timeout: self.bid_timeout,
                no_transport_ban: self.no_transport_ban,
                counters: Counters::default(),
                time_source,
            }),
        }
    }
}
