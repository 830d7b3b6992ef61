//! End-to-end dispatch through mock transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use testresult::TestResult;
use tokio::sync::{oneshot, watch};
use tunnelgate::{
    config::{DispatchSettings, ReachabilitySettings},
    dispatch::{
        DispatchDisposition, DispatchFailure, Dispatcher, MessageId, OutboundMessage,
        ReplyRegistry, SendCompletion,
    },
    peer::{Banlist, InMemoryBanlist, InMemoryProfiles, PeerId},
    transport::{Bid, ConnectivityStatus, ReachabilityTracker, Transport, TransportId, TRANSIENT_FAIL},
    util::time_source::VirtualTime,
};

const NTCP: TransportId = TransportId::new("NTCP");
const SSU: TransportId = TransportId::new("SSU");
const SELF: PeerId = PeerId::new([0; 32]);

enum Behavior {
    Succeed,
    Fail { requeue: bool },
    /// Keep the message, as a transport with a slow send would.
    Hold,
    /// Lose both the message and the completion without reporting.
    Drop,
}

struct MockTransport {
    id: TransportId,
    cost: Option<u32>,
    /// Bid never answers.
    stalled: bool,
    behavior: Behavior,
    bid_calls: AtomicUsize,
    sends: AtomicUsize,
    held: Mutex<Vec<(OutboundMessage, SendCompletion)>>,
}

impl MockTransport {
    fn new(id: TransportId, cost: Option<u32>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id,
            cost,
            stalled: false,
            behavior,
            bid_calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
        })
    }

    fn stalled(id: TransportId, cost: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            cost: Some(cost),
            stalled: true,
            behavior: Behavior::Succeed,
            bid_calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
        })
    }

    fn bid_calls(&self) -> usize {
        self.bid_calls.load(Ordering::SeqCst)
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn bid(&self, _target: &PeerId, _size_hint: usize) -> BoxFuture<'_, Option<Bid>> {
        self.bid_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if self.stalled {
                std::future::pending::<()>().await;
            }
            self.cost.map(|cost| Bid::new(cost, self.id))
        })
    }

    fn send(&self, msg: OutboundMessage, completion: SendCompletion) {
        self.sends.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => completion.succeeded(msg),
            Behavior::Fail { requeue } => completion.failed(msg, requeue),
            Behavior::Hold => self.held.lock().push((msg, completion)),
            Behavior::Drop => drop((msg, completion)),
        }
    }
}

#[derive(Default)]
struct RecordingReplies {
    unregistered: Mutex<Vec<MessageId>>,
}

impl ReplyRegistry for RecordingReplies {
    fn unregister_pending(&self, message: MessageId) {
        self.unregistered.lock().push(message);
    }
}

struct Harness {
    time: VirtualTime,
    banlist: Arc<InMemoryBanlist<VirtualTime>>,
    profiles: Arc<InMemoryProfiles>,
    replies: Arc<RecordingReplies>,
    dispatcher: Dispatcher<VirtualTime>,
    _status: watch::Sender<ConnectivityStatus>,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(DispatchSettings::default())
    }

    fn with_settings(settings: DispatchSettings) -> Self {
        let time = VirtualTime::new();
        let banlist = Arc::new(InMemoryBanlist::with_time_source(time.clone()));
        let (status_tx, status) = watch::channel(ConnectivityStatus::Ok);
        let reachability = Arc::new(ReachabilityTracker::with_time_source(
            &ReachabilitySettings::default(),
            banlist.clone(),
            status,
            time.clone(),
        ));
        let profiles = Arc::new(InMemoryProfiles::new());
        let replies = Arc::new(RecordingReplies::default());
        let dispatcher = Dispatcher::builder(SELF, banlist.clone(), reachability)
            .settings(&settings)
            .profiles(profiles.clone())
            .replies(replies.clone())
            .build();
        Self {
            time,
            banlist,
            profiles,
            replies,
            dispatcher,
            _status: status_tx,
        }
    }

    fn register(&self, transport: &Arc<MockTransport>) {
        assert!(self.dispatcher.register_transport(transport.clone()));
    }
}

fn peer(byte: u8) -> PeerId {
    PeerId::new([byte; 32])
}

fn message(id: u64, target: PeerId) -> OutboundMessage {
    OutboundMessage::new(MessageId::new(id), target, Bytes::from_static(b"tunnel build request"))
}

#[tokio::test]
async fn lowest_bid_wins() -> TestResult {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(50), Behavior::Succeed);
    let ssu = MockTransport::new(SSU, Some(30), Behavior::Succeed);
    h.register(&ntcp);
    h.register(&ssu);

    let (sent_tx, sent_rx) = oneshot::channel();
    let msg = message(1, peer(1)).on_send(move || {
        let _ = sent_tx.send(());
    });
    let outcome = h.dispatcher.dispatch(msg).await;

    assert_eq!(
        outcome,
        DispatchDisposition::Handed {
            transport: SSU,
            cost: 30
        }
    );
    sent_rx.await?;
    assert_eq!(ntcp.sends(), 0);
    assert_eq!(ssu.sends(), 1);
    assert_eq!(h.profiles.counters(&peer(1)).sent, 1);
    assert_eq!(h.profiles.counters(&peer(1)).last_transport, Some(SSU));
    Ok(())
}

#[tokio::test]
async fn equal_bids_go_to_first_registered() {
    let h = Harness::new();
    let ssu = MockTransport::new(SSU, Some(10), Behavior::Succeed);
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Succeed);
    h.register(&ssu);
    h.register(&ntcp);

    let outcome = h.dispatcher.dispatch(message(2, peer(2))).await;
    assert_eq!(
        outcome,
        DispatchDisposition::Handed {
            transport: SSU,
            cost: 10
        }
    );
}

#[tokio::test]
async fn banned_target_is_rejected_before_bidding() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Succeed);
    h.register(&ntcp);
    h.banlist.ban_forever(peer(3), "hostile");

    let failed = Arc::new(AtomicUsize::new(0));
    let counter = failed.clone();
    let msg = message(3, peer(3)).on_failed_send(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let outcome = h.dispatcher.dispatch(msg).await;

    assert_eq!(outcome, DispatchDisposition::Failed(DispatchFailure::Banned));
    assert_eq!(ntcp.bid_calls(), 0);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert!(!h.dispatcher.reachability().is_unreachable(&peer(3)));
}

#[tokio::test]
async fn requeue_tries_each_transport_once() -> TestResult {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Fail { requeue: true });
    let ssu = MockTransport::new(SSU, Some(20), Behavior::Fail { requeue: true });
    h.register(&ntcp);
    h.register(&ssu);

    let (failed_tx, failed_rx) = oneshot::channel();
    let msg = message(4, peer(4)).on_failed_send(move || {
        let _ = failed_tx.send(());
    });
    let outcome = h.dispatcher.dispatch(msg).await;
    assert_eq!(
        outcome,
        DispatchDisposition::Handed {
            transport: NTCP,
            cost: 10
        }
    );

    tokio::time::timeout(Duration::from_secs(5), failed_rx).await??;
    assert_eq!(ntcp.sends(), 1);
    assert_eq!(ssu.sends(), 1);
    // the failed transport is skipped when bidding again
    assert_eq!(ntcp.bid_calls(), 1);
    assert_eq!(ssu.bid_calls(), 2);

    let stats = h.dispatcher.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 0);
    assert!(h.dispatcher.reachability().is_unreachable(&peer(4)));
    assert!(!h.banlist.is_banned(&peer(4)));
    Ok(())
}

#[tokio::test]
async fn no_willing_transport_bans_target_temporarily() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, None, Behavior::Succeed);
    let ssu = MockTransport::new(SSU, None, Behavior::Succeed);
    h.register(&ntcp);
    h.register(&ssu);

    let outcome = h.dispatcher.dispatch(message(5, peer(5))).await;

    assert_eq!(outcome, DispatchDisposition::Failed(DispatchFailure::NoTransports));
    assert!(h.banlist.is_banned(&peer(5)));
    assert!(!h.banlist.is_banned_forever(&peer(5)));
    assert!(h.dispatcher.reachability().is_unreachable(&peer(5)));
    assert_eq!(h.profiles.counters(&peer(5)).failed, 1);

    h.time.advance(Duration::from_secs(31 * 60));
    assert!(!h.banlist.is_banned(&peer(5)));
}

#[tokio::test]
async fn sentinel_bids_count_as_no_bid() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(TRANSIENT_FAIL), Behavior::Succeed);
    h.register(&ntcp);

    let outcome = h.dispatcher.dispatch(message(6, peer(6))).await;
    assert_eq!(outcome, DispatchDisposition::Failed(DispatchFailure::NoTransports));
    assert_eq!(ntcp.sends(), 0);
}

#[tokio::test]
async fn stalled_bids_time_out_on_dispatcher_clock() {
    let h = Harness::with_settings(DispatchSettings { bid_timeout_ms: 250 });
    let slow = MockTransport::stalled(NTCP, 1);
    let fast = MockTransport::new(SSU, Some(50), Behavior::Succeed);
    h.register(&slow);
    h.register(&fast);

    let advance = async {
        tokio::task::yield_now().await;
        h.time.advance(Duration::from_millis(249));
        tokio::task::yield_now().await;
        assert_eq!(h.dispatcher.stats().handed, 0, "deadline not reached yet");
        h.time.advance(Duration::from_millis(1));
    };
    let (outcome, ()) = tokio::join!(h.dispatcher.dispatch(message(7, peer(7))), advance);

    assert_eq!(
        outcome,
        DispatchDisposition::Handed {
            transport: SSU,
            cost: 50
        }
    );
    assert_eq!(h.dispatcher.stats().bid_timeouts, 1);
    assert_eq!(slow.sends(), 0);
    assert_eq!(h.time.pending_deadlines(), 0);
}

#[tokio::test]
async fn expired_message_fails_without_bidding() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Succeed);
    h.register(&ntcp);
    h.time.advance(Duration::from_secs(20));

    let msg = message(8, peer(8))
        .expires_at(Duration::from_secs(10))
        .expect_reply();
    let outcome = h.dispatcher.dispatch(msg).await;

    assert_eq!(outcome, DispatchDisposition::Failed(DispatchFailure::Expired));
    assert_eq!(ntcp.bid_calls(), 0);
    assert_eq!(*h.replies.unregistered.lock(), vec![MessageId::new(8)]);
    assert!(!h.dispatcher.reachability().is_unreachable(&peer(8)));
}

#[tokio::test]
async fn expire_runs_failure_cleanup_for_held_message() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Hold);
    h.register(&ntcp);

    let jobs = Arc::new(AtomicUsize::new(0));
    let (on_send, on_failed_send, on_failed_reply) = (jobs.clone(), jobs.clone(), jobs.clone());
    let msg = message(9, peer(9))
        .on_send(move || {
            on_send.fetch_add(100, Ordering::SeqCst);
        })
        .on_failed_send(move || {
            on_failed_send.fetch_add(1, Ordering::SeqCst);
        })
        .on_failed_reply(move || {
            on_failed_reply.fetch_add(10, Ordering::SeqCst);
        });
    h.dispatcher.dispatch(msg).await;

    let (held, _completion) = ntcp.held.lock().pop().expect("message held by transport");
    assert_eq!(held.transport(), Some(NTCP));
    h.dispatcher.expire(held);

    assert_eq!(jobs.load(Ordering::SeqCst), 11);
    assert_eq!(*h.replies.unregistered.lock(), vec![MessageId::new(9)]);
    assert_eq!(h.profiles.counters(&peer(9)).failed, 1);
}

#[tokio::test]
async fn terminal_transport_failure_marks_unreachable() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Fail { requeue: false });
    let ssu = MockTransport::new(SSU, Some(20), Behavior::Succeed);
    h.register(&ntcp);
    h.register(&ssu);

    h.dispatcher.dispatch(message(10, peer(10))).await;

    assert_eq!(ssu.sends(), 0);
    assert!(h.dispatcher.reachability().is_unreachable(&peer(10)));
    assert!(h.dispatcher.reachability().was_unreachable(&peer(10)));
    assert_eq!(h.profiles.counters(&peer(10)).failed, 1);
    assert_eq!(h.profiles.counters(&peer(10)).last_transport, Some(NTCP));
}

#[tokio::test]
async fn successful_send_clears_unreachable_marks() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Succeed);
    h.register(&ntcp);
    let reachability = h.dispatcher.reachability();
    reachability.mark_unreachable(&peer(11));
    assert!(reachability.was_unreachable(&peer(11)));

    h.dispatcher.dispatch(message(11, peer(11))).await;

    assert!(!reachability.is_unreachable(&peer(11)));
    assert!(!reachability.was_unreachable(&peer(11)));
}

#[tokio::test]
async fn reachable_peer_is_forgiven_permanent_ban() {
    let h = Harness::new();
    let reachability = h.dispatcher.reachability();
    h.banlist.ban_forever(peer(12), "unreachable forever");

    reachability.mark_reachable(&peer(12), true);

    assert!(!h.banlist.is_banned(&peer(12)));
}

#[tokio::test]
async fn dropped_completion_runs_failure_cleanup() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Drop);
    h.register(&ntcp);

    let jobs = Arc::new(AtomicUsize::new(0));
    let (on_send, on_failed_send) = (jobs.clone(), jobs.clone());
    let msg = message(13, peer(13))
        .on_send(move || {
            on_send.fetch_add(100, Ordering::SeqCst);
        })
        .on_failed_send(move || {
            on_failed_send.fetch_add(1, Ordering::SeqCst);
        })
        .expect_reply();
    let outcome = h.dispatcher.dispatch(msg).await;

    assert_eq!(
        outcome,
        DispatchDisposition::Handed {
            transport: NTCP,
            cost: 10
        }
    );
    assert_eq!(jobs.load(Ordering::SeqCst), 1);
    assert_eq!(h.dispatcher.stats().failed, 1);
    assert_eq!(*h.replies.unregistered.lock(), vec![MessageId::new(13)]);
    assert_eq!(h.profiles.counters(&peer(13)).failed, 1);
    assert!(h.dispatcher.reachability().is_unreachable(&peer(13)));
}

#[tokio::test]
async fn completion_dropped_after_expiry_is_not_counted_twice() {
    let h = Harness::new();
    let ntcp = MockTransport::new(NTCP, Some(10), Behavior::Hold);
    h.register(&ntcp);
    h.dispatcher.dispatch(message(14, peer(14))).await;

    let (held, completion) = ntcp.held.lock().pop().expect("message held by transport");
    h.dispatcher.expire(held);
    drop(completion);

    assert_eq!(h.dispatcher.stats().failed, 1);
    assert_eq!(h.profiles.counters(&peer(14)).failed, 1);
    assert!(!h.dispatcher.reachability().is_unreachable(&peer(14)));
}
