//! Time abstraction layer.
//!
//! This module provides:
//! - `TimeSource` trait for abstracting time operations
//! - `RealTime` implementation delegating to tokio
//! - `VirtualTime` implementation for deterministic tests
//!
//! Every time-dependent component in the crate (congestion estimation, allowance
//! refills, reachability windows, ban expiry) reads the clock through this trait, so
//! tests can step time explicitly instead of sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Abstraction over time operations supporting both real and virtual time.
pub trait TimeSource: Send + Sync + Clone + 'static {
    /// Returns the current time as nanoseconds since an arbitrary epoch.
    fn now_nanos(&self) -> u64;

    /// Returns the current time as a Duration since an arbitrary epoch.
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }

    /// Returns the current time as whole milliseconds since an arbitrary epoch.
    fn now_millis(&self) -> u64 {
        self.now_nanos() / NANOS_PER_MILLI
    }

    /// Creates a future that completes after the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Wraps a future with a timeout, returning None if the timeout expires.
    fn timeout<'a, F>(&self, duration: Duration, future: F) -> BoxFuture<'a, Option<F::Output>>
    where
        F: Future + Send + 'a,
        F::Output: Send + 'a;
}

/// Real-time implementation that delegates to tokio.
#[derive(Clone)]
pub struct RealTime {
    epoch: std::time::Instant,
}

impl Default for RealTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl TimeSource for RealTime {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn timeout<'a, F>(&self, duration: Duration, future: F) -> BoxFuture<'a, Option<F::Output>>
    where
        F: Future + Send + 'a,
        F::Output: Send + 'a,
    {
        Box::pin(async move { tokio::time::timeout(duration, future).await.ok() })
    }
}

#[derive(Debug)]
struct Deadline {
    id: u64,
    at_nanos: u64,
    waker: Option<Waker>,
}

/// Internal state for virtual time, shared across clones.
#[derive(Debug, Default)]
struct VirtualTimeState {
    current_nanos: AtomicU64,
    next_deadline_id: AtomicU64,
    /// Timeout deadlines waiting for the clock to reach them.
    deadlines: Mutex<Vec<Deadline>>,
}

impl VirtualTimeState {
    fn wake_expired(&self) {
        let now = self.current_nanos.load(Ordering::SeqCst);
        let wakers: Vec<Waker> = {
            let mut deadlines = self.deadlines.lock();
            let mut expired = Vec::new();
            deadlines.retain_mut(|deadline| {
                if deadline.at_nanos > now {
                    return true;
                }
                expired.extend(deadline.waker.take());
                false
            });
            expired
        };
        wakers.into_iter().for_each(Waker::wake);
    }
}

/// Virtual time for deterministic tests.
///
/// Time only moves when stepped via [`VirtualTime::advance`] or when a task sleeps:
/// sleeping advances the shared clock by the requested duration and yields once to
/// the runtime. A periodic loop driven by virtual time therefore runs as fast as the
/// executor allows while observing exactly the intervals it asked for.
///
/// Timeouts are the exception: their deadline never moves the clock and only fires
/// once something else advances it past the deadline.
///
/// Clones share the same clock.
#[derive(Clone, Debug)]
pub struct VirtualTime {
    state: Arc<VirtualTimeState>,
}

impl Default for VirtualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTime {
    /// Creates a new virtual time starting at 0.
    pub fn new() -> Self {
        Self::with_initial_time(0)
    }

    /// Creates a new virtual time starting at the given nanoseconds.
    pub fn with_initial_time(initial_nanos: u64) -> Self {
        Self {
            state: Arc::new(VirtualTimeState {
                current_nanos: AtomicU64::new(initial_nanos),
                ..Default::default()
            }),
        }
    }

    /// Advances time by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.state
            .current_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
        self.state.wake_expired();
    }

    /// Advances time to the given absolute nanoseconds. Moving backwards is ignored.
    pub fn advance_to(&self, target_nanos: u64) {
        self.state
            .current_nanos
            .fetch_max(target_nanos, Ordering::SeqCst);
        self.state.wake_expired();
    }

    /// Timeout deadlines not reached yet.
    pub fn pending_deadlines(&self) -> usize {
        self.state.deadlines.lock().len()
    }

    fn deadline(&self, duration: Duration) -> VirtualDeadline {
        VirtualDeadline {
            id: self.state.next_deadline_id.fetch_add(1, Ordering::Relaxed),
            at_nanos: self.now_nanos().saturating_add(duration.as_nanos() as u64),
            state: self.state.clone(),
        }
    }
}

impl TimeSource for VirtualTime {
    fn now_nanos(&self) -> u64 {
        self.state.current_nanos.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn timeout<'a, F>(&self, duration: Duration, future: F) -> BoxFuture<'a, Option<F::Output>>
    where
        F: Future + Send + 'a,
        F::Output: Send + 'a,
    {
        let deadline = self.deadline(duration);
        Box::pin(async move {
            tokio::select! {
                biased;
                result = future => Some(result),
                _ = deadline => None,
            }
        })
    }
}

/// Completes once the virtual clock reaches `at_nanos`.
struct VirtualDeadline {
    id: u64,
    at_nanos: u64,
    state: Arc<VirtualTimeState>,
}

impl Future for VirtualDeadline {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // checked under the lock so an advance in between cannot miss our waker
        let mut deadlines = self.state.deadlines.lock();
        if self.state.current_nanos.load(Ordering::SeqCst) >= self.at_nanos {
            deadlines.retain(|deadline| deadline.id != self.id);
            return Poll::Ready(());
        }
        match deadlines.iter_mut().find(|deadline| deadline.id == self.id) {
            Some(deadline) => deadline.waker = Some(cx.waker().clone()),
            None => deadlines.push(Deadline {
                id: self.id,
                at_nanos: self.at_nanos,
                waker: Some(cx.waker().clone()),
            }),
        }
        Poll::Pending
    }
}

impl Drop for VirtualDeadline {
    fn drop(&mut self) {
        self.state
            .deadlines
            .lock()
            .retain(|deadline| deadline.id != self.id);
    }
}
