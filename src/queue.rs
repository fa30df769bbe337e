//! Priority-ordered, concurrency-bounded dispatch.
//!
//! At most `max_concurrency` operations execute at once. Waiting operations are dispatched
//! highest [`Priority`] first, ties in arrival order. A finishing operation frees its slot and
//! immediately drains the next waiter, which is the backpressure for the whole layer.
//!
//! Only waiting operations can be evicted ([`PriorityRequestQueue::clear_queue`]); dispatched
//! operations always run to completion and report through their [`ResultHandle`] exactly once.

use crate::error::GovernanceError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Dispatch priority. Larger values are dispatched sooner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

/// Identifier assigned at enqueue time; also the arrival order.
pub type OperationId = u64;

trait Dispatch: Send {
    /// Invoke the factory and return the work to drive to completion.
    fn start(self: Box<Self>) -> BoxFuture<'static, ()>;
    /// Fail the operation without running it.
    fn evict(self: Box<Self>);
}

struct Pending<T, E, F> {
    factory: F,
    reply: oneshot::Sender<Result<T, GovernanceError<E>>>,
}

impl<T, E, F, Fut> Dispatch for Pending<T, E, F>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, GovernanceError<E>>> + Send + 'static,
{
    fn start(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Pending { factory, reply } = *self;
        let work = factory();
        Box::pin(async move {
            // A dropped handle means the caller stopped listening; the work still ran.
            let _ = reply.send(work.await);
        })
    }

    fn evict(self: Box<Self>) {
        let _ = self.reply.send(Err(GovernanceError::QueueCleared));
    }
}

struct Waiting {
    id: OperationId,
    priority: Priority,
    op: Box<dyn Dispatch>,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    // Max-heap: higher priority first, then the earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.id.cmp(&self.id))
    }
}

struct State {
    waiting: BinaryHeap<Waiting>,
    active: usize,
    max_concurrency: usize,
    next_id: OperationId,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    // Every critical section leaves the state consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(shared: &Arc<Shared>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(target: "fetchgate::queue", "no tokio runtime; dispatch deferred");
            return;
        };
        loop {
            let next = {
                let mut state = shared.lock();
                if state.active >= state.max_concurrency {
                    return;
                }
                match state.waiting.pop() {
                    Some(next) => {
                        state.active += 1;
                        next
                    }
                    None => return,
                }
            };
            let slot = ActiveSlot { shared: shared.clone() };
            tracing::trace!(target: "fetchgate::queue", id = next.id, priority = next.priority.0, "dispatching");
            let work = next.op.start();
            runtime.spawn(async move {
                work.await;
                drop(slot);
            });
        }
    }
}

/// Releases one active slot when dropped, including on panic, and drains the next waiter.
struct ActiveSlot {
    shared: Arc<Shared>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.active = state.active.saturating_sub(1);
        }
        Shared::drain(&self.shared);
    }
}

/// Bounded-concurrency priority queue. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct PriorityRequestQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PriorityRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("PriorityRequestQueue")
            .field("waiting", &state.waiting.len())
            .field("active", &state.active)
            .field("max_concurrency", &state.max_concurrency)
            .finish()
    }
}

impl Default for PriorityRequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl PriorityRequestQueue {
    /// `max_concurrency` is clamped to at least one slot.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    waiting: BinaryHeap::new(),
                    active: 0,
                    max_concurrency: max_concurrency.max(1),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Queue `factory` and dispatch whatever the free slots allow.
    ///
    /// The factory is invoked when the operation is dispatched, not when it is enqueued. Must be
    /// called from within a tokio runtime.
    pub fn enqueue<T, E, F, Fut>(&self, factory: F, priority: impl Into<Priority>) -> ResultHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, GovernanceError<E>>> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.waiting.push(Waiting {
                id,
                priority: priority.into(),
                op: Box::new(Pending { factory, reply }),
            });
            id
        };
        Shared::drain(&self.shared);
        ResultHandle { id, receiver }
    }

    /// Fail every waiting operation with `QueueCleared`. Active operations are unaffected.
    ///
    /// Returns how many operations were evicted.
    pub fn clear_queue(&self) -> usize {
        let evicted: Vec<Waiting> = self.shared.lock().waiting.drain().collect();
        let count = evicted.len();
        for waiting in evicted {
            waiting.op.evict();
        }
        if count > 0 {
            tracing::info!(target: "fetchgate::queue", evicted = count, "waiting operations cleared");
        }
        count
    }

    /// Change the concurrency bound. Growing it dispatches waiters immediately; shrinking it lets
    /// active operations finish.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.shared.lock().max_concurrency = max_concurrency.max(1);
        Shared::drain(&self.shared);
    }

    pub fn max_concurrency(&self) -> usize {
        self.shared.lock().max_concurrency
    }

    /// Operations waiting for a slot.
    pub fn queue_size(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    /// Operations currently executing.
    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }
}

/// Resolves once with the queued operation's outcome.
#[derive(Debug)]
pub struct ResultHandle<T, E> {
    id: OperationId,
    receiver: oneshot::Receiver<Result<T, GovernanceError<E>>>,
}

impl<T, E> ResultHandle<T, E> {
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl<T, E> Future for ResultHandle<T, E> {
    type Output = Result<T, GovernanceError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(GovernanceError::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    type Handle<T> = ResultHandle<T, TestError>;

    #[tokio::test]
    async fn dispatches_by_priority_then_arrival() {
        let queue = PriorityRequestQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<Handle<&'static str>> = [(5, "first 5"), (1, "1"), (5, "second 5"), (3, "3")]
            .into_iter()
            .map(|(priority, label)| {
                let order = order.clone();
                queue.enqueue(
                    move || {
                        order.lock().unwrap().push(label);
                        async move {
                            tokio::task::yield_now().await;
                            Ok(label)
                        }
                    },
                    priority,
                )
            })
            .collect();

        assert_eq!(queue.active_count(), 1);
        assert_eq!(queue.queue_size(), 3);

        let results = futures::future::join_all(handles).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(*order.lock().unwrap(), vec!["first 5", "second 5", "3", "1"]);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrency() {
        let queue = PriorityRequestQueue::new(4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<Handle<usize>> = (0..10)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                let observer = queue.clone();
                queue.enqueue(
                    move || async move {
                        let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        assert!(observer.active_count() <= 4);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok(i)
                    },
                    0,
                )
            })
            .collect();

        assert!(queue.active_count() <= 4);
        assert_eq!(queue.queue_size(), 6);

        let results = futures::future::join_all(handles).await;
        assert_eq!(results.into_iter().filter_map(Result::ok).count(), 10);
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 4);
    }

    #[tokio::test]
    async fn clear_queue_fails_only_waiting_operations() {
        let queue = PriorityRequestQueue::new(1);
        let (release, gate) = oneshot::channel::<()>();

        let active: Handle<&'static str> = queue.enqueue(
            move || async move {
                let _ = gate.await;
                Ok("finished")
            },
            0,
        );
        let waiting_a: Handle<&'static str> = queue.enqueue(|| async { Ok("a") }, 1);
        let waiting_b: Handle<&'static str> = queue.enqueue(|| async { Ok("b") }, 2);

        assert_eq!(queue.clear_queue(), 2);
        assert_eq!(queue.queue_size(), 0);
        assert_eq!(queue.active_count(), 1);

        assert_eq!(waiting_a.await, Err(GovernanceError::QueueCleared));
        assert_eq!(waiting_b.await, Err(GovernanceError::QueueCleared));

        release.send(()).unwrap();
        assert_eq!(active.await, Ok("finished"));
    }

    #[tokio::test]
    async fn failures_are_delivered_and_free_the_slot() {
        let queue = PriorityRequestQueue::new(1);
        let failing: Handle<()> =
            queue.enqueue(|| async { Err(GovernanceError::Transport(TestError("down"))) }, 0);
        let next: Handle<u8> = queue.enqueue(|| async { Ok(7) }, 0);

        assert_eq!(failing.await, Err(GovernanceError::Transport(TestError("down"))));
        assert_eq!(next.await, Ok(7));
    }

    #[tokio::test]
    async fn panicking_operation_resolves_aborted() {
        let queue = PriorityRequestQueue::new(1);
        fn explode() -> GovernanceError<TestError> {
            panic!("operation blew up")
        }
        let boom: Handle<()> = queue.enqueue(|| async { Err(explode()) }, 0);
        let after: Handle<&'static str> = queue.enqueue(|| async { Ok("still runs") }, 0);

        assert_eq!(boom.await, Err(GovernanceError::Aborted));
        assert_eq!(after.await, Ok("still runs"));
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn growing_concurrency_dispatches_waiters() {
        let queue = PriorityRequestQueue::new(1);
        let (release, gate) = oneshot::channel::<()>();
        let blocker: Handle<()> = queue.enqueue(
            move || async move {
                let _ = gate.await;
                Ok(())
            },
            0,
        );
        let waiter: Handle<&'static str> = queue.enqueue(|| async { Ok("ran") }, 0);
        assert_eq!(queue.queue_size(), 1);

        queue.set_max_concurrency(2);
        assert_eq!(queue.queue_size(), 0);
        assert_eq!(waiter.await, Ok("ran"));

        release.send(()).unwrap();
        assert_eq!(blocker.await, Ok(()));
    }

    #[test]
    fn priority_constants_are_ordered() {
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
        assert_eq!(Priority::from(3), Priority(3));
    }
}
