//! Keyed operation queue: strict FIFO per key, concurrency across keys.
//!
//! Each key owns a lane: a FIFO of pending jobs plus a running flag, behind
//! the lane's own mutex. A lane is Idle (not running, nothing pending) or
//! Running (one blocking worker popping jobs until the FIFO is empty).
//!
//! Lock order is always lane map shard, then lane. `enqueue` holds the shard
//! entry while it pushes, and the worker reclaims an idle lane with
//! `remove_if` under the same shard lock, so a push can never land in a lane
//! that is being removed.
//!
//! Submission never blocks on execution: `enqueue` pushes, dispatches a
//! worker if the lane was idle, and returns a [`Pending`] immediately.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use crate::error::{OperationError, panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct LaneState {
    pending: VecDeque<Job>,
    running: bool,
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // Jobs never run under this lock, so a poisoned guard still holds a
        // consistent FIFO.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.running && state.pending.is_empty()
    }
}

struct QueueInner {
    lanes: DashMap<Arc<str>, Arc<Lane>>,
    /// Tracks every lane worker so `shutdown` can wait for all of them.
    tracker: TaskTracker,
    /// `true` while accepting. Enqueue holds the read side across dispatch.
    accepting: RwLock<bool>,
    in_flight: AtomicUsize,
    runtime: Handle,
}

impl QueueInner {
    /// Worker body for one lane. Runs on a blocking thread.
    fn run_lane(&self, key: &Arc<str>, lane: &Lane) {
        tracing::trace!(%key, "Lane worker started");
        let mut completed = 0usize;
        loop {
            let job = {
                let mut state = lane.lock();
                match state.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        break;
                    }
                }
            };
            job();
            completed += 1;
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        // Reclaim the lane unless an enqueue slipped in after we went idle.
        let removed = self.lanes.remove_if(key, |_, lane| lane.is_idle()).is_some();
        tracing::trace!(%key, completed, removed, "Lane worker idle");
    }
}

/// Queue guaranteeing per-key ordering and at most one running job per key.
///
/// Cheap to clone; clones share the same lanes.
#[derive(Clone)]
pub struct KeyedQueue {
    inner: Arc<QueueInner>,
}

impl KeyedQueue {
    /// Create a queue whose lane workers run on `runtime`'s blocking pool.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                lanes: DashMap::new(),
                tracker: TaskTracker::new(),
                accepting: RwLock::new(true),
                in_flight: AtomicUsize::new(0),
                runtime,
            }),
        }
    }

    /// Queue `action` behind every earlier action for `key`.
    ///
    /// The action runs on a blocking worker, never on the caller's thread.
    /// An error or panic resolves only this action's future; the key moves
    /// on to its next item regardless.
    pub fn enqueue<T, F>(&self, key: impl Into<Arc<str>>, action: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, OperationError> + Send + 'static,
    {
        let key = key.into();
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(result) => result,
                Err(payload) => Err(OperationError::Panicked(panic_message(payload.as_ref()))),
            };
            // Caller may have stopped waiting; the work is done either way.
            let _ = tx.send(outcome);
        });

        let accepting = self
            .inner
            .accepting
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            tracing::debug!(%key, "Rejected enqueue on closed queue");
            return Pending::failed(OperationError::QueueClosed);
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let idle_lane = {
            let entry = self.inner.lanes.entry(Arc::clone(&key)).or_default();
            let mut state = entry.lock();
            state.pending.push_back(job);
            if state.running {
                None
            } else {
                state.running = true;
                Some(Arc::clone(entry.value()))
            }
        };

        if let Some(lane) = idle_lane {
            self.dispatch(key, lane);
        }
        drop(accepting);

        Pending::waiting(rx)
    }

    fn dispatch(&self, key: Arc<str>, lane: Arc<Lane>) {
        let inner = Arc::clone(&self.inner);
        tracing::trace!(%key, "Dispatching lane worker");
        self.inner.tracker.spawn_blocking_on(
            move || inner.run_lane(&key, &lane),
            &self.inner.runtime,
        );
    }

    /// Stop accepting work and wait until every queued and running action on
    /// every key has finished. Nothing already queued is discarded.
    pub async fn shutdown(&self) {
        {
            let mut accepting = self
                .inner
                .accepting
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *accepting {
                tracing::debug!(
                    in_flight = self.in_flight(),
                    active_keys = self.active_keys(),
                    "Draining queue"
                );
            }
            *accepting = false;
        }
        // Every dispatch happened under the read lock, so all lane workers
        // are already tracked.
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::debug!("Queue drained");
    }

    pub fn is_closed(&self) -> bool {
        !*self
            .inner
            .accepting
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Actions queued or running across all keys.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Keys that currently have a lane (running, or idle and not yet reclaimed).
    pub fn active_keys(&self) -> usize {
        self.inner.lanes.len()
    }
}

/// Result of a queued action, delivered when the action completes.
///
/// The action is already queued when this is returned; dropping it does not
/// cancel the action.
#[must_use = "the operation is queued regardless; await this to observe its result"]
pub struct Pending<T> {
    state: PendingState<T>,
}

enum PendingState<T> {
    Waiting(oneshot::Receiver<Result<T, OperationError>>),
    Failed(Option<OperationError>),
}

impl<T> Pending<T> {
    pub(crate) fn waiting(rx: oneshot::Receiver<Result<T, OperationError>>) -> Self {
        Self {
            state: PendingState::Waiting(rx),
        }
    }

    /// A result that failed before anything was queued.
    pub(crate) fn failed(error: OperationError) -> Self {
        Self {
            state: PendingState::Failed(Some(error)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, OperationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| match received {
                Ok(outcome) => outcome,
                Err(_) => Err(OperationError::Dropped),
            }),
            PendingState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(OperationError::Dropped)))
            }
        }
    }
}
