//! KeyedPool - async entry point over the lifecycle manager.
//!
//! Every call assigns a slot round-robin, queues the operation under that
//! slot's key, and hands back a [`Pending`] for the result.

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::error::{BoxError, OperationError, PoolError};
use crate::lifecycle::LifecycleManager;
use crate::queue::Pending;
use crate::resource::ResourceFactory;
use crate::slot::SlotId;
use crate::status::{PoolState, PoolStatus};
use crate::transaction::{TransactionOutcome, TransactionStep, run_steps};

/// Async facade over a fixed pool of non-thread-safe handles.
///
/// Cheap to clone; clones share the same generation and lifecycle.
pub struct KeyedPool<F: ResourceFactory> {
    lifecycle: Arc<LifecycleManager<F>>,
}

impl<F: ResourceFactory> Clone for KeyedPool<F> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl<F: ResourceFactory> KeyedPool<F> {
    /// Open `config.pool_size` handles and start serving.
    ///
    /// Blocks the calling thread until the first generation is built.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        let lifecycle = LifecycleManager::start(factory, &config)?;
        Ok(Self { lifecycle })
    }

    /// Run `op` against the next handle in round-robin order.
    ///
    /// Operations landing on the same slot run one at a time in submission
    /// order. The operation is queued before this returns.
    pub fn submit<T, Op>(&self, op: Op) -> Pending<T>
    where
        T: Send + 'static,
        Op: FnOnce(&mut F::Handle) -> Result<T, BoxError> + Send + 'static,
    {
        self.dispatch(move |handle| op(handle).map_err(OperationError::Action))
    }

    /// Run `steps` as one queued unit against a single handle.
    ///
    /// The outcome reports commit or rollback; only scheduling problems
    /// (pool unavailable, panics) surface as an `Err`.
    pub fn submit_transaction(
        &self,
        steps: Vec<TransactionStep<F::Handle>>,
    ) -> Pending<TransactionOutcome> {
        self.dispatch(move |handle| Ok(run_steps(handle, steps)))
    }

    fn dispatch<T, A>(&self, action: A) -> Pending<T>
    where
        T: Send + 'static,
        A: FnOnce(&mut F::Handle) -> Result<T, OperationError> + Send + 'static,
    {
        let generation = match self.lifecycle.current() {
            Ok(generation) => generation,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected submission");
                return Pending::failed(e);
            }
        };

        let slot: SlotId = generation.pool.assign_slot();
        tracing::trace!(%slot, generation = generation.number(), "Submitting operation");

        let queue = generation.queue.clone();
        queue.enqueue(slot.key(), move || generation.pool.with_handle(slot, action))
    }

    /// Drain in-flight work, dispose every handle, and install fresh ones.
    ///
    /// Overlapping calls share one rebuild. A construction failure leaves the
    /// pool `Failed` until a later reset succeeds.
    pub async fn reset(&self) -> Result<(), PoolError> {
        self.lifecycle.reset().await
    }

    /// Drain in-flight work and dispose every handle. Terminal.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.lifecycle.shutdown().await
    }

    /// Reset synchronously, for host suspend hooks.
    ///
    /// Fails with [`PoolError::BlockingInRuntime`] when called inside a
    /// current-thread runtime.
    pub fn application_suspended(&self) -> Result<(), PoolError> {
        self.lifecycle.application_suspended()
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle.state()
    }

    pub fn status(&self) -> PoolStatus {
        self.lifecycle.status()
    }

    /// Why the last build failed, while the pool is `Failed`.
    pub fn last_error(&self) -> Option<PoolError> {
        self.lifecycle.failure()
    }

    pub fn pool_size(&self) -> usize {
        self.lifecycle.pool_size()
    }

    pub fn factory(&self) -> &F {
        self.lifecycle.factory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::{CountingFactory, TestHandle};
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    type TestPool = KeyedPool<Arc<CountingFactory>>;

    fn pool(factory: &Arc<CountingFactory>, size: usize) -> TestPool {
        KeyedPool::new(Arc::clone(factory), PoolConfig::new().with_pool_size(size)).unwrap()
    }

    async fn resolve<T>(pending: Pending<T>) -> Result<T, OperationError> {
        tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("operation did not complete")
    }

    #[tokio::test]
    async fn submit_runs_against_round_robin_slots() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 3);

        let pending: Vec<_> = (0..7)
            .map(|_| pool.submit(|h: &mut TestHandle| Ok(h.slot.index())))
            .collect();
        let mut slots = Vec::new();
        for p in pending {
            slots.push(resolve(p).await.unwrap());
        }
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_slot_operations_never_overlap() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);
        let running: Arc<Vec<AtomicUsize>> = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect());
        let order: Arc<Vec<Mutex<Vec<usize>>>> =
            Arc::new((0..2).map(|_| Mutex::new(Vec::new())).collect());

        let pending: Vec<_> = (0..40)
            .map(|i| {
                let running = Arc::clone(&running);
                let order = Arc::clone(&order);
                pool.submit(move |h: &mut TestHandle| {
                    let slot = h.slot.index();
                    let before = running[slot].fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(300));
                    order[slot].lock().unwrap().push(i);
                    running[slot].fetch_sub(1, Ordering::SeqCst);
                    Ok(before)
                })
            })
            .collect();

        for p in pending {
            assert_eq!(resolve(p).await.unwrap(), 0, "two operations on one handle");
        }
        // Slot 0 got the even submissions, slot 1 the odd ones, each in order.
        assert_eq!(
            *order[0].lock().unwrap(),
            (0..40).step_by(2).collect::<Vec<_>>()
        );
        assert_eq!(
            *order[1].lock().unwrap(),
            (1..40).step_by(2).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn failing_operation_does_not_block_slot() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 1);

        let failing = pool.submit(|_: &mut TestHandle| -> Result<(), BoxError> {
            Err("constraint violated".into())
        });
        let next = pool.submit(|h: &mut TestHandle| Ok(h.touch()));

        let err = resolve(failing).await.unwrap_err();
        assert_eq!(err.to_string(), "operation failed: constraint violated");
        assert_eq!(resolve(next).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_drains_then_disposes_old_handles() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 3);
        let finished = Arc::new(AtomicUsize::new(0));

        let pending: Vec<_> = (0..9)
            .map(|_| {
                let finished = Arc::clone(&finished);
                pool.submit(move |h: &mut TestHandle| {
                    std::thread::sleep(Duration::from_millis(10));
                    // Panics if the handle was disposed underneath us.
                    let serial = h.touch();
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(serial)
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), pool.reset())
            .await
            .expect("reset did not complete")
            .unwrap();

        // Everything submitted before the reset finished on old handles, and
        // those handles are all disposed.
        assert_eq!(finished.load(Ordering::SeqCst), 9);
        assert_eq!(factory.disposed(), 3);
        assert_eq!(factory.open(), 3);
        for p in pending {
            let serial = p.now_or_never().expect("pending after reset").unwrap();
            assert!(serial < 3, "old operation ran on new handle {serial}");
        }

        // New work lands on the new generation.
        let serial = resolve(pool.submit(|h: &mut TestHandle| Ok(h.touch())))
            .await
            .unwrap();
        assert!(serial >= 3);
        assert_eq!(pool.status().generation, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_ten_operations() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 6);

        let pending: Vec<_> = (0..10)
            .map(|i| {
                pool.submit(move |_: &mut TestHandle| {
                    std::thread::sleep(Duration::from_millis(15));
                    Ok(i)
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown did not complete")
            .unwrap();

        for (i, p) in pending.into_iter().enumerate() {
            assert_eq!(p.now_or_never().expect("pending after shutdown").unwrap(), i);
        }
        assert_eq!(factory.disposed(), 6);
        assert_eq!(pool.state(), PoolState::ShutDown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_after_shutdown_is_unavailable() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);
        pool.shutdown().await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_op = Arc::clone(&ran);
        let result = resolve(pool.submit(move |_: &mut TestHandle| {
            ran_in_op.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .await;

        assert!(matches!(
            result,
            Err(OperationError::Unavailable(PoolState::ShutDown))
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_reset_recovers_on_next_reset() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);

        factory.fail_next_create_at(1);
        assert!(matches!(
            pool.reset().await,
            Err(PoolError::HandleConstruction { .. })
        ));
        assert_eq!(pool.state(), PoolState::Failed);
        assert!(pool.last_error().is_some());

        let rejected = resolve(pool.submit(|h: &mut TestHandle| Ok(h.touch()))).await;
        assert!(matches!(
            rejected,
            Err(OperationError::Unavailable(PoolState::Failed))
        ));

        pool.reset().await.unwrap();
        assert!(resolve(pool.submit(|h: &mut TestHandle| Ok(h.touch()))).await.is_ok());
        assert_eq!(factory.open(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_resets_share_one_rebuild() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);

        // Keep the first reset busy draining so the others overlap it.
        let slow = pool.submit(|_: &mut TestHandle| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });
        let resets: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.reset().await })
            })
            .collect();
        for r in resets {
            r.await.unwrap().unwrap();
        }
        resolve(slow).await.unwrap();

        let status = pool.status();
        assert_eq!(status.state, PoolState::Ready);
        assert!(status.resets <= 2, "resets were not coalesced: {}", status.resets);
        assert_eq!(factory.open(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn application_suspended_resets_synchronously() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);

        let blocking = pool.clone();
        tokio::task::spawn_blocking(move || blocking.application_suspended())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.status().generation, 2);
        assert_eq!(factory.disposed(), 2);
    }

    #[tokio::test]
    async fn transaction_step_failure_rolls_back_and_reports() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let step = |name: &'static str, fail: bool, log: &Arc<Mutex<Vec<String>>>| {
            let apply_log = Arc::clone(log);
            let undo_log = Arc::clone(log);
            TransactionStep::new(name, move |_: &mut TestHandle| {
                if fail {
                    return Err(format!("{name} failed").into());
                }
                apply_log.lock().unwrap().push(format!("apply {name}"));
                Ok(())
            })
            .with_rollback(move |_: &mut TestHandle| {
                undo_log.lock().unwrap().push(format!("undo {name}"));
                Ok(())
            })
        };

        let outcome = resolve(pool.submit_transaction(vec![
            step("one", false, &log),
            step("two", true, &log),
            step("three", false, &log),
        ]))
        .await
        .unwrap();

        assert!(!outcome.is_committed());
        assert_eq!(
            outcome.error().map(|e| e.to_string()).as_deref(),
            Some("two failed")
        );
        assert_eq!(*log.lock().unwrap(), vec!["apply one", "undo one"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_not_counted_as_reset() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 2);

        pool.reset().await.unwrap();
        let reset_at = pool.status().last_reset_at;
        assert!(reset_at.is_some());

        pool.shutdown().await.unwrap();
        let status = pool.status();
        assert_eq!(status.state, PoolState::ShutDown);
        assert_eq!(status.resets, 1);
        assert_eq!(status.last_reset_at, reset_at);
    }

    #[tokio::test]
    async fn status_reflects_pool() {
        let factory = CountingFactory::new();
        let pool = pool(&factory, 4);
        let status = pool.status();
        assert!(status.is_ready());
        assert_eq!(status.pool_size, 4);
        assert_eq!(status.generation, 1);
        assert_eq!(status.resets, 0);
        assert_eq!(pool.pool_size(), 4);
        assert_eq!(pool.factory().created(), 4);
    }
}
