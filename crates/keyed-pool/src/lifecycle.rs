//! Generation lifecycle: initial build, reset, shutdown.
//!
//! A generation is one resource pool plus the queue that serializes access to
//! it. The manager holds at most one installed generation and replaces it
//! whole. Transitions are serialized by an async mutex; a reset that was
//! waiting on that mutex while another transition completed is absorbed into
//! it and reports the settled outcome instead of running again.
//!
//! Transition bodies run as spawned tasks, so a caller that stops awaiting
//! `reset()` never leaves the pool half torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::config::PoolConfig;
use crate::error::{OperationError, PoolError};
use crate::pool::ResourcePool;
use crate::queue::KeyedQueue;
use crate::resource::ResourceFactory;
use crate::status::{PoolState, PoolStatus};

/// One internally consistent set of handles and the queue guarding them.
pub(crate) struct Generation<H> {
    pub(crate) pool: ResourcePool<H>,
    pub(crate) queue: KeyedQueue,
}

impl<H: Send + 'static> Generation<H> {
    pub(crate) fn number(&self) -> u64 {
        self.pool.generation()
    }
}

enum Lifecycle<H> {
    Starting,
    Ready(Arc<Generation<H>>),
    Resetting,
    Failed(PoolError),
    ShutDown,
}

impl<H> Lifecycle<H> {
    fn state(&self) -> PoolState {
        match self {
            Self::Starting => PoolState::Starting,
            Self::Ready(_) => PoolState::Ready,
            Self::Resetting => PoolState::Resetting,
            Self::Failed(_) => PoolState::Failed,
            Self::ShutDown => PoolState::ShutDown,
        }
    }
}

pub(crate) struct LifecycleManager<F: ResourceFactory> {
    factory: Arc<F>,
    pool_size: usize,
    runtime: Handle,
    current: RwLock<Lifecycle<F::Handle>>,
    /// Held for the whole of a reset or shutdown.
    transition: tokio::sync::Mutex<()>,
    /// Completed transitions. Read before queueing on `transition` to detect
    /// that another caller already did the work.
    transitions: AtomicU64,
    /// Resets that ran, successful or not. Absorbed resets and shutdowns are
    /// not counted.
    resets: AtomicU64,
    /// Last generation number handed out.
    generations: AtomicU64,
    last_reset_at: Mutex<Option<DateTime<Utc>>>,
}

impl<F: ResourceFactory> LifecycleManager<F> {
    /// Build the first generation on the calling thread and install it.
    pub(crate) fn start(factory: F, config: &PoolConfig) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let runtime = config.runtime_handle()?;

        let manager = Arc::new(Self {
            factory: Arc::new(factory),
            pool_size: config.pool_size,
            runtime,
            current: RwLock::new(Lifecycle::Starting),
            transition: tokio::sync::Mutex::new(()),
            transitions: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            last_reset_at: Mutex::new(None),
        });

        match manager.build_generation() {
            Ok(generation) => {
                tracing::info!(
                    generation = generation.number(),
                    pool_size = manager.pool_size,
                    "Pool ready"
                );
                manager.set(Lifecycle::Ready(Arc::new(generation)));
                Ok(manager)
            }
            Err(e) => {
                manager.set(Lifecycle::Failed(e.clone()));
                Err(e)
            }
        }
    }

    pub(crate) fn factory(&self) -> &F {
        &self.factory
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// The installed generation, or why there is none.
    pub(crate) fn current(&self) -> Result<Arc<Generation<F::Handle>>, OperationError> {
        match &*self.read() {
            Lifecycle::Ready(generation) => Ok(Arc::clone(generation)),
            other => Err(OperationError::Unavailable(other.state())),
        }
    }

    pub(crate) fn state(&self) -> PoolState {
        self.read().state()
    }

    /// Last construction failure, while the pool sits in `Failed`.
    pub(crate) fn failure(&self) -> Option<PoolError> {
        match &*self.read() {
            Lifecycle::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Drain and dispose the installed generation, then build and publish a
    /// new one.
    pub(crate) async fn reset(self: &Arc<Self>) -> Result<(), PoolError> {
        let observed = self.transitions.load(Ordering::Acquire);
        let this = Arc::clone(self);
        self.runtime
            .spawn(async move { this.run_reset(observed).await })
            .await?
    }

    /// Drain and dispose the installed generation for good.
    pub(crate) async fn shutdown(self: &Arc<Self>) -> Result<(), PoolError> {
        let this = Arc::clone(self);
        self.runtime
            .spawn(async move { this.run_shutdown().await })
            .await?
    }

    /// Blocking reset for host suspend notifications.
    ///
    /// On a multi-thread runtime the calling worker is handed off with
    /// `block_in_place`. Inside a current-thread runtime the reset could never
    /// run while this thread waits, so the call fails with
    /// [`PoolError::BlockingInRuntime`] and leaves the pool untouched.
    pub(crate) fn application_suspended(self: &Arc<Self>) -> Result<(), PoolError> {
        let flavor = Handle::try_current().ok().map(|h| h.runtime_flavor());
        match flavor {
            None => {
                tracing::info!("Application suspended, resetting pool");
                futures::executor::block_on(self.reset())
            }
            Some(RuntimeFlavor::MultiThread) => {
                tracing::info!("Application suspended, resetting pool");
                tokio::task::block_in_place(|| futures::executor::block_on(self.reset()))
            }
            Some(_) => {
                tracing::warn!("application_suspended called inside a current-thread runtime");
                Err(PoolError::BlockingInRuntime)
            }
        }
    }

    async fn run_reset(&self, observed: u64) -> Result<(), PoolError> {
        let _transition = self.transition.lock().await;

        if self.transitions.load(Ordering::Acquire) != observed {
            let outcome = self.settled();
            tracing::debug!(ok = outcome.is_ok(), "Reset absorbed by concurrent transition");
            return outcome;
        }

        let old = {
            let mut current = self.write();
            match std::mem::replace(&mut *current, Lifecycle::Resetting) {
                Lifecycle::Ready(generation) => Some(generation),
                Lifecycle::ShutDown => {
                    *current = Lifecycle::ShutDown;
                    return Err(PoolError::ShutDown);
                }
                Lifecycle::Starting | Lifecycle::Resetting | Lifecycle::Failed(_) => None,
            }
        };

        let retiring = old.as_ref().map(|g| g.number());
        tracing::info!(generation = retiring, "Resetting pool");

        let result = match old {
            Some(generation) => self.retire(generation).await,
            None => Ok(()),
        };
        let result = match result {
            Ok(()) => {
                let factory = Arc::clone(&self.factory);
                let size = self.pool_size;
                let number = self.next_generation();
                let runtime = self.runtime.clone();
                match self
                    .runtime
                    .spawn_blocking(move || Self::build(&factory, size, number, runtime))
                    .await
                {
                    Ok(built) => built,
                    Err(e) => Err(PoolError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(generation) => {
                tracing::info!(
                    generation = generation.number(),
                    previous = retiring,
                    "Pool reset complete"
                );
                self.set(Lifecycle::Ready(Arc::new(generation)));
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Pool reset failed, no generation installed");
                self.set(Lifecycle::Failed(e.clone()));
                Err(e)
            }
        };
        *self
            .last_reset_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.resets.fetch_add(1, Ordering::AcqRel);
        self.finish_transition();
        outcome
    }

    async fn run_shutdown(&self) -> Result<(), PoolError> {
        let _transition = self.transition.lock().await;

        let old = {
            let mut current = self.write();
            match std::mem::replace(&mut *current, Lifecycle::ShutDown) {
                Lifecycle::ShutDown => {
                    tracing::debug!("Pool already shut down");
                    return Ok(());
                }
                Lifecycle::Ready(generation) => Some(generation),
                Lifecycle::Starting | Lifecycle::Resetting | Lifecycle::Failed(_) => None,
            }
        };

        let retiring = old.as_ref().map(|g| g.number());
        tracing::info!(generation = retiring, "Shutting down pool");
        let result = match old {
            Some(generation) => self.retire(generation).await,
            None => Ok(()),
        };
        self.finish_transition();
        tracing::info!(ok = result.is_ok(), "Pool shut down");
        result
    }

    /// Drain `generation`'s queue, then dispose every handle it owns.
    async fn retire(&self, generation: Arc<Generation<F::Handle>>) -> Result<(), PoolError> {
        let number = generation.number();
        generation.queue.shutdown().await;

        let factory = Arc::clone(&self.factory);
        let disposed = self
            .runtime
            .spawn_blocking(move || generation.pool.dispose(&*factory))
            .await?;
        tracing::debug!(generation = number, disposed, "Generation retired");
        Ok(())
    }

    fn build_generation(&self) -> Result<Generation<F::Handle>, PoolError> {
        Self::build(
            &self.factory,
            self.pool_size,
            self.next_generation(),
            self.runtime.clone(),
        )
    }

    fn build(
        factory: &F,
        size: usize,
        number: u64,
        runtime: Handle,
    ) -> Result<Generation<F::Handle>, PoolError> {
        let pool = ResourcePool::build(factory, size, number)?;
        Ok(Generation {
            pool,
            queue: KeyedQueue::new(runtime),
        })
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Outcome of the most recent transition, as seen by an absorbed reset.
    fn settled(&self) -> Result<(), PoolError> {
        match &*self.read() {
            Lifecycle::Ready(_) => Ok(()),
            Lifecycle::Failed(e) => Err(e.clone()),
            Lifecycle::ShutDown => Err(PoolError::ShutDown),
            Lifecycle::Starting | Lifecycle::Resetting => {
                debug_assert!(false, "transition finished without settling");
                tracing::error!("Bug: transition finished without settling state");
                Err(PoolError::Join("transition did not settle".to_string()))
            }
        }
    }

    fn finish_transition(&self) {
        self.transitions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let (state, generation, in_flight, active_keys) = match &*self.read() {
            Lifecycle::Ready(g) => (
                PoolState::Ready,
                g.number(),
                g.queue.in_flight(),
                g.queue.active_keys(),
            ),
            other => (other.state(), 0, 0, 0),
        };
        let last_reset_at = self
            .last_reset_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.to_rfc3339());

        PoolStatus {
            state,
            generation,
            pool_size: self.pool_size,
            in_flight,
            active_keys,
            resets: self.resets.load(Ordering::Acquire),
            last_reset_at,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Lifecycle<F::Handle>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Lifecycle<F::Handle>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, next: Lifecycle<F::Handle>) {
        *self.write() = next;
    }
}

impl<F: ResourceFactory> Drop for LifecycleManager<F> {
    fn drop(&mut self) {
        let current = self.current.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Ready(generation) = current {
            tracing::warn!(
                generation = generation.number(),
                "Pool dropped without shutdown; open handles are released without dispose"
            );
        }
    }
}
