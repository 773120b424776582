//! Fixed-size pool of resource handles with round-robin slot assignment.
//!
//! One `ResourcePool` is one generation's worth of slots. It is built whole,
//! served until the next reset, and disposed whole. Slot count never changes.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{OperationError, PoolError};
use crate::resource::ResourceFactory;
use crate::slot::{HandleState, Slot, SlotId};

pub struct ResourcePool<H> {
    generation: u64,
    slots: Vec<Slot<H>>,
    next: AtomicUsize,
}

impl<H: Send + 'static> ResourcePool<H> {
    /// Open `size` handles through `factory`.
    ///
    /// If any slot fails to open, the handles already opened are disposed
    /// before the error is returned.
    pub fn build<F>(factory: &F, size: usize, generation: u64) -> Result<Self, PoolError>
    where
        F: ResourceFactory<Handle = H>,
    {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }

        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let id = SlotId::new(index);
            match factory.create(id) {
                Ok(handle) => {
                    tracing::trace!(slot = %id, generation, "Handle opened");
                    slots.push(Slot::open(id, handle));
                }
                Err(e) => {
                    tracing::error!(slot = %id, generation, error = %e, "Failed to open handle");
                    let partial = Self {
                        generation,
                        slots,
                        next: AtomicUsize::new(0),
                    };
                    partial.dispose(factory);
                    return Err(PoolError::construction(id, e));
                }
            }
        }

        tracing::debug!(size, generation, "Resource pool built");
        Ok(Self {
            generation,
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the next slot: `counter++ mod size`.
    pub fn assign_slot(&self) -> SlotId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        SlotId::new(n % self.slots.len())
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot<H>> {
        self.slots.get(id.index())
    }

    /// Run `f` against the handle in slot `id`.
    ///
    /// Only the queue should call this, from the lane that owns `id`'s key.
    pub fn with_handle<T>(
        &self,
        id: SlotId,
        f: impl FnOnce(&mut H) -> Result<T, OperationError>,
    ) -> Result<T, OperationError> {
        self.slot(id)
            .ok_or(OperationError::UnknownSlot(id))?
            .with_handle(f)
    }

    /// Dispose every handle still held. Returns how many were disposed.
    ///
    /// Dispose failures are logged; the handle is gone either way.
    pub fn dispose<F>(&self, factory: &F) -> usize
    where
        F: ResourceFactory<Handle = H>,
    {
        let mut disposed = 0;
        for slot in &self.slots {
            let Some(handle) = slot.take() else {
                continue;
            };
            disposed += 1;
            if let Err(e) = factory.dispose(slot.id(), handle) {
                tracing::warn!(
                    slot = %slot.id(),
                    generation = self.generation,
                    error = %e,
                    "Failed to dispose handle"
                );
            }
        }
        tracing::debug!(disposed, generation = self.generation, "Resource pool disposed");
        disposed
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn open_handles(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == HandleState::Open)
            .count()
    }
}
