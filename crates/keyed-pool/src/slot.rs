//! Pool slots - one handle per slot per generation.
//!
//! A slot owns its handle behind a mutex that is never contended while the
//! queue's per-key invariant holds. The mutex exists to detect two things:
//! concurrent access to the same handle (a bug) and access after disposal.

use std::sync::{Mutex, PoisonError, TryLockError};

use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// Position of a slot within a pool generation.
///
/// The queue key for a slot is its index in decimal form, so every operation
/// routed to the same slot shares one ordering domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    /// Ordering key used when queueing work for this slot.
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl From<usize> for SlotId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a slot still holds a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Open,
    Closed,
}

/// A fixed position in the pool holding exactly one handle until disposal.
pub struct Slot<H> {
    id: SlotId,
    handle: Mutex<Option<H>>,
}

impl<H> Slot<H> {
    pub(crate) fn open(id: SlotId, handle: H) -> Self {
        Self {
            id,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Current handle state. A handle busy running an operation is open.
    pub fn state(&self) -> HandleState {
        match self.handle.try_lock() {
            Ok(guard) if guard.is_some() => HandleState::Open,
            Ok(_) => HandleState::Closed,
            Err(TryLockError::WouldBlock) => HandleState::Open,
            Err(TryLockError::Poisoned(poisoned)) => {
                if poisoned.into_inner().is_some() {
                    HandleState::Open
                } else {
                    HandleState::Closed
                }
            }
        }
    }

    /// Run `f` with exclusive access to the handle.
    ///
    /// Fails with `HandleDisposed` once the generation has been torn down and
    /// with `HandleBusy` if another operation already holds the handle.
    pub(crate) fn with_handle<T>(
        &self,
        f: impl FnOnce(&mut H) -> Result<T, OperationError>,
    ) -> Result<T, OperationError> {
        let mut guard = match self.handle.try_lock() {
            Ok(guard) => guard,
            // A previous operation panicked mid-call. The handle is still the
            // slot's only handle, so keep serving it.
            Err(TryLockError::Poisoned(poisoned)) => {
                tracing::warn!(slot = %self.id, "Handle lock poisoned by an earlier panic");
                poisoned.into_inner()
            }
            Err(TryLockError::WouldBlock) => {
                debug_assert!(false, "slot handle accessed concurrently");
                tracing::error!(slot = %self.id, "Bug: handle accessed by two operations at once");
                return Err(OperationError::HandleBusy(self.id));
            }
        };

        let handle = guard
            .as_mut()
            .ok_or(OperationError::HandleDisposed(self.id))?;
        f(handle)
    }

    /// Remove the handle for disposal. Returns `None` if already taken.
    pub(crate) fn take(&self) -> Option<H> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
