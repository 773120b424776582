//! Boundary with the wrapped resource.
//!
//! The pool never looks inside a handle. It only asks the factory to open one
//! per slot and to dispose of it again when the generation is torn down.

use crate::error::BoxError;
use crate::slot::SlotId;

/// Creates and disposes the handles a pool serves.
///
/// Handle construction parameters (paths, credentials, flags) live on the
/// implementing type. Both methods are called from blocking worker threads,
/// never from an async task.
pub trait ResourceFactory: Send + Sync + 'static {
    /// One live instance of the wrapped resource. Needs to be `Send` but not
    /// `Sync`: only one operation touches a handle at a time.
    type Handle: Send + 'static;

    /// Open a handle for `slot`.
    fn create(&self, slot: SlotId) -> Result<Self::Handle, BoxError>;

    /// Release a handle. Called exactly once per created handle.
    fn dispose(&self, slot: SlotId, handle: Self::Handle) -> Result<(), BoxError> {
        let _ = slot;
        drop(handle);
        Ok(())
    }
}
