//! Error types for queued operations and pool lifecycle.

use std::sync::Arc;

use crate::slot::SlotId;
use crate::status::PoolState;

/// Error returned by an operation running against a handle.
///
/// Boxed so `?` works inside operations on any collaborator error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a single queued operation. Local to that operation's future.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The operation itself returned an error.
    #[error("operation failed: {0}")]
    Action(#[source] BoxError),

    /// The operation panicked. The key still moves on to its next item.
    #[error("operation panicked: {0}")]
    Panicked(String),

    /// The queue stopped accepting work before this operation was enqueued.
    #[error("queue is closed to new operations")]
    QueueClosed,

    /// The worker went away without reporting a result.
    #[error("operation dropped before completing")]
    Dropped,

    #[error("handle for slot {0} has been disposed")]
    HandleDisposed(SlotId),

    #[error("handle for slot {0} is already in use")]
    HandleBusy(SlotId),

    #[error("no slot {0} in this pool")]
    UnknownSlot(SlotId),

    /// No generation is installed (resetting, failed or shut down).
    #[error("pool unavailable: {0}")]
    Unavailable(PoolState),
}

impl OperationError {
    pub fn action(error: impl Into<BoxError>) -> Self {
        Self::Action(error.into())
    }

    /// The operation's own error, if that is what failed.
    pub fn as_action(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Action(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Generation-level failure.
///
/// Cloneable so every caller absorbed into one reset sees the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("failed to create handle for slot {slot}: {source}")]
    HandleConstruction {
        slot: SlotId,
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("pool size must be at least 1 (got {0})")]
    InvalidSize(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no tokio runtime available; construct inside a runtime or pass one in PoolConfig")]
    NoRuntime,

    #[error("pool is shut down")]
    ShutDown,

    /// A blocking call made on a runtime thread that the call itself needs.
    #[error("cannot block on the pool from inside a current-thread runtime")]
    BlockingInRuntime,

    #[error("lifecycle task failed: {0}")]
    Join(String),
}

impl PoolError {
    pub(crate) fn construction(slot: SlotId, error: BoxError) -> Self {
        Self::HandleConstruction {
            slot,
            source: Arc::from(error),
        }
    }
}

impl From<tokio::task::JoinError> for PoolError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

/// Best-effort message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
