//! keyed-pool: async access to a fixed pool of synchronous, non-thread-safe
//! resource handles, with strict per-key ordering.

mod config;
mod error;
mod lifecycle;
mod pool;
mod slot;
mod status;

pub mod queue;
pub mod resource;
pub mod service;
pub mod transaction;

pub use config::{DEFAULT_POOL_SIZE, POOL_SIZE_ENV, PoolConfig};
pub use error::{BoxError, OperationError, PoolError};
pub use pool::ResourcePool;
pub use queue::{KeyedQueue, Pending};
pub use resource::ResourceFactory;
pub use service::KeyedPool;
pub use slot::{HandleState, Slot, SlotId};
pub use status::{PoolState, PoolStatus};
pub use transaction::{TransactionError, TransactionOutcome, TransactionStep, run_steps};
