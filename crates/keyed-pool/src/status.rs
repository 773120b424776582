//! Pool state and status snapshots.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the pool as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolState {
    /// Building the first generation
    #[default]
    Starting,
    /// A generation is installed and accepting work
    Ready,
    /// Draining the old generation and building a new one
    Resetting,
    /// The last build failed; no generation until a reset succeeds
    Failed,
    /// Drained and disposed for good
    ShutDown,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Resetting => "resetting",
            Self::Failed => "failed",
            Self::ShutDown => "shut down",
        }
    }

    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of pool status for hosts to query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub state: PoolState,
    /// Number of the installed generation (0 if none has been built yet).
    pub generation: u64,
    pub pool_size: usize,
    /// Operations queued or running on the installed generation.
    pub in_flight: usize,
    /// Keys with a live lane on the installed generation.
    pub active_keys: usize,
    /// Resets that ran to completion, successful or not. Shutdown is not a
    /// reset.
    pub resets: u64,
    /// When the last reset completed (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reset_at: Option<String>,
}

impl PoolStatus {
    pub fn is_ready(&self) -> bool {
        self.state == PoolState::Ready
    }

    /// Ready, with at least one operation on every slot's key.
    pub fn is_saturated(&self) -> bool {
        self.is_ready() && self.active_keys >= self.pool_size
    }
}
