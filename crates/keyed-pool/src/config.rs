//! Pool configuration.

use tokio::runtime::Handle;

use crate::error::PoolError;

/// Slots per pool unless configured otherwise.
pub const DEFAULT_POOL_SIZE: usize = 6;

/// Environment variable read by [`PoolConfig::from_env`].
pub const POOL_SIZE_ENV: &str = "KEYED_POOL_SIZE";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of slots (and handles) per generation. Fixed for the pool's lifetime.
    pub pool_size: usize,
    /// Runtime whose blocking pool runs operations. Defaults to the runtime
    /// the pool is constructed in.
    pub runtime: Option<Handle>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            runtime: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the pool size taken from `KEYED_POOL_SIZE` when set.
    pub fn from_env() -> Result<Self, PoolError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(POOL_SIZE_ENV) {
            config.pool_size = parse_pool_size(&raw)?;
        }
        Ok(config)
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::InvalidSize(self.pool_size));
        }
        Ok(())
    }

    pub(crate) fn runtime_handle(&self) -> Result<Handle, PoolError> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current().map_err(|_| PoolError::NoRuntime),
        }
    }
}

fn parse_pool_size(raw: &str) -> Result<usize, PoolError> {
    let n: usize = raw.trim().parse().map_err(|_| {
        PoolError::Config(format!("{POOL_SIZE_ENV} must be a positive integer, got '{raw}'"))
    })?;
    if n == 0 {
        return Err(PoolError::InvalidSize(n));
    }
    Ok(n)
}
