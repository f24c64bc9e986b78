//! Engine configuration.
//!
//! `Config` layers the way the rest of the retrieval pack's services do: a `Default` impl
//! gives sane single-machine values, and the struct derives `serde::{Serialize,
//! Deserialize}` so a caller can overlay a TOML file or environment-derived map on top
//! before calling [`Config::validate`].

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tunables consumed by `Runtime::setup_devices` and by the worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of cooperating host machines. Multi-host orchestration itself is out of
    /// scope; this only sizes the local worker-identity space.
    pub num_machines: usize,
    /// Number of devices visible to this process.
    pub num_devices: usize,
    /// Number of worker ranks (threads) per device.
    pub num_ranks: usize,
    /// Hard cap on the total worker pool size, independent of the product above.
    pub max_num_workers: usize,
    /// Run the engine in interpreted (no-JIT, reference) mode; used for testing Version
    /// selection without a real `CodeGen`/`DeviceCtx` pair.
    pub interpreted: bool,
    /// Maximum nesting depth accepted by `LoopAssembler::enter_nested`.
    pub loop_nested_limit: usize,
    /// Maximum number of distinct output blocks a single Task may produce per job.
    pub max_out_block: usize,
    /// Default block edge length, in elements, along each dimension.
    pub block_size: usize,
    /// Size of the device-buffer entry pool the `Cache` allocates per evaluation.
    pub cache_entry_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_machines: 1,
            num_devices: 1,
            num_ranks: 1,
            max_num_workers: 8,
            interpreted: false,
            loop_nested_limit: 8,
            max_out_block: 4,
            block_size: 256,
            cache_entry_count: 64,
        }
    }
}

impl Config {
    /// Total size of the worker pool: `num_machines * num_devices * num_ranks`, capped by
    /// `max_num_workers`.
    pub fn worker_pool_size(&self) -> usize {
        (self.num_machines * self.num_devices * self.num_ranks).min(self.max_num_workers)
    }

    /// Checks internal consistency, returning `EngineError::Configuration` on the first
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        if self.num_machines == 0 {
            return Err(EngineError::Configuration("num_machines must be >= 1".into()));
        }
        if self.num_devices == 0 {
            return Err(EngineError::Configuration("num_devices must be >= 1".into()));
        }
        if self.num_ranks == 0 {
            return Err(EngineError::Configuration("num_ranks must be >= 1".into()));
        }
        if self.max_num_workers == 0 {
            return Err(EngineError::Configuration("max_num_workers must be >= 1".into()));
        }
        if self.loop_nested_limit == 0 {
            return Err(EngineError::Configuration("loop_nested_limit must be >= 1".into()));
        }
        if self.max_out_block == 0 {
            return Err(EngineError::Configuration("max_out_block must be >= 1".into()));
        }
        if self.block_size == 0 {
            return Err(EngineError::Configuration("block_size must be >= 1".into()));
        }
        if self.cache_entry_count == 0 {
            return Err(EngineError::Configuration("cache_entry_count must be >= 1".into()));
        }
        Ok(())
    }
}
