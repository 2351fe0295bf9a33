//! # Executor Contract
//!
//! The engine that actually runs a shard lives outside the core (a
//! container runtime in production). The core sees this trait and a
//! registry keyed by [`EngineKind`]; whatever runs must leave canonical
//! `stdout`, `stderr` and `exitCode` files in the results directory.

pub mod noop;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{EngineKind, Job, StorageSpec};
use crate::storage::StorageVolume;
use crate::types::{FlotillaError, FlotillaResult, ShardIndex};

pub use noop::{NoopExecutor, NoopExecutorConfig, RunShardHook};

/// Canonical result file names every engine must produce.
pub const RESULT_STDOUT: &str = "stdout";
pub const RESULT_STDERR: &str = "stderr";
pub const RESULT_EXIT_CODE: &str = "exitCode";

#[async_trait]
pub trait Executor: Send + Sync {
    async fn is_installed(&self) -> FlotillaResult<bool>;

    /// Whether the engine can resolve this input without remote fetches.
    async fn has_storage_locally(&self, spec: &StorageSpec) -> FlotillaResult<bool>;

    /// Run one shard with its volumes mounted; returns the results
    /// directory. A non-zero container exit code is a valid result, not
    /// an error — failures here mean the engine itself broke.
    async fn run_shard(
        &self,
        job: &Job,
        shard_index: ShardIndex,
        volumes: &[StorageVolume],
    ) -> FlotillaResult<PathBuf>;
}

/// Kind-keyed executor registry.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<EngineKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: EngineKind, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn get(&self, kind: EngineKind) -> FlotillaResult<Arc<dyn Executor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| FlotillaError::NotFound(format!("no executor for engine {}", kind)))
    }

    pub fn has(&self, kind: EngineKind) -> bool {
        self.executors.contains_key(&kind)
    }
}
