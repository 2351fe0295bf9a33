//! Noop executor: fabricates shard results without running anything.
//! Tests (and the devstack) install a hook to script what a "container"
//! writes; the default hook produces empty output and exit code zero.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::executor::{Executor, RESULT_EXIT_CODE, RESULT_STDERR, RESULT_STDOUT};
use crate::job::{Job, StorageSpec};
use crate::storage::StorageVolume;
use crate::types::{FlotillaResult, ShardIndex};

/// Hook invoked in place of a container run. Receives the job, the shard
/// and the prepared volumes, and writes whatever result files it wants
/// into the results directory.
pub type RunShardHook = Arc<
    dyn Fn(&Job, ShardIndex, &[StorageVolume], &Path) -> FlotillaResult<()> + Send + Sync,
>;

#[derive(Clone, Default)]
pub struct NoopExecutorConfig {
    pub on_run_shard: Option<RunShardHook>,
}

pub struct NoopExecutor {
    config: NoopExecutorConfig,
    results_root: PathBuf,
}

impl NoopExecutor {
    pub fn new(config: NoopExecutorConfig) -> FlotillaResult<Self> {
        let results_root =
            std::env::temp_dir().join(format!("flotilla-noop-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&results_root)?;
        Ok(Self {
            config,
            results_root,
        })
    }

    /// Write the canonical result files. Hooks may call this and then
    /// overwrite individual files.
    pub fn write_result_files(
        results_dir: &Path,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
    ) -> FlotillaResult<()> {
        std::fs::write(results_dir.join(RESULT_STDOUT), stdout)?;
        std::fs::write(results_dir.join(RESULT_STDERR), stderr)?;
        std::fs::write(results_dir.join(RESULT_EXIT_CODE), exit_code.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl Executor for NoopExecutor {
    async fn is_installed(&self) -> FlotillaResult<bool> {
        Ok(true)
    }

    async fn has_storage_locally(&self, _spec: &StorageSpec) -> FlotillaResult<bool> {
        Ok(true)
    }

    async fn run_shard(
        &self,
        job: &Job,
        shard_index: ShardIndex,
        volumes: &[StorageVolume],
    ) -> FlotillaResult<PathBuf> {
        let results_dir = self
            .results_root
            .join(format!("{}-{}", job.id, shard_index));
        std::fs::create_dir_all(&results_dir)?;
        debug!(job_id = %job.id, shard_index, "noop executor running shard");

        match &self.config.on_run_shard {
            Some(hook) => hook(job, shard_index, volumes, &results_dir)?,
            None => Self::write_result_files(&results_dir, "", "", 0)?,
        }
        Ok(results_dir)
    }
}
