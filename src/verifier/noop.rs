//! Noop verifier: the results directory path doubles as the results id
//! and every proposal is accepted. Test-only by construction.

use std::path::Path;

use async_trait::async_trait;

use crate::job::Job;
use crate::types::{FlotillaResult, ShardIndex};
use crate::verifier::Verifier;

#[derive(Default)]
pub struct NoopVerifier;

impl NoopVerifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Verifier for NoopVerifier {
    async fn is_installed(&self) -> FlotillaResult<bool> {
        Ok(true)
    }

    async fn process_shard_results(
        &self,
        _job: &Job,
        _shard_index: ShardIndex,
        results_dir: &Path,
    ) -> FlotillaResult<String> {
        Ok(results_dir.to_string_lossy().to_string())
    }

    async fn verify(
        &self,
        _job: &Job,
        _shard_index: ShardIndex,
        _results_id: &str,
    ) -> FlotillaResult<bool> {
        Ok(true)
    }
}
