//! Blob verifier: uploads the results folder to the content-addressed
//! store and returns the content address as the results id. Verification
//! itself currently accepts everything — this is the forwarding
//! placeholder occupying the protocol slot.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::job::Job;
use crate::storage::BlobStore;
use crate::types::{FlotillaResult, ShardIndex};
use crate::verifier::Verifier;

pub struct BlobVerifier {
    store: Arc<dyn BlobStore>,
}

impl BlobVerifier {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Verifier for BlobVerifier {
    async fn is_installed(&self) -> FlotillaResult<bool> {
        Ok(true)
    }

    async fn process_shard_results(
        &self,
        job: &Job,
        shard_index: ShardIndex,
        results_dir: &Path,
    ) -> FlotillaResult<String> {
        debug!(job_id = %job.id, shard_index, "uploading results folder");
        self.store.put(results_dir).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        EngineKind, JobDeal, JobSpec, JobSpecDocker, JobSpecSharding, ResourceUsageConfig,
        VerifierKind,
    };
    use crate::storage::LocalBlobStore;
    use crate::types::{ClientId, JobId, NodeId};
    use chrono::Utc;

    fn test_job() -> Job {
        Job {
            id: JobId::new(),
            client_id: ClientId::new("c"),
            requester_node_id: NodeId::from("r"),
            spec: JobSpec {
                engine: EngineKind::Noop,
                verifier: VerifierKind::Blob,
                resources: ResourceUsageConfig::default(),
                docker: JobSpecDocker::default(),
                inputs: vec![],
                outputs: vec![],
                workdir: String::new(),
                annotations: vec![],
                sharding: JobSpecSharding::default(),
            },
            deal: JobDeal {
                concurrency: 1,
                assigned_nodes: vec![],
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_results_id_is_content_address() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(root.path().join("blobs")).unwrap());
        let verifier = BlobVerifier::new(store.clone());

        let results = root.path().join("results");
        std::fs::create_dir_all(&results).unwrap();
        std::fs::write(results.join("stdout"), b"hi\n").unwrap();
        std::fs::write(results.join("exitCode"), b"0").unwrap();

        let job = test_job();
        let results_id = verifier.process_shard_results(&job, 0, &results).await.unwrap();
        assert!(store.has(&results_id).await.unwrap());
        assert!(verifier.verify(&job, 0, &results_id).await.unwrap());
    }
}
