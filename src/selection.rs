//! # Job Selection Policy
//!
//! The per-node predicate deciding whether a compute node bids on a job.
//! Cheap in-process checks run first; if an external probe is configured
//! it is authoritative and overrides them.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::job::Job;
use crate::storage::StorageRegistry;
use crate::types::{FlotillaError, FlotillaResult, NodeId};

/// Where job data must live for this node to take the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobSelectionDataLocality {
    /// Only bid when every input is already in the local blob cache.
    Local,
    /// Bid regardless of where the data lives.
    Anywhere,
}

impl JobSelectionDataLocality {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "anywhere" => Some(Self::Anywhere),
            _ => None,
        }
    }
}

/// Selection policy, threaded in from the `serve` flags.
#[derive(Debug, Clone)]
pub struct JobSelectionPolicy {
    pub locality: JobSelectionDataLocality,
    pub reject_stateless_jobs: bool,
    /// POST the probe data here; 2xx + `{"accept": true}` accepts.
    pub probe_http: Option<String>,
    /// Run this command with the probe data on stdin; exit 0 accepts.
    pub probe_exec: Option<String>,
}

impl Default for JobSelectionPolicy {
    fn default() -> Self {
        Self {
            locality: JobSelectionDataLocality::Anywhere,
            reject_stateless_jobs: false,
            probe_http: None,
            probe_exec: None,
        }
    }
}

/// What the probes get to look at.
#[derive(Debug, Serialize)]
struct JobSelectionProbeData<'a> {
    node_id: &'a NodeId,
    job: &'a Job,
}

#[derive(Debug, Deserialize)]
struct ProbeHttpResponse {
    #[serde(default)]
    accept: bool,
}

impl JobSelectionPolicy {
    /// Decide whether this node should bid. Pure for fixed inputs and
    /// node state: the answer only changes if the blob cache or the
    /// probe target changes its mind.
    pub async fn should_bid(
        &self,
        node_id: &NodeId,
        job: &Job,
        storage: &StorageRegistry,
    ) -> FlotillaResult<bool> {
        if self.reject_stateless_jobs && job.spec.inputs.is_empty() {
            debug!(job_id = %job.id, "rejecting stateless job");
            return Ok(false);
        }

        if self.locality == JobSelectionDataLocality::Local
            && !storage.has_all_locally(&job.spec.inputs).await?
        {
            debug!(job_id = %job.id, "rejecting job with non-local data");
            return Ok(false);
        }

        // Probes override the in-process checks; http wins when both are
        // configured.
        if let Some(url) = &self.probe_http {
            return self.probe_via_http(url, node_id, job).await;
        }
        if let Some(command) = &self.probe_exec {
            return self.probe_via_exec(command, node_id, job).await;
        }

        Ok(true)
    }

    async fn probe_via_http(
        &self,
        url: &str,
        node_id: &NodeId,
        job: &Job,
    ) -> FlotillaResult<bool> {
        let data = JobSelectionProbeData { node_id, job };
        let response = reqwest::Client::new()
            .post(url)
            .json(&data)
            .send()
            .await
            .map_err(|e| FlotillaError::Transient(format!("http probe {}: {}", url, e)))?;
        if !response.status().is_success() {
            debug!(job_id = %job.id, status = %response.status(), "http probe rejected job");
            return Ok(false);
        }
        match response.json::<ProbeHttpResponse>().await {
            Ok(body) => Ok(body.accept),
            Err(e) => {
                warn!(job_id = %job.id, "http probe body unreadable: {}", e);
                Ok(false)
            }
        }
    }

    async fn probe_via_exec(
        &self,
        command: &str,
        node_id: &NodeId,
        job: &Job,
    ) -> FlotillaResult<bool> {
        let data = serde_json::to_vec(&JobSelectionProbeData { node_id, job })?;
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FlotillaError::Transient(format!("exec probe spawn: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // The probe may exit without reading; a broken pipe is fine.
            let _ = stdin.write_all(&data).await;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| FlotillaError::Transient(format!("exec probe wait: {}", e)))?;
        debug!(job_id = %job.id, code = ?status.code(), "exec probe finished");
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        EngineKind, JobDeal, JobSpec, JobSpecDocker, JobSpecSharding, ResourceUsageConfig,
        StorageSourceKind, StorageSpec, VerifierKind,
    };
    use crate::storage::blob::BlobStore;
    use crate::storage::{BlobStorageProvider, LocalBlobStore, StorageRegistry};
    use crate::types::{ClientId, JobId};
    use chrono::Utc;
    use std::sync::Arc;

    fn job_with_inputs(inputs: Vec<StorageSpec>) -> Job {
        Job {
            id: JobId::new(),
            client_id: ClientId::new("c"),
            requester_node_id: NodeId::from("r"),
            spec: JobSpec {
                engine: EngineKind::Noop,
                verifier: VerifierKind::Noop,
                resources: ResourceUsageConfig::default(),
                docker: JobSpecDocker::default(),
                inputs,
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

    fn blob_registry(root: &std::path::Path) -> (StorageRegistry, Arc<LocalBlobStore>) {
        let store = Arc::new(LocalBlobStore::new(root.join("blobs")).unwrap());
        let provider = Arc::new(BlobStorageProvider::new(store.clone()).unwrap());
        (
            StorageRegistry::new().register(StorageSourceKind::Ipfs, provider),
            store,
        )
    }

    #[tokio::test]
    async fn test_default_policy_accepts_stateless() {
        let policy = JobSelectionPolicy::default();
        let registry = StorageRegistry::new();
        let job = job_with_inputs(vec![]);
        assert!(policy
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reject_stateless() {
        let policy = JobSelectionPolicy {
            reject_stateless_jobs: true,
            ..Default::default()
        };
        let registry = StorageRegistry::new();
        let job = job_with_inputs(vec![]);
        assert!(!policy
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_locality_requires_cached_inputs() {
        let root = tempfile::tempdir().unwrap();
        let (registry, store) = blob_registry(root.path());
        let policy = JobSelectionPolicy {
            locality: JobSelectionDataLocality::Local,
            ..Default::default()
        };

        let job = job_with_inputs(vec![StorageSpec {
            engine: Some(StorageSourceKind::Ipfs),
            cid: "deadbeef".into(),
            path: "/inputs".into(),
            ..Default::default()
        }]);
        assert!(!policy
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());

        // Pin the content locally and the same job becomes acceptable.
        let data = root.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("f"), b"x").unwrap();
        let cid = store.put(&data).await.unwrap();
        let job = job_with_inputs(vec![StorageSpec {
            engine: Some(StorageSourceKind::Ipfs),
            cid,
            path: "/inputs".into(),
            ..Default::default()
        }]);
        assert!(policy
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_exec_probe_is_authoritative() {
        let registry = StorageRegistry::new();
        let job = job_with_inputs(vec![]);

        let accept = JobSelectionPolicy {
            probe_exec: Some("exit 0".into()),
            ..Default::default()
        };
        assert!(accept
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());

        let reject = JobSelectionPolicy {
            probe_exec: Some("exit 3".into()),
            ..Default::default()
        };
        assert!(!reject
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_exec_probe_reads_job_json() {
        let registry = StorageRegistry::new();
        let job = job_with_inputs(vec![]);
        // grep exits 0 only if the payload mentions the job id.
        let policy = JobSelectionPolicy {
            probe_exec: Some(format!("grep -q {}", job.id)),
            ..Default::default()
        };
        assert!(policy
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_selection_is_deterministic() {
        let policy = JobSelectionPolicy {
            reject_stateless_jobs: true,
            ..Default::default()
        };
        let registry = StorageRegistry::new();
        let job = job_with_inputs(vec![]);
        let first = policy
            .should_bid(&NodeId::from("n"), &job, &registry)
            .await
            .unwrap();
        for _ in 0..5 {
            assert_eq!(
                policy
                    .should_bid(&NodeId::from("n"), &job, &registry)
                    .await
                    .unwrap(),
                first
            );
        }
    }
}
