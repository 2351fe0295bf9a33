//! In-process devstack: a hub-connected fleet of nodes, each running a
//! controller plus both roles, with noop executors whose behavior the
//! test scripts through a hook. The shape every end-to-end scenario
//! builds on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flotilla::config::{ComputeNodeConfig, RequesterNodeConfig};
use flotilla::executor::{ExecutorRegistry, NoopExecutor, NoopExecutorConfig, RunShardHook};
use flotilla::shutdown::ShutdownHandle;
use flotilla::storage::{
    BlobStorageProvider, LocalBlobStore, StorageRegistry, UrlDownloadProvider,
};
use flotilla::store::InMemoryJobStore;
use flotilla::transport::InProcessTransportHub;
use flotilla::verifier::{BlobVerifier, NoopVerifier, VerifierRegistry};
use flotilla::{
    ComputeNode, Controller, EngineKind, JobId, JobState, JobStateKind, RequesterNode,
    StorageSourceKind, VerifierKind,
};

pub struct DevNode {
    pub controller: Arc<Controller>,
    pub compute: Arc<ComputeNode>,
}

pub struct DevStack {
    pub shutdown: ShutdownHandle,
    pub nodes: Vec<DevNode>,
    pub blob_store: Arc<LocalBlobStore>,
    _blob_root: tempfile::TempDir,
}

pub struct DevStackOptions {
    /// One compute config per node.
    pub compute_configs: Vec<ComputeNodeConfig>,
    pub requester_config: RequesterNodeConfig,
    /// Scripted "container" behavior; `None` produces empty output and
    /// exit code zero.
    pub run_hook: Option<RunShardHook>,
}

impl Default for DevStackOptions {
    fn default() -> Self {
        Self {
            compute_configs: vec![ComputeNodeConfig::default()],
            requester_config: RequesterNodeConfig {
                bid_timeout: Duration::from_secs(5),
                job_timeout: Duration::from_secs(30),
            },
            run_hook: None,
        }
    }
}

impl DevStack {
    pub fn new(options: DevStackOptions) -> Self {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let blob_root = tempfile::tempdir().expect("tempdir");
        let blob_store =
            Arc::new(LocalBlobStore::new(blob_root.path().join("blobs")).expect("blob store"));

        let mut nodes = Vec::with_capacity(options.compute_configs.len());
        for (i, compute_config) in options.compute_configs.into_iter().enumerate() {
            let transport = hub.attach(format!("node-{}", i));
            let controller = Controller::new(Arc::new(InMemoryJobStore::new()), transport);
            controller.start(shutdown.token());

            let storage = StorageRegistry::new()
                .register(
                    StorageSourceKind::Ipfs,
                    Arc::new(BlobStorageProvider::new(blob_store.clone()).expect("blob provider")),
                )
                .register(
                    StorageSourceKind::UrlDownload,
                    Arc::new(UrlDownloadProvider::new().expect("url provider")),
                );
            let executors = ExecutorRegistry::new().register(
                EngineKind::Noop,
                Arc::new(
                    NoopExecutor::new(NoopExecutorConfig {
                        on_run_shard: options.run_hook.clone(),
                    })
                    .expect("noop executor"),
                ),
            );
            let verifiers = VerifierRegistry::new()
                .register(VerifierKind::Noop, Arc::new(NoopVerifier::new()))
                .register(
                    VerifierKind::Blob,
                    Arc::new(BlobVerifier::new(blob_store.clone())),
                );

            let compute = ComputeNode::new(
                controller.clone(),
                compute_config,
                executors,
                verifiers.clone(),
                storage,
            )
            .expect("compute node");
            compute.start(shutdown.token());

            let requester = RequesterNode::new(
                controller.clone(),
                verifiers,
                options.requester_config.clone(),
            );
            requester.start(shutdown.token());

            nodes.push(DevNode {
                controller,
                compute,
            });
        }

        Self {
            shutdown,
            nodes,
            blob_store,
            _blob_root: blob_root,
        }
    }

    /// Single default node.
    pub fn single_node() -> Self {
        Self::new(DevStackOptions::default())
    }
}

impl Drop for DevStack {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Poll a node's view of a job until it reaches the wanted roll-up state.
pub async fn wait_for_job_state(
    controller: &Arc<Controller>,
    job_id: JobId,
    wanted: JobStateKind,
    timeout: Duration,
) -> JobState {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(state) = controller.get_job_state(job_id).await {
            if state.kind == wanted {
                return state;
            }
            assert!(
                !state.kind.is_terminal(),
                "job {} settled on {} while waiting for {}",
                job_id,
                state.kind,
                wanted
            );
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for job {} to reach {}",
            job_id,
            wanted
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
