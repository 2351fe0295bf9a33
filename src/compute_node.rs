//! # Compute Node Role
//!
//! Watches the event stream for new jobs, decides whether to bid
//! (selection policy, then capacity), runs accepted shards through the
//! executor, and proposes results for verification. Long work happens on
//! detached workers that report back by publishing events; the role's
//! event loop itself never blocks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capacity::{parse_resource_usage_config, CapacityManager};
use crate::config::ComputeNodeConfig;
use crate::controller::Controller;
use crate::executor::ExecutorRegistry;
use crate::job::{
    Job, JobEvent, JobEventKind, JobLocalEvent, JobLocalEventKind, ShardState, StorageSpec,
};
use crate::selection::JobSelectionPolicy;
use crate::shutdown::Shutdown;
use crate::storage::{StorageRegistry, StorageVolume};
use crate::types::{FlotillaError, FlotillaResult, JobId, ShardIndex};
use crate::verifier::VerifierRegistry;

const SELECTION_RETRIES: u32 = 3;
const SELECTION_RETRY_BASE: Duration = Duration::from_millis(500);

/// Book-keeping for a shard this node is (or was) running.
struct ActiveShard {
    input_volumes: Vec<(StorageSpec, StorageVolume)>,
    output_volumes: Vec<StorageVolume>,
    run: Option<tokio::task::JoinHandle<()>>,
}

pub struct ComputeNode {
    controller: Arc<Controller>,
    policy: JobSelectionPolicy,
    capacity: Arc<CapacityManager>,
    executors: ExecutorRegistry,
    verifiers: VerifierRegistry,
    storage: StorageRegistry,
    /// Jobs that passed selection but found no capacity; retried on the
    /// next release.
    backlog: Mutex<Vec<JobId>>,
    active: Mutex<HashMap<(JobId, ShardIndex), ActiveShard>>,
    weak_self: std::sync::Weak<ComputeNode>,
}

impl ComputeNode {
    pub fn new(
        controller: Arc<Controller>,
        config: ComputeNodeConfig,
        executors: ExecutorRegistry,
        verifiers: VerifierRegistry,
        storage: StorageRegistry,
    ) -> FlotillaResult<Arc<Self>> {
        let capacity = Arc::new(CapacityManager::new(config.capacity)?);
        Ok(Arc::new_cyclic(|weak_self| Self {
            controller,
            policy: config.job_selection_policy,
            capacity,
            executors,
            verifiers,
            storage,
            backlog: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        }))
    }

    /// The capacity accountant, exposed for tests and the serve wiring.
    pub fn capacity(&self) -> Arc<CapacityManager> {
        self.capacity.clone()
    }

    /// Spawn the role: one event loop, one backlog-retry loop.
    pub fn start(&self, shutdown: Shutdown) {
        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        let mut events = node.controller.subscribe_compute();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => node.handle_event(event).await,
                            None => break,
                        }
                    }
                    _ = token.cancelled() => {
                        node.cancel_all_active().await;
                        break;
                    }
                }
            }
        });

        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let notify = node.capacity.release_notifier();
            loop {
                tokio::select! {
                    _ = notify.notified() => node.retry_backlog().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn handle_event(&self, event: JobEvent) {
        let me = self.controller.host_id();
        match event.kind {
            JobEventKind::JobCreated => {
                if let Ok(job) = self.controller.get_job(event.job_id).await {
                    self.consider_job(job).await;
                }
            }
            JobEventKind::BidAccepted if event.target_node_id.as_ref() == Some(&me) => {
                if let (Some(shard), Ok(job)) =
                    (event.shard_index, self.controller.get_job(event.job_id).await)
                {
                    self.on_bid_accepted(job, shard).await;
                }
            }
            JobEventKind::ResultsAccepted | JobEventKind::ResultsRejected
                if event.target_node_id.as_ref() == Some(&me) =>
            {
                if let Some(shard) = event.shard_index {
                    self.finish_shard(event.job_id, shard).await;
                }
            }
            JobEventKind::Cancelled if event.target_node_id.as_ref() == Some(&me) => {
                if let Some(shard) = event.shard_index {
                    self.finish_shard(event.job_id, shard).await;
                }
            }
            _ => {}
        }
    }

    /// Evaluate a fresh job: selection policy first, then capacity.
    async fn consider_job(&self, job: Job) {
        let me = self.controller.host_id();

        if !self.executors.has(job.spec.engine) || !self.verifiers.has(job.spec.verifier) {
            debug!(job_id = %job.id, engine = %job.spec.engine, "engine or verifier not available here");
            let _ = self.controller.record_local_event(
                JobLocalEvent::new(job.id, JobLocalEventKind::SelectedJob)
                    .with_status("rejected: engine or verifier not available"),
                vec![],
            );
            return;
        }

        let selected = match self.should_bid_with_retry(&job).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!(job_id = %job.id, "selection failed, not bidding: {}", e);
                false
            }
        };
        if !selected {
            let _ = self.controller.record_local_event(
                JobLocalEvent::new(job.id, JobLocalEventKind::SelectedJob)
                    .with_status("rejected by selection policy"),
                vec![],
            );
            return;
        }

        let requirement = match parse_resource_usage_config(&job.spec.resources) {
            Ok(req) => req,
            Err(e) => {
                warn!(job_id = %job.id, "unparseable resource request, not bidding: {}", e);
                let _ = self.controller.record_local_event(
                    JobLocalEvent::new(job.id, JobLocalEventKind::SelectedJob)
                        .with_status(format!("rejected: {}", e)),
                    vec![],
                );
                return;
            }
        };

        let selected_shards: Vec<(ShardIndex, ShardState, String)> = (0..job.spec.shard_count())
            .map(|shard| (shard, ShardState::Selected, "selected".to_string()))
            .collect();
        let _ = self.controller.record_local_event(
            JobLocalEvent::new(job.id, JobLocalEventKind::SelectedJob).with_status("accepted"),
            selected_shards,
        );

        if !self.capacity.can_run(&requirement) {
            info!(job_id = %job.id, "no capacity, deferring job");
            self.backlog.lock().push(job.id);
            return;
        }

        self.bid(&job, me.as_str()).await;
    }

    /// Selection probes can fail transiently; retry a few times before
    /// treating the job as rejected.
    async fn should_bid_with_retry(&self, job: &Job) -> FlotillaResult<bool> {
        let me = self.controller.host_id();
        let mut backoff = SELECTION_RETRY_BASE;
        for attempt in 1..=SELECTION_RETRIES {
            match self.policy.should_bid(&me, job, &self.storage).await {
                Ok(answer) => return Ok(answer),
                Err(e) if e.is_transient() && attempt < SELECTION_RETRIES => {
                    warn!(job_id = %job.id, attempt, "selection probe failed, retrying: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Publish one bid per shard and memoize that we did.
    async fn bid(&self, job: &Job, me: &str) {
        for shard in 0..job.spec.shard_count() {
            let event = JobEvent::new(job.id, JobEventKind::BidReceived, me.into())
                .with_shard(shard)
                .with_status("bid");
            if let Err(e) = self.controller.publish(event) {
                warn!(job_id = %job.id, shard, "failed to publish bid: {}", e);
                return;
            }
        }
        let _ = self.controller.record_local_event(
            JobLocalEvent::new(job.id, JobLocalEventKind::BidSent)
                .with_status(format!("bid on {} shard(s)", job.spec.shard_count())),
            vec![],
        );
        debug!(job_id = %job.id, "bid published");
    }

    /// Deferred jobs get another look whenever capacity frees up.
    async fn retry_backlog(&self) {
        let deferred: Vec<JobId> = std::mem::take(&mut *self.backlog.lock());
        for job_id in deferred {
            let Ok(job) = self.controller.get_job(job_id).await else {
                continue;
            };
            if self
                .controller
                .get_job_state(job_id)
                .await
                .map(|s| s.kind.is_terminal())
                .unwrap_or(true)
            {
                debug!(job_id = %job_id, "deferred job is terminal, dropping");
                continue;
            }
            let Ok(requirement) = parse_resource_usage_config(&job.spec.resources) else {
                continue;
            };
            if self.capacity.can_run(&requirement) {
                info!(job_id = %job_id, "capacity freed, bidding on deferred job");
                let me = self.controller.host_id();
                self.bid(&job, me.as_str()).await;
            } else {
                self.backlog.lock().push(job_id);
            }
        }
    }

    /// Our bid was accepted: reserve capacity and launch the shard
    /// worker. Reservations are keyed by (job, shard), so a replayed
    /// acceptance cannot double-charge.
    async fn on_bid_accepted(&self, job: Job, shard: ShardIndex) {
        if self.active.lock().contains_key(&(job.id, shard)) {
            debug!(job_id = %job.id, shard, "shard already running, ignoring replay");
            return;
        }

        let requirement = match parse_resource_usage_config(&job.spec.resources) {
            Ok(req) => req,
            Err(e) => {
                self.publish_shard_error(&job, shard, &format!("bad resource request: {}", e));
                return;
            }
        };
        if !self.capacity.reserve(job.id, shard, &requirement) {
            // Lost the race against another acceptance.
            self.publish_shard_error(&job, shard, "capacity exhausted after acceptance");
            self.capacity.release(job.id, shard);
            return;
        }

        self.active.lock().insert(
            (job.id, shard),
            ActiveShard {
                input_volumes: Vec::new(),
                output_volumes: Vec::new(),
                run: None,
            },
        );

        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            if let Err(e) = node.clone().run_shard(job.clone(), shard).await {
                warn!(job_id = %job.id, shard, "shard run failed: {}", e);
                node.publish_shard_error(&job, shard, &e.to_string());
                node.finish_shard(job.id, shard).await;
            }
        });
        if let Some(entry) = self.active.lock().get_mut(&(job_id, shard)) {
            entry.run = Some(handle);
        }
    }

    /// Prepare volumes, execute, propose results. Runs detached.
    async fn run_shard(self: Arc<Self>, job: Job, shard: ShardIndex) -> FlotillaResult<()> {
        let me = self.controller.host_id();
        let _ = self
            .controller
            .record_shard_progress(job.id, shard, ShardState::Running, "running");

        for spec in job.spec.shard_inputs(shard) {
            let provider = self.storage.for_spec(&spec)?;
            let volume = provider.prepare_storage(&spec).await?;
            if let Some(entry) = self.active.lock().get_mut(&(job.id, shard)) {
                entry.input_volumes.push((spec, volume));
            }
        }

        for output in &job.spec.outputs {
            let scratch =
                std::env::temp_dir().join(format!("flotilla-out-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&scratch)?;
            let volume = StorageVolume {
                source: scratch,
                target: output.path.clone(),
            };
            if let Some(entry) = self.active.lock().get_mut(&(job.id, shard)) {
                entry.output_volumes.push(volume);
            }
        }

        let volumes: Vec<StorageVolume> = {
            let active = self.active.lock();
            let entry = active
                .get(&(job.id, shard))
                .ok_or_else(|| FlotillaError::ExecutorFailure("shard cancelled".into()))?;
            entry
                .input_volumes
                .iter()
                .map(|(_, v)| v.clone())
                .chain(entry.output_volumes.iter().cloned())
                .collect()
        };

        let executor = self.executors.get(job.spec.engine)?;
        let results_dir = executor.run_shard(&job, shard, &volumes).await?;

        let verifier = self.verifiers.get(job.spec.verifier)?;
        let results_id = verifier
            .process_shard_results(&job, shard, &results_dir)
            .await?;

        let event = JobEvent::new(job.id, JobEventKind::ResultsProposed, me)
            .with_shard(shard)
            .with_status("results proposed")
            .with_results_id(results_id);
        self.controller.publish(event)?;
        Ok(())
    }

    fn publish_shard_error(&self, job: &Job, shard: ShardIndex, status: &str) {
        let me = self.controller.host_id();
        let event = JobEvent::new(job.id, JobEventKind::Error, me)
            .with_shard(shard)
            .with_status(status);
        if let Err(e) = self.controller.publish(event) {
            warn!(job_id = %job.id, shard, "failed to publish error event: {}", e);
        }
    }

    /// Terminal event for one of our shards: drop volumes, free capacity.
    async fn finish_shard(&self, job_id: JobId, shard: ShardIndex) {
        let Some(entry) = self.active.lock().remove(&(job_id, shard)) else {
            self.capacity.release(job_id, shard);
            return;
        };
        if let Some(handle) = &entry.run {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        self.cleanup_volumes(entry).await;
        self.capacity.release(job_id, shard);
        debug!(job_id = %job_id, shard, "shard finished and released");
    }

    async fn cleanup_volumes(&self, entry: ActiveShard) {
        for (spec, volume) in entry.input_volumes {
            if let Ok(provider) = self.storage.for_spec(&spec) {
                if let Err(e) = provider.cleanup_storage(&spec, &volume).await {
                    warn!("failed to clean up input volume: {}", e);
                }
            }
        }
        for volume in entry.output_volumes {
            let path: PathBuf = volume.source;
            if path.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!("failed to clean up output volume: {}", e);
                }
            }
        }
    }

    /// Process shutdown: kill in-flight runs, release every reservation,
    /// and say goodbye with one Cancelled event per (shard, node).
    async fn cancel_all_active(&self) {
        let me = self.controller.host_id();
        let entries: Vec<((JobId, ShardIndex), ActiveShard)> =
            self.active.lock().drain().collect();
        for ((job_id, shard), entry) in entries {
            if let Some(handle) = &entry.run {
                if !handle.is_finished() {
                    handle.abort();
                }
            }
            self.cleanup_volumes(entry).await;
            self.capacity.release(job_id, shard);
            let event = JobEvent::new(job_id, JobEventKind::Cancelled, me.clone())
                .with_shard(shard)
                .with_target(me.clone())
                .with_status("node shutting down");
            let _ = self.controller.publish(event);
        }
    }
}
