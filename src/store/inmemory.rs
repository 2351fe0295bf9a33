//! In-memory job store. The controller is the only writer; readers get
//! consistent snapshots by cloning under the read lock.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::job::{Job, JobEvent, JobLocalEvent, JobShardState, JobState, JobStateKind};
use crate::store::{JobListFilter, JobStore, ShardStateUpdate};
use crate::types::{FlotillaError, FlotillaResult, JobId, NodeId};

#[derive(Debug, Clone)]
struct JobRecord {
    job: Job,
    state: JobState,
    events: Vec<JobEvent>,
    local_events: Vec<JobLocalEvent>,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<JobId, JobRecord>,
    seen_events: HashSet<Uuid>,
}

/// In-memory implementation of [`JobStore`].
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add_job(&self, job: Job) -> FlotillaResult<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(FlotillaError::BadSpec(format!(
                "job {} already exists",
                job.id
            )));
        }
        inner.jobs.insert(
            job.id,
            JobRecord {
                job,
                state: JobState::default(),
                events: Vec::new(),
                local_events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn add_event(&self, job_id: JobId, event: JobEvent) -> FlotillaResult<bool> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(&job_id) {
            return Err(FlotillaError::NotFound(format!("job {}", job_id)));
        }
        if !inner.seen_events.insert(event.event_id) {
            return Ok(false);
        }
        if let Some(record) = inner.jobs.get_mut(&job_id) {
            record.events.push(event);
        }
        Ok(true)
    }

    async fn add_local_event(&self, job_id: JobId, event: JobLocalEvent) -> FlotillaResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))?;
        record.local_events.push(event);
        Ok(())
    }

    async fn update_shard_state(
        &self,
        job_id: JobId,
        update: ShardStateUpdate,
    ) -> FlotillaResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))?;
        let slot = record
            .state
            .shards
            .entry(update.shard_index)
            .or_default()
            .entry(update.node_id.clone())
            .or_insert_with(|| JobShardState {
                node_id: update.node_id.clone(),
                shard_index: update.shard_index,
                state: update.state,
                status: String::new(),
                results_id: String::new(),
            });
        slot.state = update.state;
        slot.status = update.status;
        if !update.results_id.is_empty() {
            slot.results_id = update.results_id;
        }
        Ok(())
    }

    async fn update_job_state_kind(
        &self,
        job_id: JobId,
        kind: JobStateKind,
    ) -> FlotillaResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))?;
        record.state.kind = kind;
        Ok(())
    }

    async fn append_assigned_node(&self, job_id: JobId, node: NodeId) -> FlotillaResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))?;
        if !record.job.deal.assigned_nodes.contains(&node) {
            record.job.deal.assigned_nodes.push(node);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> FlotillaResult<Job> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&job_id)
            .map(|r| r.job.clone())
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))
    }

    async fn get_job_state(&self, job_id: JobId) -> FlotillaResult<JobState> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&job_id)
            .map(|r| r.state.clone())
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))
    }

    async fn get_events(&self, job_id: JobId) -> FlotillaResult<Vec<JobEvent>> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&job_id)
            .map(|r| r.events.clone())
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))
    }

    async fn get_local_events(&self, job_id: JobId) -> FlotillaResult<Vec<JobLocalEvent>> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&job_id)
            .map(|r| r.local_events.clone())
            .ok_or_else(|| FlotillaError::NotFound(format!("job {}", job_id)))
    }

    async fn get_jobs(&self, filter: &JobListFilter) -> FlotillaResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|r| {
                let id_ok = filter
                    .id_prefix
                    .as_ref()
                    .map(|p| r.job.id.to_string().starts_with(p.as_str()))
                    .unwrap_or(true);
                let annotation_ok = filter
                    .annotation
                    .as_ref()
                    .map(|a| r.job.spec.annotations.contains(a))
                    .unwrap_or(true);
                id_ok && annotation_ok
            })
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn has_job(&self, job_id: JobId) -> bool {
        self.inner.read().await.jobs.contains_key(&job_id)
    }
}
