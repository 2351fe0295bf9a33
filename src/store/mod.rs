//! # Job Store
//!
//! Durable (or in-memory) projection from the event log into current
//! job, deal and shard state. The store owns the entity graph; every
//! mutation flows through the controller, which applies events one at a
//! time, so implementations only need single-writer semantics with
//! consistent reader snapshots.

pub mod inmemory;

use async_trait::async_trait;

use crate::job::{Job, JobEvent, JobLocalEvent, JobState, JobStateKind, ShardState};
use crate::types::{FlotillaResult, JobId, NodeId, ShardIndex};

pub use inmemory::InMemoryJobStore;

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    /// Match jobs whose id string starts with this prefix (short ids).
    pub id_prefix: Option<String>,
    /// Match jobs carrying this annotation.
    pub annotation: Option<String>,
}

/// Shard-state mutation applied by the controller.
#[derive(Debug, Clone)]
pub struct ShardStateUpdate {
    pub shard_index: ShardIndex,
    pub node_id: NodeId,
    pub state: ShardState,
    pub status: String,
    /// Empty string leaves any previously recorded results id in place.
    pub results_id: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a newly created job. Re-adding an existing id is an error.
    async fn add_job(&self, job: Job) -> FlotillaResult<()>;

    /// Append an event to the job's log. Returns `false` when the event
    /// id was seen before (the write is idempotent and skipped).
    async fn add_event(&self, job_id: JobId, event: JobEvent) -> FlotillaResult<bool>;

    /// Append a local-only event (never gossiped).
    async fn add_local_event(&self, job_id: JobId, event: JobLocalEvent) -> FlotillaResult<()>;

    /// Apply a shard-state transition. Implementations store whatever the
    /// controller hands them; transition legality is the controller's job.
    async fn update_shard_state(
        &self,
        job_id: JobId,
        update: ShardStateUpdate,
    ) -> FlotillaResult<()>;

    /// Overwrite the requester-side roll-up state.
    async fn update_job_state_kind(&self, job_id: JobId, kind: JobStateKind)
        -> FlotillaResult<()>;

    /// Record a node as assigned in the job's deal (idempotent).
    async fn append_assigned_node(&self, job_id: JobId, node: NodeId) -> FlotillaResult<()>;

    async fn get_job(&self, job_id: JobId) -> FlotillaResult<Job>;

    async fn get_job_state(&self, job_id: JobId) -> FlotillaResult<JobState>;

    async fn get_events(&self, job_id: JobId) -> FlotillaResult<Vec<JobEvent>>;

    async fn get_local_events(&self, job_id: JobId) -> FlotillaResult<Vec<JobLocalEvent>>;

    async fn get_jobs(&self, filter: &JobListFilter) -> FlotillaResult<Vec<Job>>;

    /// Whether the job exists at all.
    async fn has_job(&self, job_id: JobId) -> bool;
}
