//! # Job Data Model
//!
//! Jobs, deals, shard state machines and the event vocabulary that is
//! gossiped between nodes. A job is immutable once created; everything
//! that happens to it afterwards is expressed as applied events, and the
//! per-(shard, node) state machine in [`ShardState`] is the only thing a
//! node is allowed to advance.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ClientId, JobId, NodeId, ShardIndex};

/// Execution engine a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    /// Containerized execution; the runtime itself lives outside the core.
    Docker,
    /// Test engine that fabricates results without running anything.
    Noop,
}

impl EngineKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "docker" => Some(EngineKind::Docker),
            "noop" => Some(EngineKind::Noop),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Docker => write!(f, "docker"),
            EngineKind::Noop => write!(f, "noop"),
        }
    }
}

/// Verification strategy for a job's shard results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerifierKind {
    /// Upload the results folder to the content-addressed blob store and
    /// accept whatever comes back.
    Blob,
    /// Test verifier; the results folder path doubles as the results id.
    Noop,
}

impl VerifierKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "blob" | "ipfs" => Some(VerifierKind::Blob),
            "noop" => Some(VerifierKind::Noop),
            _ => None,
        }
    }
}

impl std::fmt::Display for VerifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifierKind::Blob => write!(f, "blob"),
            VerifierKind::Noop => write!(f, "noop"),
        }
    }
}

/// Where a named input (or output) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageSourceKind {
    /// Content-addressed blob store, referenced by cid.
    Ipfs,
    /// Public URL fetched over http(s) before the shard runs.
    UrlDownload,
}

impl StorageSourceKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ipfs" => Some(StorageSourceKind::Ipfs),
            "url" | "urldownload" => Some(StorageSourceKind::UrlDownload),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageSourceKind::Ipfs => write!(f, "ipfs"),
            StorageSourceKind::UrlDownload => write!(f, "urldownload"),
        }
    }
}

/// A named piece of data a job mounts or produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub engine: Option<StorageSourceKind>,
    #[serde(default)]
    pub name: String,
    /// Content address, for [`StorageSourceKind::Ipfs`] sources.
    #[serde(default)]
    pub cid: String,
    /// Source URL, for [`StorageSourceKind::UrlDownload`] sources.
    #[serde(default)]
    pub url: String,
    /// Mount point inside the execution environment.
    #[serde(default)]
    pub path: String,
}

/// Container half of a job spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecDocker {
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

/// Requested resources, as submitted (unparsed strings; empty = no claim).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageConfig {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub gpu: String,
}

/// How a job's inputs are split into shards. A batch size of zero keeps
/// every input on a single shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecSharding {
    #[serde(default)]
    pub batch_size: u32,
}

/// Everything a compute node needs to know to run a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub engine: EngineKind,
    pub verifier: VerifierKind,
    #[serde(default)]
    pub resources: ResourceUsageConfig,
    #[serde(default)]
    pub docker: JobSpecDocker,
    #[serde(default)]
    pub inputs: Vec<StorageSpec>,
    #[serde(default)]
    pub outputs: Vec<StorageSpec>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub sharding: JobSpecSharding,
}

impl JobSpec {
    /// Shard count inferred from the inputs: inputs are chunked into
    /// groups of `sharding.batch_size`; zero-input jobs (and a zero batch
    /// size) collapse to a single shard.
    pub fn shard_count(&self) -> u32 {
        let batch = self.sharding.batch_size;
        if batch == 0 || self.inputs.is_empty() {
            return 1;
        }
        (self.inputs.len() as u32).div_ceil(batch)
    }

    /// Submission-time validation; failures here mean nothing is ever
    /// published for the job.
    pub fn validate_for_submission(&self, deal: &JobDeal) -> Result<(), String> {
        if self.docker.image.is_empty() {
            return Err("empty container image".to_string());
        }
        if deal.concurrency == 0 {
            return Err("concurrency must be positive".to_string());
        }
        for input in &self.inputs {
            if input.path.is_empty() {
                return Err(format!("empty volume mount point for input {:?}", input));
            }
            match input.engine {
                Some(StorageSourceKind::Ipfs) if input.cid.is_empty() => {
                    return Err(format!("empty cid for input {:?}", input));
                }
                Some(StorageSourceKind::UrlDownload) if input.url.is_empty() => {
                    return Err(format!("empty url for input {:?}", input));
                }
                None => return Err(format!("input {:?} has no storage engine", input)),
                _ => {}
            }
        }
        Ok(())
    }

    /// The inputs mounted by one shard.
    pub fn shard_inputs(&self, shard_index: ShardIndex) -> Vec<StorageSpec> {
        let batch = self.sharding.batch_size;
        if batch == 0 || self.inputs.is_empty() {
            return self.inputs.clone();
        }
        self.inputs
            .iter()
            .skip((shard_index * batch) as usize)
            .take(batch as usize)
            .cloned()
            .collect()
    }
}

/// The requester's acceptance contract: how many distinct nodes should
/// run each shard, and which nodes ended up assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDeal {
    pub concurrency: u32,
    #[serde(default)]
    pub assigned_nodes: Vec<NodeId>,
}

/// A submitted job. Identity fields are immutable; the deal's assigned
/// node set grows as bids are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: ClientId,
    pub requester_node_id: NodeId,
    pub spec: JobSpec,
    pub deal: JobDeal,
    pub created_at: DateTime<Utc>,
}

/// Per-node view of one shard of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardState {
    New,
    Selected,
    Bidding,
    Accepted,
    Rejected,
    Running,
    ResultsProposed,
    ResultsAccepted,
    ResultsRejected,
    Completed,
    Error,
    Cancelled,
}

impl ShardState {
    /// Whether this state ends the shard-node slot's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShardState::Rejected
                | ShardState::Completed
                | ShardState::Error
                | ShardState::Cancelled
        )
    }

    /// The monotone state machine: which states may directly follow this
    /// one. Cancellation is reachable from every non-terminal state, and
    /// errors can strike anywhere after selection.
    pub fn can_transition_to(&self, next: ShardState) -> bool {
        use ShardState::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return false;
        }
        match next {
            Cancelled => true,
            Error => !matches!(self, New),
            _ => matches!(
                (self, next),
                (New, Selected)
                    | (New, Bidding)
                    | (Selected, Bidding)
                    | (Bidding, Accepted)
                    | (Bidding, Rejected)
                    | (Accepted, Running)
                    | (Accepted, ResultsProposed)
                    | (Running, ResultsProposed)
                    | (ResultsProposed, ResultsAccepted)
                    | (ResultsProposed, ResultsRejected)
                    | (ResultsAccepted, Completed)
                    | (ResultsRejected, Error)
            ),
        }
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// State of one (shard, node) slot as tracked by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobShardState {
    pub node_id: NodeId,
    pub shard_index: ShardIndex,
    pub state: ShardState,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub results_id: String,
}

/// Requester-side roll-up of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStateKind {
    New,
    InProgress,
    Complete,
    Error,
    Cancelled,
}

impl JobStateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStateKind::Complete | JobStateKind::Error | JobStateKind::Cancelled
        )
    }
}

impl std::fmt::Display for JobStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Projection of the event log for one job: roll-up state plus every
/// (shard, node) slot observed so far, keyed by `(shard_index, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub kind: JobStateKind,
    pub shards: HashMap<ShardIndex, HashMap<NodeId, JobShardState>>,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            kind: JobStateKind::New,
            shards: HashMap::new(),
        }
    }
}

impl JobState {
    pub fn shard_state(&self, shard: ShardIndex, node: &NodeId) -> Option<&JobShardState> {
        self.shards.get(&shard).and_then(|nodes| nodes.get(node))
    }

    /// Flatten to a list, shards ascending then node ids ascending; the
    /// order the CLI renders them in.
    pub fn flatten(&self) -> Vec<JobShardState> {
        let mut shard_indexes: Vec<ShardIndex> = self.shards.keys().copied().collect();
        shard_indexes.sort_unstable();
        let mut out = Vec::new();
        for idx in shard_indexes {
            let nodes = &self.shards[&idx];
            let mut node_ids: Vec<&NodeId> = nodes.keys().collect();
            node_ids.sort();
            for node_id in node_ids {
                out.push(nodes[node_id].clone());
            }
        }
        out
    }

    /// Whether a slot's state means the node was accepted onto the shard.
    /// Pre-acceptance states (and a rejected bid) don't count.
    fn slot_accepted(state: ShardState) -> bool {
        !matches!(
            state,
            ShardState::New
                | ShardState::Selected
                | ShardState::Bidding
                | ShardState::Rejected
        )
    }

    /// Nodes that ever reached `Accepted` on the given shard.
    pub fn accepted_nodes(&self, shard: ShardIndex) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .shards
            .get(&shard)
            .map(|m| {
                m.values()
                    .filter(|s| Self::slot_accepted(s.state))
                    .map(|s| s.node_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    /// A job is terminal iff every accepted (shard, node) slot is
    /// terminal. Slots that never got past bidding don't count.
    pub fn accepted_slots_terminal(&self) -> bool {
        self.shards
            .values()
            .flat_map(|m| m.values())
            .all(|slot| !Self::slot_accepted(slot.state) || slot.state.is_terminal())
    }

    /// Whether any slot was ever accepted anywhere.
    pub fn has_accepted_slots(&self) -> bool {
        self.shards
            .values()
            .flat_map(|m| m.values())
            .any(|slot| Self::slot_accepted(slot.state))
    }

    /// Once every accepted slot is terminal, decide what the job rolls
    /// up to: Complete when every shard with accepted work got at least
    /// one Completed slot, Cancelled when cancellation is what stopped a
    /// shard, Error otherwise.
    pub fn resolve_terminal_kind(&self) -> JobStateKind {
        let mut saw_cancelled_shard = false;
        for nodes in self.shards.values() {
            let accepted: Vec<&JobShardState> = nodes
                .values()
                .filter(|s| Self::slot_accepted(s.state))
                .collect();
            if accepted.is_empty() {
                continue;
            }
            if accepted.iter().any(|s| s.state == ShardState::Completed) {
                continue;
            }
            if accepted.iter().any(|s| s.state == ShardState::Cancelled) {
                saw_cancelled_shard = true;
            } else {
                return JobStateKind::Error;
            }
        }
        if saw_cancelled_shard {
            JobStateKind::Cancelled
        } else {
            JobStateKind::Complete
        }
    }
}

/// Events gossiped between nodes. Each event names the job (and usually
/// the shard) it concerns; the store is consulted for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventKind {
    JobCreated,
    BidReceived,
    BidAccepted,
    BidRejected,
    ResultsProposed,
    ResultsAccepted,
    ResultsRejected,
    Error,
    Cancelled,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One entry in a job's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Identity used for transport-level and store-level deduplication.
    pub event_id: Uuid,
    pub job_id: JobId,
    pub shard_index: Option<ShardIndex>,
    pub kind: JobEventKind,
    pub source_node_id: NodeId,
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub status: String,
    /// Full spec, carried on JobCreated so compute nodes can evaluate the
    /// job without a prior store entry.
    pub spec: Option<JobSpec>,
    pub deal: Option<JobDeal>,
    #[serde(default)]
    pub results_id: String,
    pub event_time: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind, source: NodeId) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            job_id,
            shard_index: None,
            kind,
            source_node_id: source,
            target_node_id: None,
            status: String::new(),
            spec: None,
            deal: None,
            results_id: String::new(),
            event_time: Utc::now(),
        }
    }

    pub fn with_shard(mut self, shard: ShardIndex) -> Self {
        self.shard_index = Some(shard);
        self
    }

    pub fn with_target(mut self, target: NodeId) -> Self {
        self.target_node_id = Some(target);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_results_id(mut self, results_id: impl Into<String>) -> Self {
        self.results_id = results_id.into();
        self
    }
}

/// Events a node records about its own intent; applied to the local
/// store only and never gossiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobLocalEventKind {
    SelectedJob,
    BidSent,
}

impl std::fmt::Display for JobLocalEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Local-only memo of a node's own decision about a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLocalEvent {
    pub kind: JobLocalEventKind,
    pub job_id: JobId,
    pub shard_index: Option<ShardIndex>,
    #[serde(default)]
    pub status: String,
    pub event_time: DateTime<Utc>,
}

impl JobLocalEvent {
    pub fn new(job_id: JobId, kind: JobLocalEventKind) -> Self {
        Self {
            kind,
            job_id,
            shard_index: None,
            status: String::new(),
            event_time: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_inputs(n: usize, batch: u32) -> JobSpec {
        JobSpec {
            engine: EngineKind::Noop,
            verifier: VerifierKind::Noop,
            resources: ResourceUsageConfig::default(),
            docker: JobSpecDocker::default(),
            inputs: (0..n)
                .map(|i| StorageSpec {
                    engine: Some(StorageSourceKind::Ipfs),
                    cid: format!("cid-{}", i),
                    path: format!("/inputs/{}", i),
                    ..Default::default()
                })
                .collect(),
            outputs: vec![],
            workdir: String::new(),
            annotations: vec![],
            sharding: JobSpecSharding { batch_size: batch },
        }
    }

    #[test]
    fn test_shard_count_defaults_to_one() {
        assert_eq!(spec_with_inputs(0, 0).shard_count(), 1);
        assert_eq!(spec_with_inputs(5, 0).shard_count(), 1);
    }

    #[test]
    fn test_shard_count_chunks_inputs() {
        assert_eq!(spec_with_inputs(5, 2).shard_count(), 3);
        assert_eq!(spec_with_inputs(4, 2).shard_count(), 2);
        let spec = spec_with_inputs(5, 2);
        assert_eq!(spec.shard_inputs(0).len(), 2);
        assert_eq!(spec.shard_inputs(2).len(), 1);
        assert_eq!(spec.shard_inputs(2)[0].cid, "cid-4");
    }

    #[test]
    fn test_shard_state_machine_happy_path() {
        let path = [
            ShardState::New,
            ShardState::Selected,
            ShardState::Bidding,
            ShardState::Accepted,
            ShardState::Running,
            ShardState::ResultsProposed,
            ShardState::ResultsAccepted,
            ShardState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_shard_state_machine_rejects_regressions() {
        assert!(!ShardState::Running.can_transition_to(ShardState::Bidding));
        assert!(!ShardState::Completed.can_transition_to(ShardState::Running));
        assert!(!ShardState::Cancelled.can_transition_to(ShardState::Error));
        assert!(!ShardState::Rejected.can_transition_to(ShardState::Accepted));
    }

    #[test]
    fn test_cancel_reachable_from_non_terminal() {
        for s in [
            ShardState::New,
            ShardState::Selected,
            ShardState::Bidding,
            ShardState::Accepted,
            ShardState::Running,
            ShardState::ResultsProposed,
        ] {
            assert!(s.can_transition_to(ShardState::Cancelled));
        }
    }

    #[test]
    fn test_terminality_ignores_unaccepted_slots() {
        let mut state = JobState::default();
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::from("a"),
            JobShardState {
                node_id: NodeId::from("a"),
                shard_index: 0,
                state: ShardState::Completed,
                status: String::new(),
                results_id: String::new(),
            },
        );
        nodes.insert(
            NodeId::from("b"),
            JobShardState {
                node_id: NodeId::from("b"),
                shard_index: 0,
                state: ShardState::Rejected,
                status: String::new(),
                results_id: String::new(),
            },
        );
        state.shards.insert(0, nodes);
        assert!(state.accepted_slots_terminal());
        assert!(state.has_accepted_slots());
        assert_eq!(state.accepted_nodes(0), vec![NodeId::from("a")]);
    }
}
