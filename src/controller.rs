//! # Controller
//!
//! The single entry point mutating a node's view of the world. One
//! ingest loop per node receives events — from the transport, from local
//! submission, from role callbacks — applies them to the store, and fans
//! them out to the subscribed roles. Role publishes are enqueued rather
//! than inlined, so a handler can publish follow-on events without
//! growing the stack or inverting locks.
//!
//! Guarantees kept here:
//! - at-most-once local effect per event id (store-level dedup),
//! - per (job, shard, node) transitions are monotone; an event that would
//!   regress a slot is dropped and logged,
//! - subscribers never block the loop (unbounded fan-out channels).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::job::{
    Job, JobDeal, JobEvent, JobEventKind, JobLocalEvent, JobSpec, JobState, JobStateKind,
    ShardState,
};
use crate::shutdown::Shutdown;
use crate::store::{JobListFilter, JobStore, ShardStateUpdate};
use crate::transport::Transport;
use crate::types::{ClientId, FlotillaError, FlotillaResult, JobId, NodeId, ShardIndex};

const PUBLISH_RETRIES: u32 = 3;
const PUBLISH_RETRY_BASE: Duration = Duration::from_millis(250);

enum ControllerCommand {
    /// Put an event on the wire (self-delivery will apply it locally).
    Publish(JobEvent),
    /// Record a local-only event and/or move this node's own shard slots.
    ApplyLocal {
        event: Option<JobLocalEvent>,
        job_id: JobId,
        shard_states: Vec<(ShardIndex, ShardState, String)>,
    },
}

/// Per-node serializer of state transitions.
pub struct Controller {
    node_id: NodeId,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn Transport>,
    command_tx: mpsc::UnboundedSender<ControllerCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<ControllerCommand>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
    weak_self: std::sync::Weak<Controller>,
}

impl Controller {
    pub fn new(store: Arc<dyn JobStore>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak_self| Self {
            node_id: transport.host_id(),
            store,
            transport,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            subscribers: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn host_id(&self) -> NodeId {
        self.node_id.clone()
    }

    /// Spawn the ingest loop. Call once, before roles start publishing.
    pub fn start(&self, shutdown: Shutdown) {
        let Some(mut command_rx) = self.command_rx.lock().take() else {
            warn!(node = %self.node_id, "controller already started");
            return;
        };
        let mut transport_rx = self.transport.subscribe();
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            info!(node = %controller.node_id, "controller started");
            loop {
                tokio::select! {
                    event = transport_rx.recv() => {
                        match event {
                            Some(event) => controller.apply_event(event).await,
                            None => {
                                info!("transport stream closed, stopping controller");
                                break;
                            }
                        }
                    }
                    command = command_rx.recv() => {
                        match command {
                            Some(cmd) => controller.handle_command(cmd).await,
                            None => break,
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!(node = %controller.node_id, "controller shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Role-facing event stream for the compute side.
    pub fn subscribe_compute(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.subscribe()
    }

    /// Role-facing event stream for the requester side.
    pub fn subscribe_requester(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.subscribe()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Submit a job at this node: persist it, then announce it. The
    /// stored spec is exactly the submitted spec, so a later fetch
    /// round-trips bit-for-bit.
    pub async fn submit(
        &self,
        spec: JobSpec,
        deal: JobDeal,
        client_id: ClientId,
    ) -> FlotillaResult<Job> {
        spec.validate_for_submission(&deal)
            .map_err(FlotillaError::BadSpec)?;
        let job = Job {
            id: JobId::new(),
            client_id,
            requester_node_id: self.node_id.clone(),
            spec: spec.clone(),
            deal: deal.clone(),
            created_at: Utc::now(),
        };
        self.store.add_job(job.clone()).await?;

        let mut event = JobEvent::new(job.id, JobEventKind::JobCreated, self.node_id.clone())
            .with_status("job created");
        event.spec = Some(spec);
        event.deal = Some(deal);
        self.publish(event)?;

        info!(job_id = %job.id, "job submitted");
        Ok(job)
    }

    /// Enqueue an event for broadcast. Never applies inline: the loop
    /// hands it to the transport and self-delivery brings it back.
    pub fn publish(&self, event: JobEvent) -> FlotillaResult<()> {
        self.command_tx
            .send(ControllerCommand::Publish(event))
            .map_err(|_| FlotillaError::Fatal("controller loop stopped".into()))
    }

    /// Record a local-only event, optionally advancing this node's own
    /// shard slots (selection and running are per-node knowledge that is
    /// never gossiped).
    pub fn record_local_event(
        &self,
        event: JobLocalEvent,
        shard_states: Vec<(ShardIndex, ShardState, String)>,
    ) -> FlotillaResult<()> {
        let job_id = event.job_id;
        self.command_tx
            .send(ControllerCommand::ApplyLocal {
                event: Some(event),
                job_id,
                shard_states,
            })
            .map_err(|_| FlotillaError::Fatal("controller loop stopped".into()))
    }

    /// Advance this node's own view of a shard (e.g. to Running) without
    /// putting anything on the wire.
    pub fn record_shard_progress(
        &self,
        job_id: JobId,
        shard: ShardIndex,
        state: ShardState,
        status: impl Into<String>,
    ) -> FlotillaResult<()> {
        self.command_tx
            .send(ControllerCommand::ApplyLocal {
                event: None,
                job_id,
                shard_states: vec![(shard, state, status.into())],
            })
            .map_err(|_| FlotillaError::Fatal("controller loop stopped".into()))
    }

    pub async fn get_job(&self, job_id: JobId) -> FlotillaResult<Job> {
        self.store.get_job(job_id).await
    }

    pub async fn get_job_state(&self, job_id: JobId) -> FlotillaResult<JobState> {
        self.store.get_job_state(job_id).await
    }

    pub async fn get_events(&self, job_id: JobId) -> FlotillaResult<Vec<JobEvent>> {
        self.store.get_events(job_id).await
    }

    pub async fn get_local_events(&self, job_id: JobId) -> FlotillaResult<Vec<JobLocalEvent>> {
        self.store.get_local_events(job_id).await
    }

    pub async fn get_jobs(&self, filter: &JobListFilter) -> FlotillaResult<Vec<Job>> {
        self.store.get_jobs(filter).await
    }

    async fn handle_command(&self, command: ControllerCommand) {
        match command {
            ControllerCommand::Publish(event) => {
                self.publish_with_retry(event).await;
            }
            ControllerCommand::ApplyLocal {
                event,
                job_id,
                shard_states,
            } => {
                if let Some(event) = event {
                    if let Err(e) = self.store.add_local_event(job_id, event).await {
                        warn!(job_id = %job_id, "dropping local event: {}", e);
                        return;
                    }
                }
                for (shard, state, status) in shard_states {
                    self.apply_shard_update(job_id, shard, self.node_id.clone(), state, status, String::new())
                        .await;
                }
            }
        }
    }

    /// Transient publish failures get a bounded retry; everything else is
    /// logged and dropped (the transport is best-effort by contract).
    async fn publish_with_retry(&self, event: JobEvent) {
        let mut backoff = PUBLISH_RETRY_BASE;
        for attempt in 1..=PUBLISH_RETRIES {
            match self.transport.publish(event.clone()).await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < PUBLISH_RETRIES => {
                    warn!(kind = %event.kind, attempt, "publish failed, retrying: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(kind = %event.kind, "dropping unpublishable event: {}", e);
                    return;
                }
            }
        }
    }

    /// Apply one gossiped event: store it (idempotently), move the shard
    /// slots it names, refresh the job roll-up, then fan it out to roles.
    async fn apply_event(&self, event: JobEvent) {
        let job_id = event.job_id;

        // A JobCreated from a remote requester is the first this node
        // hears of the job: materialize it from the embedded spec/deal.
        if event.kind == JobEventKind::JobCreated && !self.store.has_job(job_id).await {
            match (&event.spec, &event.deal) {
                (Some(spec), Some(deal)) => {
                    let job = Job {
                        id: job_id,
                        client_id: ClientId::default(),
                        requester_node_id: event.source_node_id.clone(),
                        spec: spec.clone(),
                        deal: deal.clone(),
                        created_at: event.event_time,
                    };
                    if let Err(e) = self.store.add_job(job).await {
                        warn!(job_id = %job_id, "failed to record remote job: {}", e);
                        return;
                    }
                }
                _ => {
                    warn!(job_id = %job_id, "dropping JobCreated without spec/deal");
                    return;
                }
            }
        }

        match self.store.add_event(job_id, event.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, event_id = %event.event_id, "duplicate event ignored");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, kind = %event.kind, "dropping event: {}", e);
                return;
            }
        }

        self.apply_event_effects(&event).await;
        self.refresh_job_state(job_id, &event).await;

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// The fixed map from event kind to shard-slot transition(s).
    async fn apply_event_effects(&self, event: &JobEvent) {
        let job_id = event.job_id;
        let source = event.source_node_id.clone();
        let target = event.target_node_id.clone();
        let shard = event.shard_index;

        match event.kind {
            JobEventKind::JobCreated => {}
            JobEventKind::BidReceived => {
                if let Some(shard) = shard {
                    self.apply_shard_update(
                        job_id,
                        shard,
                        source,
                        ShardState::Bidding,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                }
            }
            JobEventKind::BidAccepted => {
                if let (Some(shard), Some(node)) = (shard, target) {
                    if let Err(e) = self.store.append_assigned_node(job_id, node.clone()).await {
                        warn!(job_id = %job_id, "failed to record assignment: {}", e);
                    }
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node,
                        ShardState::Accepted,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                }
            }
            JobEventKind::BidRejected => {
                if let (Some(shard), Some(node)) = (shard, target) {
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node,
                        ShardState::Rejected,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                }
            }
            JobEventKind::ResultsProposed => {
                if let Some(shard) = shard {
                    self.apply_shard_update(
                        job_id,
                        shard,
                        source,
                        ShardState::ResultsProposed,
                        event.status.clone(),
                        event.results_id.clone(),
                    )
                    .await;
                }
            }
            JobEventKind::ResultsAccepted => {
                if let (Some(shard), Some(node)) = (shard, target) {
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node.clone(),
                        ShardState::ResultsAccepted,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node,
                        ShardState::Completed,
                        String::new(),
                        String::new(),
                    )
                    .await;
                }
            }
            JobEventKind::ResultsRejected => {
                if let (Some(shard), Some(node)) = (shard, target) {
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node.clone(),
                        ShardState::ResultsRejected,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node,
                        ShardState::Error,
                        String::new(),
                        String::new(),
                    )
                    .await;
                }
            }
            JobEventKind::Error => {
                if let Some(shard) = shard {
                    let node = target.unwrap_or(source);
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node,
                        ShardState::Error,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                }
            }
            JobEventKind::Cancelled => {
                if let Some(shard) = shard {
                    let node = target.unwrap_or(source);
                    self.apply_shard_update(
                        job_id,
                        shard,
                        node,
                        ShardState::Cancelled,
                        event.status.clone(),
                        String::new(),
                    )
                    .await;
                }
                // Job-level cancellation (no shard) is handled in the
                // roll-up refresh below.
            }
        }
    }

    /// Monotone slot advance. Same-state reapplication is a silent no-op
    /// (redelivered intents); anything else that is not a legal forward
    /// step is dropped and logged.
    async fn apply_shard_update(
        &self,
        job_id: JobId,
        shard: ShardIndex,
        node: NodeId,
        next: ShardState,
        status: String,
        results_id: String,
    ) {
        let current = match self.store.get_job_state(job_id).await {
            Ok(state) => state
                .shard_state(shard, &node)
                .map(|s| s.state)
                .unwrap_or(ShardState::New),
            Err(e) => {
                warn!(job_id = %job_id, shard, "cannot read shard state: {}", e);
                return;
            }
        };
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                job_id = %job_id,
                shard,
                node = %node,
                "dropping invalid shard transition {} -> {}",
                current,
                next
            );
            return;
        }
        if let Err(e) = self
            .store
            .update_shard_state(
                job_id,
                ShardStateUpdate {
                    shard_index: shard,
                    node_id: node.clone(),
                    state: next,
                    status,
                    results_id,
                },
            )
            .await
        {
            warn!(job_id = %job_id, shard, "failed to store shard state: {}", e);
        } else {
            debug!(job_id = %job_id, shard, node = %node, "shard {} -> {}", current, next);
        }
    }

    /// Refresh the requester-side roll-up after an event landed.
    async fn refresh_job_state(&self, job_id: JobId, event: &JobEvent) {
        let state = match self.store.get_job_state(job_id).await {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.kind.is_terminal() {
            return;
        }

        let next = if event.kind == JobEventKind::Cancelled && event.shard_index.is_none() {
            Some(JobStateKind::Cancelled)
        } else if state.has_accepted_slots() && state.accepted_slots_terminal() {
            Some(state.resolve_terminal_kind())
        } else if state.kind == JobStateKind::New && state.has_accepted_slots() {
            Some(JobStateKind::InProgress)
        } else {
            None
        };

        if let Some(kind) = next {
            if kind != state.kind {
                if let Err(e) = self.store.update_job_state_kind(job_id, kind).await {
                    warn!(job_id = %job_id, "failed to update job state: {}", e);
                } else {
                    info!(job_id = %job_id, "job state -> {}", kind);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        EngineKind, JobSpecDocker, JobSpecSharding, ResourceUsageConfig, VerifierKind,
    };
    use crate::shutdown::ShutdownHandle;
    use crate::store::InMemoryJobStore;
    use crate::transport::InProcessTransportHub;
    use std::time::Duration;

    fn test_spec() -> JobSpec {
        JobSpec {
            engine: EngineKind::Noop,
            verifier: VerifierKind::Noop,
            resources: ResourceUsageConfig::default(),
            docker: JobSpecDocker {
                image: "alpine".into(),
                entrypoint: vec!["echo".into(), "hi".into()],
                env: vec![],
            },
            inputs: vec![],
            outputs: vec![],
            workdir: String::new(),
            annotations: vec![],
            sharding: JobSpecSharding::default(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_submit_publishes_job_created_everywhere() {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let c1 = Controller::new(
            Arc::new(InMemoryJobStore::new()),
            hub.attach("requester"),
        );
        let c2 = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("compute"));
        c1.start(shutdown.token());
        c2.start(shutdown.token());

        let job = c1
            .submit(test_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, ClientId::new("c"))
            .await
            .unwrap();
        settle().await;

        // Both nodes hold the job; the spec round-trips bit-for-bit.
        assert_eq!(c1.get_job(job.id).await.unwrap().spec, test_spec());
        assert_eq!(c2.get_job(job.id).await.unwrap().spec, test_spec());
        assert_eq!(c2.get_events(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_events_have_one_effect() {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let controller = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("n"));
        controller.start(shutdown.token());
        let mut events = controller.subscribe_compute();

        let job = controller
            .submit(test_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, ClientId::new("c"))
            .await
            .unwrap();
        settle().await;
        let created = controller.get_events(job.id).await.unwrap()[0].clone();

        // Redeliver the identical event straight through the transport.
        let transport = hub.attach("rogue");
        transport.publish(created).await.unwrap();
        settle().await;

        assert_eq!(controller.get_events(job.id).await.unwrap().len(), 1);
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bid_flow_moves_shard_slots_monotonically() {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let controller = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("req"));
        controller.start(shutdown.token());

        let job = controller
            .submit(test_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, ClientId::new("c"))
            .await
            .unwrap();

        let compute = NodeId::from("comp");
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::BidReceived, compute.clone()).with_shard(0),
            )
            .unwrap();
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::BidAccepted, controller.host_id())
                    .with_shard(0)
                    .with_target(compute.clone()),
            )
            .unwrap();
        settle().await;

        let state = controller.get_job_state(job.id).await.unwrap();
        assert_eq!(
            state.shard_state(0, &compute).unwrap().state,
            ShardState::Accepted
        );
        assert_eq!(state.kind, JobStateKind::InProgress);
        let fetched = controller.get_job(job.id).await.unwrap();
        assert_eq!(fetched.deal.assigned_nodes, vec![compute.clone()]);

        // A regressing event (late BidReceived replay with a fresh id)
        // must be dropped.
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::BidReceived, compute.clone()).with_shard(0),
            )
            .unwrap();
        settle().await;
        let state = controller.get_job_state(job.id).await.unwrap();
        assert_eq!(
            state.shard_state(0, &compute).unwrap().state,
            ShardState::Accepted
        );
    }

    #[tokio::test]
    async fn test_results_acceptance_completes_job() {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let controller = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("req"));
        controller.start(shutdown.token());

        let job = controller
            .submit(test_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, ClientId::new("c"))
            .await
            .unwrap();
        let compute = NodeId::from("comp");
        let me = controller.host_id();

        controller
            .publish(JobEvent::new(job.id, JobEventKind::BidReceived, compute.clone()).with_shard(0))
            .unwrap();
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::BidAccepted, me.clone())
                    .with_shard(0)
                    .with_target(compute.clone()),
            )
            .unwrap();
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::ResultsProposed, compute.clone())
                    .with_shard(0)
                    .with_results_id("Qmresults"),
            )
            .unwrap();
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::ResultsAccepted, me)
                    .with_shard(0)
                    .with_target(compute.clone()),
            )
            .unwrap();
        settle().await;

        let state = controller.get_job_state(job.id).await.unwrap();
        let slot = state.shard_state(0, &compute).unwrap();
        assert_eq!(slot.state, ShardState::Completed);
        assert_eq!(slot.results_id, "Qmresults");
        assert_eq!(state.kind, JobStateKind::Complete);
    }

    #[tokio::test]
    async fn test_job_level_cancel_rolls_up() {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let controller = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("req"));
        controller.start(shutdown.token());

        let job = controller
            .submit(test_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, ClientId::new("c"))
            .await
            .unwrap();
        controller
            .publish(
                JobEvent::new(job.id, JobEventKind::Cancelled, controller.host_id())
                    .with_status("no bids before timeout"),
            )
            .unwrap();
        settle().await;

        assert_eq!(
            controller.get_job_state(job.id).await.unwrap().kind,
            JobStateKind::Cancelled
        );
    }

    #[tokio::test]
    async fn test_local_events_stay_local() {
        let shutdown = ShutdownHandle::new();
        let hub = InProcessTransportHub::new();
        let c1 = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("n1"));
        let c2 = Controller::new(Arc::new(InMemoryJobStore::new()), hub.attach("n2"));
        c1.start(shutdown.token());
        c2.start(shutdown.token());

        let job = c1
            .submit(test_spec(), JobDeal { concurrency: 1, assigned_nodes: vec![] }, ClientId::new("c"))
            .await
            .unwrap();
        settle().await;

        c1.record_local_event(
            JobLocalEvent::new(job.id, crate::job::JobLocalEventKind::SelectedJob)
                .with_status("accepted"),
            vec![(0, ShardState::Selected, "selected".into())],
        )
        .unwrap();
        settle().await;

        assert_eq!(c1.get_local_events(job.id).await.unwrap().len(), 1);
        assert!(c2.get_local_events(job.id).await.unwrap().is_empty());
        assert_eq!(
            c1.get_job_state(job.id)
                .await
                .unwrap()
                .shard_state(0, &c1.host_id())
                .unwrap()
                .state,
            ShardState::Selected
        );
    }
}
