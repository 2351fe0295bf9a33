//! # Requester Node Role
//!
//! Arbitrates bids for jobs submitted at this node, drives the
//! verification handshake, and enforces the two deadlines: a bid window
//! (a job nobody bids on gets cancelled) and an overall job deadline
//! (accepted-but-unfinished slots get cancelled).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::RequesterNodeConfig;
use crate::controller::Controller;
use crate::job::{Job, JobEvent, JobEventKind, ShardState};
use crate::shutdown::Shutdown;
use crate::types::{FlotillaError, FlotillaResult, JobId, NodeId, ShardIndex};
use crate::verifier::VerifierRegistry;

const VERIFY_RETRIES: u32 = 3;
const VERIFY_RETRY_BASE: Duration = Duration::from_millis(500);

pub struct RequesterNode {
    controller: Arc<Controller>,
    verifiers: VerifierRegistry,
    config: RequesterNodeConfig,
    /// Nodes accepted per (job, shard), tracked synchronously at decision
    /// time — the store lags by one gossip round-trip, and the
    /// concurrency bound must hold at the instant we decide.
    accepted: Mutex<HashMap<(JobId, ShardIndex), Vec<NodeId>>>,
    weak_self: std::sync::Weak<RequesterNode>,
}

impl RequesterNode {
    pub fn new(
        controller: Arc<Controller>,
        verifiers: VerifierRegistry,
        config: RequesterNodeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            controller,
            verifiers,
            config,
            accepted: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn start(&self, shutdown: Shutdown) {
        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        let mut events = node.controller.subscribe_requester();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => node.handle_event(event, &shutdown).await,
                            None => break,
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn handle_event(&self, event: JobEvent, shutdown: &Shutdown) {
        let me = self.controller.host_id();
        let Ok(job) = self.controller.get_job(event.job_id).await else {
            return;
        };
        // Only the requester that owns the job arbitrates it.
        if job.requester_node_id != me {
            return;
        }

        match event.kind {
            JobEventKind::JobCreated if event.source_node_id == me => {
                self.arm_timeouts(job.id, shutdown.clone());
            }
            JobEventKind::BidReceived => {
                if let Some(shard) = event.shard_index {
                    let terminal = self
                        .controller
                        .get_job_state(job.id)
                        .await
                        .map(|s| s.kind.is_terminal())
                        .unwrap_or(true);
                    if terminal {
                        debug!(job_id = %job.id, shard, "ignoring bid on terminal job");
                    } else {
                        self.arbitrate_bid(&job, shard, event.source_node_id.clone());
                    }
                }
            }
            JobEventKind::ResultsProposed => {
                if let (Some(shard), Some(node)) = (event.shard_index, self.weak_self.upgrade()) {
                    let proposer = event.source_node_id.clone();
                    let results_id = event.results_id.clone();
                    tokio::spawn(async move {
                        node.adjudicate_results(job, shard, proposer, results_id).await;
                    });
                }
            }
            _ => {}
        }
    }

    /// Accept bids in arrival order up to the deal's concurrency; the
    /// serialized ingest queue makes arrival order total, and node id
    /// order breaks exact ties for bids that raced into the same batch.
    fn arbitrate_bid(&self, job: &Job, shard: ShardIndex, bidder: NodeId) {
        let mut accepted = self.accepted.lock();
        let slot = accepted.entry((job.id, shard)).or_default();
        let me = self.controller.host_id();

        let (kind, status) = if slot.contains(&bidder) {
            debug!(job_id = %job.id, shard, node = %bidder, "duplicate bid ignored");
            return;
        } else if (slot.len() as u32) < job.deal.concurrency {
            slot.push(bidder.clone());
            (JobEventKind::BidAccepted, "bid accepted")
        } else {
            (JobEventKind::BidRejected, "concurrency reached")
        };
        drop(accepted);

        info!(job_id = %job.id, shard, node = %bidder, "{}", status);
        let event = JobEvent::new(job.id, kind, me)
            .with_shard(shard)
            .with_target(bidder)
            .with_status(status);
        if let Err(e) = self.controller.publish(event) {
            warn!(job_id = %job.id, shard, "failed to publish bid decision: {}", e);
        }
    }

    /// Run the verifier over proposed results and publish the verdict.
    async fn adjudicate_results(
        &self,
        job: Job,
        shard: ShardIndex,
        proposer: NodeId,
        results_id: String,
    ) {
        let me = self.controller.host_id();
        let verdict = self.verify_with_retry(&job, shard, &results_id).await;
        let (kind, status) = match verdict {
            Ok(true) => (JobEventKind::ResultsAccepted, "results accepted".to_string()),
            Ok(false) => (
                JobEventKind::ResultsRejected,
                "results rejected by verifier".to_string(),
            ),
            Err(e) => (
                JobEventKind::ResultsRejected,
                format!("verification failed: {}", e),
            ),
        };
        let event = JobEvent::new(job.id, kind, me)
            .with_shard(shard)
            .with_target(proposer)
            .with_status(status)
            .with_results_id(results_id);
        if let Err(e) = self.controller.publish(event) {
            warn!(job_id = %job.id, shard, "failed to publish verdict: {}", e);
        }
    }

    async fn verify_with_retry(
        &self,
        job: &Job,
        shard: ShardIndex,
        results_id: &str,
    ) -> FlotillaResult<bool> {
        let verifier = self.verifiers.get(job.spec.verifier)?;
        let mut backoff = VERIFY_RETRY_BASE;
        for attempt in 1..=VERIFY_RETRIES {
            match verifier.verify(job, shard, results_id).await {
                Ok(verdict) => return Ok(verdict),
                Err(e) if e.is_transient() && attempt < VERIFY_RETRIES => {
                    warn!(job_id = %job.id, shard, attempt, "verify failed, retrying: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(FlotillaError::Transient("verification retries exhausted".into()))
    }

    /// One timer for the bid window, one for the whole job.
    fn arm_timeouts(&self, job_id: JobId, shutdown: Shutdown) {
        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        let bid_timeout = self.config.bid_timeout;
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(bid_timeout) => node.enforce_bid_timeout(job_id).await,
                _ = token.cancelled() => {}
            }
        });

        let Some(node) = self.weak_self.upgrade() else {
            return;
        };
        let job_timeout = self.config.job_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(job_timeout) => node.enforce_job_timeout(job_id).await,
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Nobody bid in time: cancel the whole job.
    async fn enforce_bid_timeout(&self, job_id: JobId) {
        let Ok(state) = self.controller.get_job_state(job_id).await else {
            return;
        };
        if state.kind.is_terminal() || state.has_accepted_slots() {
            return;
        }
        info!(job_id = %job_id, "no accepted bids before timeout, cancelling job");
        let event = JobEvent::new(job_id, JobEventKind::Cancelled, self.controller.host_id())
            .with_status("no bids before timeout");
        if let Err(e) = self.controller.publish(event) {
            warn!(job_id = %job_id, "failed to publish cancellation: {}", e);
        }
    }

    /// The job overran its deadline: cancel what is still in flight.
    async fn enforce_job_timeout(&self, job_id: JobId) {
        let Ok(state) = self.controller.get_job_state(job_id).await else {
            return;
        };
        if state.kind.is_terminal() {
            return;
        }
        info!(job_id = %job_id, "job deadline reached, cancelling remaining shards");
        let me = self.controller.host_id();

        // Job-level cancel first so the roll-up lands on Cancelled, then
        // one targeted cancel per live slot so compute nodes clean up.
        let event = JobEvent::new(job_id, JobEventKind::Cancelled, me.clone())
            .with_status("job timed out");
        if let Err(e) = self.controller.publish(event) {
            warn!(job_id = %job_id, "failed to publish cancellation: {}", e);
        }
        for slot in state.flatten() {
            let live = !slot.state.is_terminal()
                && !matches!(
                    slot.state,
                    ShardState::New | ShardState::Bidding | ShardState::Selected
                );
            if live {
                let event = JobEvent::new(job_id, JobEventKind::Cancelled, me.clone())
                    .with_shard(slot.shard_index)
                    .with_target(slot.node_id.clone())
                    .with_status("job timed out");
                if let Err(e) = self.controller.publish(event) {
                    warn!(job_id = %job_id, "failed to publish shard cancellation: {}", e);
                }
            }
        }
    }
}
