//! In-process transport: a hub fans every published event out to every
//! attached node (the publisher included). Used by the test devstack and
//! by single-process deployments; delivery order is publish order, which
//! trivially satisfies per-source FIFO.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::job::JobEvent;
use crate::transport::Transport;
use crate::types::{FlotillaResult, NodeId};

type SubscriberList = Arc<Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>>;

/// Shared fan-out point connecting the in-process "network". Cheap to
/// clone; all clones speak for the same network.
#[derive(Clone, Default)]
pub struct InProcessTransportHub {
    peers: Arc<Mutex<Vec<SubscriberList>>>,
}

impl InProcessTransportHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node to the hub under the given host id.
    pub fn attach(&self, host_id: impl Into<NodeId>) -> Arc<InProcessTransport> {
        let subscribers = SubscriberList::default();
        self.peers.lock().push(subscribers.clone());
        Arc::new(InProcessTransport {
            host_id: host_id.into(),
            peers: self.peers.clone(),
            subscribers,
        })
    }
}

/// One node's handle onto the hub.
pub struct InProcessTransport {
    host_id: NodeId,
    peers: Arc<Mutex<Vec<SubscriberList>>>,
    subscribers: SubscriberList,
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn publish(&self, event: JobEvent) -> FlotillaResult<()> {
        debug!(
            host = %self.host_id,
            kind = %event.kind,
            job_id = %event.job_id,
            "publishing event"
        );
        let peers = self.peers.lock().clone();
        for peer in peers {
            let mut subscribers = peer.lock();
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn host_id(&self) -> NodeId {
        self.host_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobEventKind;
    use crate::types::JobId;

    #[tokio::test]
    async fn test_self_delivery() {
        let hub = InProcessTransportHub::new();
        let node = hub.attach("n1");
        let mut rx = node.subscribe();
        let event = JobEvent::new(JobId::new(), JobEventKind::JobCreated, node.host_id());
        node.publish(event.clone()).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, event.event_id);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_nodes() {
        let hub = InProcessTransportHub::new();
        let n1 = hub.attach("n1");
        let n2 = hub.attach("n2");
        let n3 = hub.attach("n3");
        let mut rx2 = n2.subscribe();
        let mut rx3 = n3.subscribe();
        let event = JobEvent::new(JobId::new(), JobEventKind::JobCreated, n1.host_id());
        n1.publish(event.clone()).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().event_id, event.event_id);
        assert_eq!(rx3.recv().await.unwrap().event_id, event.event_id);
    }

    #[tokio::test]
    async fn test_per_source_fifo() {
        let hub = InProcessTransportHub::new();
        let n1 = hub.attach("n1");
        let n2 = hub.attach("n2");
        let mut rx = n2.subscribe();
        let job = JobId::new();
        let first = JobEvent::new(job, JobEventKind::JobCreated, n1.host_id());
        let second = JobEvent::new(job, JobEventKind::BidAccepted, n1.host_id());
        n1.publish(first.clone()).await.unwrap();
        n1.publish(second.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event_id, first.event_id);
        assert_eq!(rx.recv().await.unwrap().event_id, second.event_id);
    }
}
