//! # Transport Contract
//!
//! Best-effort ordered gossip of job events. The contract is small on
//! purpose: `publish`, `subscribe`, `host_id`. Implementations must
//! guarantee (a) self-delivery — the publishing node receives its own
//! events so application logic is uniform, (b) no duplication of the
//! same `event_id`, (c) per-source FIFO. Nothing is promised about
//! cross-source order or durability across crashes.

pub mod inprocess;
pub mod libp2p;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::job::JobEvent;
use crate::types::{FlotillaResult, NodeId};

pub use inprocess::{InProcessTransport, InProcessTransportHub};
pub use libp2p::{Libp2pTransport, Libp2pTransportConfig};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Broadcast an event to every peer, including this node.
    async fn publish(&self, event: JobEvent) -> FlotillaResult<()>;

    /// Register a subscriber. Events arrive in per-source FIFO order;
    /// the receiver must be drained promptly (senders never block).
    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent>;

    /// The identity peers will see as `source_node_id` on our events.
    fn host_id(&self) -> NodeId;
}
