//! # Flotilla
//!
//! Core of a decentralized compute network: clients submit containerized
//! jobs against named data, and a peer-to-peer fleet of nodes decides who
//! executes each shard, runs it, verifies the results and makes the
//! output available by content address. This crate holds the distributed
//! job lifecycle — the event log and gossip contract, the per-node
//! controller, the compute and requester roles, capacity accounting and
//! the storage/executor/verifier seams. Container runtimes, real blob
//! stores and the p2p overlay live behind narrow interfaces.

pub mod api;
pub mod capacity;
pub mod compute_node;
pub mod config;
pub mod controller;
pub mod executor;
pub mod job;
pub mod jobfile;
pub mod requester_node;
pub mod selection;
pub mod shutdown;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;
pub mod verifier;

// Re-export the types most callers reach for.
pub use types::{ClientId, FlotillaError, FlotillaResult, JobId, NodeId, ShardIndex};

pub use job::{
    EngineKind, Job, JobDeal, JobEvent, JobEventKind, JobLocalEvent, JobLocalEventKind, JobSpec,
    JobState, JobStateKind, ShardState, StorageSourceKind, StorageSpec, VerifierKind,
};

pub use capacity::{CapacityManager, ResourceUsage};
pub use compute_node::ComputeNode;
pub use config::{ApiConfig, ComputeNodeConfig, NodeConfig, RequesterNodeConfig};
pub use controller::Controller;
pub use requester_node::RequesterNode;
pub use selection::{JobSelectionDataLocality, JobSelectionPolicy};
pub use shutdown::{Shutdown, ShutdownHandle};
pub use store::{InMemoryJobStore, JobStore};
pub use transport::{InProcessTransportHub, Libp2pTransport, Transport};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
