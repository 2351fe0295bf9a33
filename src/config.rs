//! Per-invocation configuration. Flag values from the CLI land in these
//! structs and are threaded through constructors; nothing in the crate
//! reads configuration from anywhere else.

use std::time::Duration;

use crate::capacity::CapacityManagerConfig;
use crate::selection::JobSelectionPolicy;
use crate::transport::Libp2pTransportConfig;

/// Compute-role configuration.
#[derive(Debug, Clone, Default)]
pub struct ComputeNodeConfig {
    pub job_selection_policy: JobSelectionPolicy,
    pub capacity: CapacityManagerConfig,
}

/// Requester-role configuration.
#[derive(Debug, Clone)]
pub struct RequesterNodeConfig {
    /// How long to wait for bids before a job with none is cancelled.
    pub bid_timeout: Duration,
    /// Overall deadline after which accepted-but-unfinished shard slots
    /// are cancelled.
    pub job_timeout: Duration,
}

impl Default for RequesterNodeConfig {
    fn default() -> Self {
        Self {
            bid_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
        }
    }
}

/// API façade listener configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
        }
    }
}

/// Everything one `serve` invocation needs.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub transport: Libp2pTransportConfig,
    pub api: ApiConfig,
    pub metrics_port: Option<u16>,
    pub compute: ComputeNodeConfig,
    pub requester: RequesterNodeConfig,
}
