//! # Core Types
//!
//! Identifiers and the error vocabulary shared across the flotilla core.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of a node on the network. Host ids are issued by the
/// transport (a libp2p peer id, or an opaque string in tests), so this is
/// a string newtype rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the submitting client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a shard within a job.
pub type ShardIndex = u32;

/// Error types for the flotilla core
#[derive(Debug, thiserror::Error)]
pub enum FlotillaError {
    /// Spec validation failed before anything was published.
    #[error("bad job spec: {0}")]
    BadSpec(String),

    /// A CPU/memory/GPU string could not be parsed to canonical units.
    #[error("bad resource spec: {0}")]
    BadResourceSpec(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Network or probe failure that is worth retrying with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Not an error as such: the job is deferred until capacity frees up.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Executor-level failure (image pull, volume mount). A container
    /// exiting non-zero is a valid result and never surfaces here.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),

    /// Verification rejected the proposed results; surfaced on the wire
    /// as a ResultsRejected event.
    #[error("results rejected: {0}")]
    VerifierReject(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable; the process exits with code 2 after cleanup.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl FlotillaError {
    /// Process exit code for the CLI surface: 1 for user errors, 2 for
    /// internal ones.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlotillaError::BadSpec(_)
            | FlotillaError::BadResourceSpec(_)
            | FlotillaError::NotFound(_) => 1,
            _ => 2,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FlotillaError::Transient(_))
    }
}

/// Result type for flotilla core operations
pub type FlotillaResult<T> = Result<T, FlotillaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_round_trip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(FlotillaError::BadSpec("x".into()).exit_code(), 1);
        assert_eq!(FlotillaError::NotFound("x".into()).exit_code(), 1);
        assert_eq!(FlotillaError::Fatal("x".into()).exit_code(), 2);
        assert_eq!(FlotillaError::Transient("x".into()).exit_code(), 2);
    }
}
