//! # Verifier Contract
//!
//! The protocol slot for pluggable result verification. The shipped
//! verifiers forward results (upload and accept); what a real verifier
//! does under disagreement is deliberately left to implementations.

pub mod blob;
pub mod noop;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{Job, VerifierKind};
use crate::types::{FlotillaError, FlotillaResult, ShardIndex};

pub use blob::BlobVerifier;
pub use noop::NoopVerifier;

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn is_installed(&self) -> FlotillaResult<bool>;

    /// Publish a shard's results folder, returning the results id (a
    /// content address for backends that have one).
    async fn process_shard_results(
        &self,
        job: &Job,
        shard_index: ShardIndex,
        results_dir: &Path,
    ) -> FlotillaResult<String>;

    /// Adjudicate proposed results. `true` accepts.
    async fn verify(
        &self,
        job: &Job,
        shard_index: ShardIndex,
        results_id: &str,
    ) -> FlotillaResult<bool>;
}

/// Kind-keyed verifier registry.
#[derive(Clone, Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<VerifierKind, Arc<dyn Verifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: VerifierKind, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.insert(kind, verifier);
        self
    }

    pub fn get(&self, kind: VerifierKind) -> FlotillaResult<Arc<dyn Verifier>> {
        self.verifiers
            .get(&kind)
            .cloned()
            .ok_or_else(|| FlotillaError::NotFound(format!("no verifier for kind {}", kind)))
    }

    pub fn has(&self, kind: VerifierKind) -> bool {
        self.verifiers.contains_key(&kind)
    }
}
