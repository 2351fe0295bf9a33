//! # Storage Providers
//!
//! Narrow contract the core uses to materialize job inputs and publish
//! outputs. Providers are dispatched through a registry keyed by
//! [`StorageSourceKind`]; the core never knows which concrete backend is
//! behind a spec.

pub mod blob;
pub mod url;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{StorageSpec, StorageSourceKind};
use crate::types::{FlotillaError, FlotillaResult};

pub use blob::{BlobStorageProvider, BlobStore, LocalBlobStore};
pub use url::UrlDownloadProvider;

/// A prepared piece of data, ready to be bind-mounted into an execution
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVolume {
    /// Host path holding the data.
    pub source: PathBuf,
    /// Mount point inside the execution environment.
    pub target: String,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Is the backend reachable / usable at all.
    async fn is_installed(&self) -> FlotillaResult<bool>;

    /// Can this node satisfy the spec without fetching anything remote.
    async fn has_storage_locally(&self, spec: &StorageSpec) -> FlotillaResult<bool>;

    /// Size in bytes, where the backend can answer cheaply; zero otherwise.
    async fn get_volume_size(&self, spec: &StorageSpec) -> FlotillaResult<u64>;

    /// Fetch/stage the data and hand back a mountable volume.
    async fn prepare_storage(&self, spec: &StorageSpec) -> FlotillaResult<StorageVolume>;

    /// Release whatever `prepare_storage` staged.
    async fn cleanup_storage(
        &self,
        spec: &StorageSpec,
        volume: &StorageVolume,
    ) -> FlotillaResult<()>;

    /// Publish a local path, returning a spec that names it.
    async fn upload(&self, local_path: &std::path::Path) -> FlotillaResult<StorageSpec>;

    /// Directory fan-out: split a spec into per-entry specs where the
    /// backend supports it; single-element identity otherwise.
    async fn explode(&self, spec: &StorageSpec) -> FlotillaResult<Vec<StorageSpec>>;
}

/// Kind-keyed provider registry.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    providers: HashMap<StorageSourceKind, Arc<dyn StorageProvider>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: StorageSourceKind, provider: Arc<dyn StorageProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn get(&self, kind: StorageSourceKind) -> FlotillaResult<Arc<dyn StorageProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| FlotillaError::NotFound(format!("no storage provider for {}", kind)))
    }

    /// Provider for one spec, erroring on untagged specs.
    pub fn for_spec(&self, spec: &StorageSpec) -> FlotillaResult<Arc<dyn StorageProvider>> {
        let kind = spec
            .engine
            .ok_or_else(|| FlotillaError::BadSpec("input spec has no storage engine".into()))?;
        self.get(kind)
    }

    /// Do all given specs resolve locally on this node?
    pub async fn has_all_locally(&self, specs: &[StorageSpec]) -> FlotillaResult<bool> {
        for spec in specs {
            let provider = self.for_spec(spec)?;
            if !provider.has_storage_locally(spec).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
