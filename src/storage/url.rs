//! URL download provider: fetches http(s) content into a scratch
//! directory before a shard runs, and removes it afterwards. Nothing is
//! ever cached locally, and upload is meaningless for this backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::job::{StorageSpec, StorageSourceKind};
use crate::storage::{StorageProvider, StorageVolume};
use crate::types::{FlotillaError, FlotillaResult};

pub struct UrlDownloadProvider {
    client: reqwest::Client,
    local_dir: PathBuf,
}

impl UrlDownloadProvider {
    pub fn new() -> FlotillaResult<Self> {
        let local_dir = std::env::temp_dir().join(format!("flotilla-url-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&local_dir)?;
        debug!("url download provider scratch dir: {}", local_dir.display());
        Ok(Self {
            client: reqwest::Client::new(),
            local_dir,
        })
    }

    /// Only plain web URLs are supported; anything else (ftp, file, ...)
    /// is a spec error.
    pub fn is_url_supported(raw: &str) -> FlotillaResult<Url> {
        let parsed = Url::parse(raw)
            .map_err(|e| FlotillaError::BadSpec(format!("invalid url {:?}: {}", raw, e)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            scheme => Err(FlotillaError::BadSpec(format!(
                "protocol scheme {:?} in url not supported: {}",
                scheme, raw
            ))),
        }
    }
}

#[async_trait]
impl StorageProvider for UrlDownloadProvider {
    async fn is_installed(&self) -> FlotillaResult<bool> {
        Ok(true)
    }

    async fn has_storage_locally(&self, _spec: &StorageSpec) -> FlotillaResult<bool> {
        Ok(false)
    }

    // A HEAD request could report Content-Length, but it is not
    // guaranteed to match the final body size.
    async fn get_volume_size(&self, _spec: &StorageSpec) -> FlotillaResult<u64> {
        Ok(0)
    }

    async fn prepare_storage(&self, spec: &StorageSpec) -> FlotillaResult<StorageVolume> {
        let url = Self::is_url_supported(&spec.url)?;

        let output_dir = self.local_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&output_dir).await?;
        let output_file = output_dir.join("file");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FlotillaError::Transient(format!("fetching {}: {}", spec.url, e)))?;
        if !response.status().is_success() {
            return Err(FlotillaError::Transient(format!(
                "fetching {}: status {}",
                spec.url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| FlotillaError::Transient(format!("reading {}: {}", spec.url, e)))?;
        tokio::fs::write(&output_file, &body).await?;

        Ok(StorageVolume {
            source: output_file,
            target: spec.path.clone(),
        })
    }

    async fn cleanup_storage(
        &self,
        _spec: &StorageSpec,
        volume: &StorageVolume,
    ) -> FlotillaResult<()> {
        if let Some(dir) = volume.source.parent() {
            debug!("cleaning up {}", dir.display());
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn upload(&self, _local_path: &Path) -> FlotillaResult<StorageSpec> {
        Err(FlotillaError::BadSpec(
            "cannot upload to a url storage source".into(),
        ))
    }

    // A url always explodes to exactly itself.
    async fn explode(&self, spec: &StorageSpec) -> FlotillaResult<Vec<StorageSpec>> {
        Ok(vec![StorageSpec {
            engine: Some(StorageSourceKind::UrlDownload),
            name: spec.name.clone(),
            cid: String::new(),
            url: spec.url.clone(),
            path: spec.path.clone(),
        }])
    }
}
