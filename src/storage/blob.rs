//! Content-addressed blob storage. The real store (an IPFS daemon or
//! similar) lives outside the process; [`BlobStore`] is the named
//! interface the core depends on, and [`LocalBlobStore`] is a filesystem
//! implementation that content-addresses with sha256 — enough for tests
//! and single-machine deployments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::job::{StorageSpec, StorageSourceKind};
use crate::storage::{StorageProvider, StorageVolume};
use crate::types::{FlotillaError, FlotillaResult};

/// The external content-addressed store, reduced to what the core needs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a file or directory; returns its content address.
    async fn put(&self, local_path: &Path) -> FlotillaResult<String>;

    /// Materialize a content address at `dest`.
    async fn get(&self, cid: &str, dest: &Path) -> FlotillaResult<()>;

    /// Is the content already pinned here.
    async fn has(&self, cid: &str) -> FlotillaResult<bool>;
}

/// Filesystem-backed [`BlobStore`]: content lives under `root/<cid>`,
/// with the cid derived from a deterministic sha256 walk.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> FlotillaResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn cid_path(&self, cid: &str) -> PathBuf {
        self.root.join(cid)
    }

    /// Deterministic digest over file names and bytes.
    fn digest_path(hasher: &mut Sha256, path: &Path) -> std::io::Result<()> {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> =
                std::fs::read_dir(path)?.map(|e| e.map(|e| e.path())).collect::<Result<_, _>>()?;
            entries.sort();
            for entry in entries {
                if let Some(name) = entry.file_name() {
                    hasher.update(name.to_string_lossy().as_bytes());
                }
                Self::digest_path(hasher, &entry)?;
            }
        } else {
            hasher.update(std::fs::read(path)?);
        }
        Ok(())
    }

    fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
        if from.is_dir() {
            std::fs::create_dir_all(to)?;
            for entry in std::fs::read_dir(from)? {
                let entry = entry?;
                Self::copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
            }
        } else {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(from, to)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, local_path: &Path) -> FlotillaResult<String> {
        let mut hasher = Sha256::new();
        Self::digest_path(&mut hasher, local_path)?;
        let cid = hex::encode(hasher.finalize());
        let dest = self.cid_path(&cid);
        if !dest.exists() {
            Self::copy_recursive(local_path, &dest)?;
        }
        debug!(cid = %cid, "stored blob");
        Ok(cid)
    }

    async fn get(&self, cid: &str, dest: &Path) -> FlotillaResult<()> {
        let src = self.cid_path(cid);
        if !src.exists() {
            return Err(FlotillaError::NotFound(format!("blob {}", cid)));
        }
        Self::copy_recursive(&src, dest)?;
        Ok(())
    }

    async fn has(&self, cid: &str) -> FlotillaResult<bool> {
        Ok(self.cid_path(cid).exists())
    }
}

/// [`StorageProvider`] that resolves cid-tagged specs out of a blob store.
pub struct BlobStorageProvider {
    store: std::sync::Arc<dyn BlobStore>,
    local_dir: PathBuf,
}

impl BlobStorageProvider {
    pub fn new(store: std::sync::Arc<dyn BlobStore>) -> FlotillaResult<Self> {
        let local_dir =
            std::env::temp_dir().join(format!("flotilla-blob-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&local_dir)?;
        Ok(Self { store, local_dir })
    }
}

#[async_trait]
impl StorageProvider for BlobStorageProvider {
    async fn is_installed(&self) -> FlotillaResult<bool> {
        Ok(true)
    }

    async fn has_storage_locally(&self, spec: &StorageSpec) -> FlotillaResult<bool> {
        self.store.has(&spec.cid).await
    }

    async fn get_volume_size(&self, spec: &StorageSpec) -> FlotillaResult<u64> {
        if !self.store.has(&spec.cid).await? {
            return Ok(0);
        }
        let staging = self.local_dir.join(uuid::Uuid::new_v4().to_string());
        self.store.get(&spec.cid, &staging).await?;
        let size = dir_size(&staging)?;
        let _ = std::fs::remove_dir_all(&staging);
        Ok(size)
    }

    async fn prepare_storage(&self, spec: &StorageSpec) -> FlotillaResult<StorageVolume> {
        if spec.cid.is_empty() {
            return Err(FlotillaError::BadSpec("blob spec has no cid".into()));
        }
        let staging = self.local_dir.join(uuid::Uuid::new_v4().to_string());
        self.store.get(&spec.cid, &staging).await?;
        Ok(StorageVolume {
            source: staging,
            target: spec.path.clone(),
        })
    }

    async fn cleanup_storage(
        &self,
        _spec: &StorageSpec,
        volume: &StorageVolume,
    ) -> FlotillaResult<()> {
        if volume.source.exists() {
            tokio::fs::remove_dir_all(&volume.source).await.or_else(|_| {
                // Single-file volumes are staged as plain files.
                std::fs::remove_file(&volume.source)
            })?;
        }
        Ok(())
    }

    async fn upload(&self, local_path: &Path) -> FlotillaResult<StorageSpec> {
        let cid = self.store.put(local_path).await?;
        Ok(StorageSpec {
            engine: Some(StorageSourceKind::Ipfs),
            name: cid.clone(),
            cid,
            url: String::new(),
            path: String::new(),
        })
    }

    /// Fan a directory blob out into one spec per immediate child.
    async fn explode(&self, spec: &StorageSpec) -> FlotillaResult<Vec<StorageSpec>> {
        let staging = self.local_dir.join(uuid::Uuid::new_v4().to_string());
        self.store.get(&spec.cid, &staging).await?;
        if !staging.is_dir() {
            let _ = std::fs::remove_file(&staging);
            return Ok(vec![spec.clone()]);
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&staging)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let cid = self.store.put(&entry).await?;
            out.push(StorageSpec {
                engine: Some(StorageSourceKind::Ipfs),
                name: name.clone(),
                cid,
                url: String::new(),
                path: format!("{}/{}", spec.path.trim_end_matches('/'), name),
            });
        }
        let _ = std::fs::remove_dir_all(&staging);
        Ok(out)
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    if path.is_dir() {
        let mut total = 0;
        for entry in std::fs::read_dir(path)? {
            total += dir_size(&entry?.path())?;
        }
        Ok(total)
    } else {
        Ok(std::fs::metadata(path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let root = scratch();
        let store = LocalBlobStore::new(root.path().join("blobs")).unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("stdout"), b"hi\n").unwrap();

        let cid = store.put(&src).await.unwrap();
        assert!(store.has(&cid).await.unwrap());

        let dest = root.path().join("dest");
        store.get(&cid, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest.join("stdout")).unwrap(), b"hi\n");
    }

    #[tokio::test]
    async fn test_identical_content_gets_identical_cid() {
        let root = scratch();
        let store = LocalBlobStore::new(root.path().join("blobs")).unwrap();
        for name in ["a", "b"] {
            let dir = root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("file"), b"same bytes").unwrap();
        }
        let cid_a = store.put(&root.path().join("a")).await.unwrap();
        let cid_b = store.put(&root.path().join("b")).await.unwrap();
        assert_eq!(cid_a, cid_b);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let root = scratch();
        let store = LocalBlobStore::new(root.path().join("blobs")).unwrap();
        assert!(!store.has("nope").await.unwrap());
        assert!(matches!(
            store.get("nope", &root.path().join("out")).await,
            Err(FlotillaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_prepare_and_locality() {
        let root = scratch();
        let store = Arc::new(LocalBlobStore::new(root.path().join("blobs")).unwrap());
        let provider = BlobStorageProvider::new(store.clone()).unwrap();

        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("data.txt"), b"payload").unwrap();
        let cid = store.put(&src).await.unwrap();

        let spec = StorageSpec {
            engine: Some(StorageSourceKind::Ipfs),
            cid: cid.clone(),
            path: "/inputs".into(),
            ..Default::default()
        };
        assert!(provider.has_storage_locally(&spec).await.unwrap());

        let volume = provider.prepare_storage(&spec).await.unwrap();
        assert_eq!(volume.target, "/inputs");
        assert!(volume.source.join("data.txt").exists());
        provider.cleanup_storage(&spec, &volume).await.unwrap();
        assert!(!volume.source.exists());
    }

    #[tokio::test]
    async fn test_explode_fans_out_directory() {
        let root = scratch();
        let store = Arc::new(LocalBlobStore::new(root.path().join("blobs")).unwrap());
        let provider = BlobStorageProvider::new(store.clone()).unwrap();

        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("one"), b"1").unwrap();
        std::fs::write(src.join("two"), b"2").unwrap();
        let cid = store.put(&src).await.unwrap();

        let spec = StorageSpec {
            engine: Some(StorageSourceKind::Ipfs),
            cid,
            path: "/inputs".into(),
            ..Default::default()
        };
        let exploded = provider.explode(&spec).await.unwrap();
        assert_eq!(exploded.len(), 2);
        assert_eq!(exploded[0].path, "/inputs/one");
        assert_eq!(exploded[1].path, "/inputs/two");
        for child in &exploded {
            assert!(store.has(&child.cid).await.unwrap());
        }
    }
}
