//! Local cache backend using the filesystem only (no network, no daemon).
//!
//! Each cacheable fingerprint maps to a small JSON manifest (the list of
//! declared output files and the content hash of each) plus one content
//! blob per distinct file content in [`LocalCas`]. Storing file contents
//! content-addressed rather than once-per-fingerprint means two fingerprints
//! that happen to produce byte-identical output files share storage.

mod cas;

use std::path::PathBuf;

use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::fs;
use crate::path::RelFilePath;

use self::cas::LocalCas;
use super::backend::{CacheBackend, CachedFile};

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    path: String,
    content_hash: String,
}

/// Local cache backend: `{cache_dir}/cas/` holds content blobs,
/// `{cache_dir}/manifests/` holds one JSON file per fingerprint key.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    cas: LocalCas,
    manifests_dir: PathBuf,
}

impl LocalBackend {
    /// Open or create a local cache at the default location
    /// (`HUSTLE_CACHE_DIR`, else the platform cache directory).
    #[instrument(name = "LocalBackend::open_default")]
    pub async fn open_default() -> Result<Self> {
        let cache_dir = fs::user_cache_dir().await?;
        Self::open(cache_dir.into_std_path_buf())
    }

    /// Open or create a local cache at the specified directory.
    #[instrument(name = "LocalBackend::open", skip(cache_dir))]
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        Ok(Self {
            cas: LocalCas::new(cache_dir.join("cas")),
            manifests_dir: cache_dir.join("manifests"),
        })
    }

    fn manifest_path(&self, fingerprint_key: &str) -> PathBuf {
        let hashed = hex::encode(Sha256::digest(fingerprint_key.as_bytes()));
        self.manifests_dir.join(format!("{hashed}.json"))
    }
}

impl CacheBackend for LocalBackend {
    #[instrument(name = "LocalBackend::store", skip(files))]
    async fn store(&self, fingerprint_key: &str, files: Vec<CachedFile>) -> Result<()> {
        let mut manifest = Vec::with_capacity(files.len());
        for file in files {
            let content_hash = hex::encode(Sha256::digest(&file.content));
            self.cas.write(&content_hash, &file.content).await?;
            manifest.push(ManifestEntry {
                path: file.path.as_std_path().to_string_lossy().into_owned(),
                content_hash,
            });
        }

        let manifest_path = self.manifest_path(fingerprint_key);
        if let Some(parent) = manifest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create manifests directory")?;
        }
        let serialized = serde_json::to_vec(&manifest).context("serialize cache manifest")?;
        tokio::fs::write(&manifest_path, serialized)
            .await
            .context("write cache manifest")
    }

    #[instrument(name = "LocalBackend::restore")]
    async fn restore(&self, fingerprint_key: &str) -> Result<Option<Vec<CachedFile>>> {
        let manifest_path = self.manifest_path(fingerprint_key);
        let raw = match tokio::fs::read(&manifest_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read cache manifest"),
        };
        let manifest: Vec<ManifestEntry> =
            serde_json::from_slice(&raw).context("parse cache manifest")?;

        let mut files = Vec::with_capacity(manifest.len());
        for entry in manifest {
            let Some(content) = self.cas.read_buffered(&entry.content_hash).await? else {
                // A manifest referencing a blob the CAS no longer has is a
                // partial/corrupt entry; treat the whole restore as a miss.
                return Ok(None);
            };
            files.push(CachedFile {
                path: RelFilePath::new(entry.path)?,
                content,
            });
        }
        Ok(Some(files))
    }

    #[instrument(name = "LocalBackend::exists")]
    async fn exists(&self, fingerprint_key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.manifest_path(fingerprint_key))
            .await
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn backend_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(temp_dir.path()).unwrap();

        let files = vec![CachedFile {
            path: RelFilePath::new("dist/out.txt").unwrap(),
            content: b"built output".to_vec(),
        }];

        pretty_assert_eq!(backend.exists("fp-1").await.unwrap(), false);
        backend.store("fp-1", files.clone()).await.unwrap();
        pretty_assert_eq!(backend.exists("fp-1").await.unwrap(), true);

        let restored = backend.restore("fp-1").await.unwrap().unwrap();
        pretty_assert_eq!(restored.len(), 1);
        pretty_assert_eq!(restored[0].content, files[0].content);
    }

    #[tokio::test]
    async fn restore_missing_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::open(temp_dir.path()).unwrap();
        assert!(backend.restore("missing").await.unwrap().is_none());
    }
}
