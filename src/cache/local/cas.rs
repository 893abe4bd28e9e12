//! Local filesystem-based content-addressed storage.
//!
//! Stores blobs under `{root}/{key[0..2]}/{key[2..4]}/{key}`, zstd-compressed,
//! with temp-file-then-rename writes for atomicity.

use std::io::Cursor;
use std::path::PathBuf;

use async_compression::Level;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use sha2::{Digest, Sha256};
use tokio::fs::{File, create_dir_all, metadata, remove_file, rename};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{instrument, warn};
use uuid::Uuid;

/// Default buffer size for read/write operations.
const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Local content-addressed storage backed by the filesystem.
///
/// Keys are hex-encoded SHA-256 digests of the *uncompressed* content, so
/// the cache stays self-verifying: a write recomputes the hash of what it
/// just wrote and refuses to commit on a mismatch.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("LocalCas(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct LocalCas {
    root: PathBuf,
}

impl LocalCas {
    /// Create a new instance with the given root directory. The directory is
    /// created lazily, on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let prefix1: String = key.chars().take(2).collect();
        let prefix2: String = key.chars().skip(2).take(2).collect();
        self.root.join(prefix1).join(prefix2).join(key)
    }

    #[instrument(name = "LocalCas::exists")]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key);
        match metadata(&path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("check if blob exists at {path:?}")),
        }
    }

    #[instrument(name = "LocalCas::read_buffered")]
    pub async fn read_buffered(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        match File::open(&path).await {
            Ok(file) => {
                let reader = BufReader::new(file);
                let decoder = ZstdDecoder::new(reader);
                let mut buffered = BufReader::with_capacity(DEFAULT_BUF_SIZE, decoder);

                let mut buffer = Vec::new();
                tokio::io::copy(&mut buffered, &mut buffer)
                    .await
                    .context("read decompressed blob content")?;
                Ok(Some(buffer))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("open blob file {path:?}")),
        }
    }

    /// Write content to storage for the provided key. Returns `true` if the
    /// content was newly written, `false` if it already existed.
    #[instrument(name = "LocalCas::write", skip(content))]
    pub async fn write(&self, key: &str, content: &[u8]) -> Result<bool> {
        let path = self.key_path(key);

        if self.exists(key).await? {
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .with_context(|| format!("create parent directory {parent:?}"))?;
        }

        let temp = temp_path(&path);
        let file = File::create(&temp).await.context("create temporary file")?;

        let mut encoder = ZstdEncoder::with_quality(file, Level::Default);
        let (hash, _size) = hashed_copy(&mut Cursor::new(content), &mut encoder)
            .await
            .with_context(|| format!("write content to {temp:?}"))?;

        encoder.shutdown().await.context("flush zstd encoder")?;
        let mut file = encoder.into_inner();
        file.flush().await.context("flush file")?;
        drop(file);

        if key != hash {
            if let Err(err) = remove_file(&temp).await {
                warn!("failed to remove temp file {temp:?}: {err}");
            }
            bail!("hash mismatch: {hash} != {key}");
        }

        match rename(&temp, &path).await {
            Ok(()) => Ok(true),
            Err(err) => {
                if let Err(err) = remove_file(&temp).await {
                    warn!("failed to remove temp file {temp:?}: {err}");
                }
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(false)
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }
}

/// Generate a temporary file path in the same directory as the target.
fn temp_path(target: &std::path::Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

/// Copy content while computing its SHA-256 hash.
async fn hashed_copy(
    mut source: impl AsyncRead + Unpin,
    mut target: impl tokio::io::AsyncWrite + Unpin,
) -> Result<(String, u64)> {
    let mut buffer = vec![0; 16 * 1024];
    let mut hasher = Sha256::new();
    let mut copied = 0;

    loop {
        let n = source.read(&mut buffer).await.context("read source")?;
        if n == 0 {
            break;
        }

        let chunk = &buffer[..n];
        hasher.update(chunk);
        target.write_all(chunk).await.context("write target")?;
        copied += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), copied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn key_of(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    #[tokio::test]
    async fn round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(temp_dir.path());

        let content = b"hello world";
        let key = key_of(content);

        let was_new = cas.write(&key, content).await.unwrap();
        pretty_assert_eq!(was_new, true);

        let was_new = cas.write(&key, content).await.unwrap();
        pretty_assert_eq!(was_new, false);

        let read_content = cas.read_buffered(&key).await.unwrap().unwrap();
        pretty_assert_eq!(read_content, content);
    }

    #[tokio::test]
    async fn missing_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(temp_dir.path());

        let key = key_of(b"nonexistent");

        let exists = cas.exists(&key).await.unwrap();
        pretty_assert_eq!(exists, false);

        let content = cas.read_buffered(&key).await.unwrap();
        pretty_assert_eq!(content, None);
    }
}
