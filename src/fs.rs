//! Filesystem operations tailored to `hustle`.
//!
//! Inside this module we refer to `tokio::fs` by its fully qualified path so
//! it's always clear which IO backend a given call goes through; nothing
//! above this module should reach for `std::fs`/`tokio::fs` directly.

#![allow(
    clippy::disallowed_methods,
    reason = "the methods are disallowed elsewhere, but we need them here"
)]

use std::fmt::Debug as StdDebug;

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use sha2::{Digest, Sha256};
use tap::TapFallible;
use tokio::{io::AsyncReadExt, task::spawn_blocking};
use tracing::{instrument, trace};

use crate::path::{AbsDirPath, AbsFilePath};

/// Determine the canonical cache directory for the current user.
///
/// Uses `HUSTLE_CACHE_DIR` if set; otherwise defers to platform convention
/// via [`directories::ProjectDirs`].
#[instrument]
pub async fn user_cache_dir() -> Result<AbsDirPath> {
    if let Ok(dir) = std::env::var("HUSTLE_CACHE_DIR") {
        return AbsDirPath::assume(dir);
    }

    let dirs = spawn_blocking(|| directories::ProjectDirs::from("", "", "hustle"))
        .await
        .expect("join task")
        .ok_or_eyre("could not determine cache directory")?;

    AbsDirPath::assume(dirs.cache_dir().to_path_buf())
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &AbsDirPath) -> Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Recursively list every regular file under `root`, depth first.
///
/// Symbolic links and directories are not emitted; the walk runs on a
/// blocking thread since `walkdir` has no async variant.
#[instrument]
pub async fn walk_files(root: &AbsDirPath) -> Result<Vec<AbsFilePath>> {
    let root = root.clone();
    spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(root.as_std_path()) {
            let entry = entry.with_context(|| format!("walk files in {root:?}"))?;
            if entry.file_type().is_file() {
                files.push(AbsFilePath::assume(entry.path().to_path_buf())?);
            }
        }
        Ok::<_, color_eyre::Report>(files)
    })
    .await
    .context("join task")?
}

/// Buffer the file content from disk, returning `None` if it doesn't exist.
#[instrument]
pub async fn read_buffered(path: &AbsFilePath) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    create_dir_all(&path.parent_dir()).await?;
    tokio::fs::write(path.as_std_path(), content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Remove a file if present; a missing file is not an error.
#[instrument]
pub async fn remove_file(path: &AbsFilePath) -> Result<()> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
    .tap_ok(|_| trace!(?path, "remove file"))
}

/// Check whether the path exists. Prone to races; prefer trying the
/// operation and handling `NotFound` when the result matters.
#[instrument]
pub async fn exists(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Hash the contents of the file at `path` with SHA-256, streaming through a
/// bounded buffer so large inputs don't need to be read all at once. Used by
/// the fingerprinter to compute the `(relativePath -> sha256hex)` map.
#[instrument]
pub async fn hash_file_sha256(path: &AbsFilePath) -> Result<String> {
    let mut file = tokio::fs::File::open(path.as_std_path())
        .await
        .with_context(|| format!("open file: {path:?}"))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut bytes = 0usize;
    loop {
        let len = file.read(&mut buf).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&buf[..len]);
        bytes += len;
    }
    let hash = hex::encode(hasher.finalize());
    trace!(?path, %hash, bytes, "hash file");
    Ok(hash)
}
