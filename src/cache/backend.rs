//! Cache backend abstraction layer.
//!
//! `spec.md` §1 treats the cache backend as an external collaborator with a
//! narrow interface: something keyed by a cacheable fingerprint that can
//! persist and restore a script's declared `output` files. [`CacheBackend`]
//! is that interface; [`local::LocalBackend`] is the one concrete
//! implementation this crate ships (a local, content-addressed directory),
//! matching the "local directory or remote object store" framing in §1 —
//! a remote backend is a straightforward second implementor of this trait
//! and is intentionally not built here.

use color_eyre::Result;

use crate::path::RelFilePath;

/// One output file captured for caching, content plus the path it should be
/// restored to (relative to the script's package directory).
#[derive(Clone, Debug)]
pub struct CachedFile {
    pub path: RelFilePath,
    pub content: Vec<u8>,
}

/// Trait for cache backend implementations.
///
/// Every method is keyed by a cacheable fingerprint's canonical string
/// (`spec.md` §3/§4.2); callers are responsible for only calling this trait
/// with fingerprints for which `cacheable` is true.
pub trait CacheBackend: Clone + Send + Sync + 'static {
    /// Persist the given output files under `fingerprint_key`, overwriting
    /// any existing entry for that key.
    fn store(
        &self,
        fingerprint_key: &str,
        files: Vec<CachedFile>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Restore the output files persisted under `fingerprint_key`, if any.
    fn restore(
        &self,
        fingerprint_key: &str,
    ) -> impl Future<Output = Result<Option<Vec<CachedFile>>>> + Send;

    /// Check whether an entry exists for `fingerprint_key` without reading it.
    fn exists(&self, fingerprint_key: &str) -> impl Future<Output = Result<bool>> + Send;
}

use std::future::Future;
