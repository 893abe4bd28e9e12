//! Cache abstractions for `hustle`.
//!
//! The only concrete implementation shipped is [`LocalBackend`]: a local,
//! filesystem-backed content store. A remote object-store backend is a
//! second implementor of [`CacheBackend`] and is out of scope here (see
//! `spec.md` §1's "external collaborator" framing for the cache).

mod backend;
pub mod local;

use color_eyre::Result;

pub use backend::{CacheBackend, CachedFile};
pub use local::LocalBackend;

/// A non-generic handle to whichever cache backend the executor was
/// configured with, per `config::CacheMode` (`spec.md` §4.4: "owns ... the
/// cache handle"). Keeping the executor itself non-generic over
/// `CacheBackend` keeps its public surface simple; `None` still lets
/// fingerprints be computed and persisted, it just never stores or restores
/// outputs (`spec.md` §6's `--cache none`).
#[derive(Clone, Debug)]
pub enum AnyCacheBackend {
    Local(LocalBackend),
    None,
}

impl AnyCacheBackend {
    pub async fn store(&self, fingerprint_key: &str, files: Vec<CachedFile>) -> Result<()> {
        match self {
            Self::Local(backend) => backend.store(fingerprint_key, files).await,
            Self::None => Ok(()),
        }
    }

    pub async fn restore(&self, fingerprint_key: &str) -> Result<Option<Vec<CachedFile>>> {
        match self {
            Self::Local(backend) => backend.restore(fingerprint_key).await,
            Self::None => Ok(None),
        }
    }

    pub async fn exists(&self, fingerprint_key: &str) -> Result<bool> {
        match self {
            Self::Local(backend) => backend.exists(fingerprint_key).await,
            Self::None => Ok(false),
        }
    }
}
