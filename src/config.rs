//! Runtime configuration shared by the executor, watcher, and CLI.
//!
//! The core engine never reads an environment variable or parses a CLI flag
//! itself; everything it needs arrives through [`Config`] or
//! [`LifecycleEnv`], both assembled once at the binary boundary (`spec.md`
//! §6, §9's "no process-global singletons").

use std::path::PathBuf;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};

pub const LIFECYCLE_EVENT_VAR: &str = "HUSTLE_LIFECYCLE_EVENT";
pub const LIFECYCLE_SCRIPT_NAME_VAR: &str = "HUSTLE_LIFECYCLE_SCRIPT_NAME";
pub const PACKAGE_JSON_VAR: &str = "HUSTLE_PACKAGE_JSON";
pub const PARALLELISM_VAR: &str = "HUSTLE_PARALLELISM";
pub const CACHE_VAR: &str = "HUSTLE_CACHE";
pub const CACHE_DIR_VAR: &str = "HUSTLE_CACHE_DIR";

/// The value a run's lifecycle event must equal for the tool to consider
/// itself launched by the expected package-manager runner.
pub const LIFECYCLE_EVENT_SENTINEL: &str = "hustle";

/// The on-disk manifest stanza key and state directory name. Unlike the
/// `HUSTLE_*` environment variables above, this is a wire-format constant
/// shared with every other tool that understands this manifest shape, not a
/// naming choice of this crate.
pub const MANIFEST_STANZA_KEY: &str = "wireit";
pub const STATE_DIR_NAME: &str = ".wireit";

/// Which cache backend the executor should use for cacheable fingerprints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Store and restore outputs from a local, content-addressed directory.
    Local,
    /// Skip cache reads and writes; fingerprints are still computed and
    /// persisted so freshness checks keep working.
    None,
}

/// Policy applied the first time the executor's failure signal fires
/// (`spec.md` §4.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Independent subtrees continue unaffected.
    #[default]
    Continue,
    /// Stop starting new scripts; in-flight executions run to completion.
    NoNew,
    /// Stop starting new scripts and terminate in-flight ones.
    Kill,
}

/// The environment variables a package-manager runner is expected to set
/// before invoking this binary (`spec.md` §6).
#[derive(Clone, Debug)]
pub struct LifecycleEnv {
    pub script_name: String,
    pub package_json: PathBuf,
}

impl LifecycleEnv {
    /// Reads and validates the lifecycle environment. Returns an error
    /// (the *Launch* error kind of `spec.md` §7) if the tool was not
    /// invoked through the expected runner.
    #[tracing::instrument]
    pub fn from_env() -> Result<Self> {
        let event = std::env::var(LIFECYCLE_EVENT_VAR).map_err(|_| {
            color_eyre::eyre::eyre!("launched incorrectly: {LIFECYCLE_EVENT_VAR} is not set")
        })?;
        if event != LIFECYCLE_EVENT_SENTINEL {
            bail!(
                "launched incorrectly: {LIFECYCLE_EVENT_VAR}={event:?}, expected {LIFECYCLE_EVENT_SENTINEL:?}"
            );
        }

        let script_name = std::env::var(LIFECYCLE_SCRIPT_NAME_VAR)
            .with_context(|| format!("launched incorrectly: {LIFECYCLE_SCRIPT_NAME_VAR} is not set"))?;
        let package_json = std::env::var(PACKAGE_JSON_VAR)
            .with_context(|| format!("launched incorrectly: {PACKAGE_JSON_VAR} is not set"))?
            .into();

        Ok(Self {
            script_name,
            package_json,
        })
    }
}

/// Resolved configuration for a single invocation of the executor and
/// watcher, built once at the CLI boundary.
#[derive(Clone, Debug)]
pub struct Config {
    pub parallelism: usize,
    pub cache_mode: CacheMode,
    pub cache_dir: Option<PathBuf>,
    pub watch: bool,
}

impl Config {
    /// Parallelism from `HUSTLE_PARALLELISM`, falling back to `default` when
    /// unset, unparsable, or zero.
    pub fn parallelism_from_env_or(default: impl FnOnce() -> usize) -> usize {
        std::env::var(PARALLELISM_VAR)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(default)
    }
}
