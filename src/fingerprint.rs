//! Fingerprinter: computes a canonical fingerprint for a script from its
//! command, options, hashed input files, and its dependencies' fingerprints
//! (`spec.md` §4.2).
//!
//! The canonical form is plain `serde_json`, with both inner maps modeled as
//! `BTreeMap` so key order falls out of the type rather than needing an
//! explicit sort pass — the same trick the teacher's cache manifests use
//! `BTreeMap` for (`daemon/cargo.rs`'s raw invocation log).

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use globset::{Glob, GlobSetBuilder};
use serde::Serialize;

use crate::host;
use crate::path::AbsDirPath;
use crate::script::CleanPolicy;

/// One dependency's contribution to a fingerprint: the string used as its
/// map key (`spec.md` §3's `depRefString`) paired with its own fingerprint.
#[derive(Clone, Debug)]
pub struct DependencyFingerprint {
    pub reference_key: String,
    pub fingerprint: Fingerprint,
}

/// The canonical, fixed-order structure that gets serialized to produce a
/// fingerprint's identity string.
#[derive(Debug, Serialize)]
struct FingerprintData {
    platform: String,
    architecture: String,
    interpreter_version: String,
    command: Option<String>,
    clean: &'static str,
    files: BTreeMap<String, String>,
    output: Vec<String>,
    dependencies: BTreeMap<String, String>,
}

/// A canonical fingerprint string plus whether it's eligible for cache
/// restoration (`spec.md` §3/§4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    canonical: String,
    cacheable: bool,
}

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn into_string(self) -> String {
        self.canonical
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn clean_label(clean: CleanPolicy) -> &'static str {
    match clean {
        CleanPolicy::False => "false",
        CleanPolicy::True => "true",
        CleanPolicy::IfFileDeleted => "if-file-deleted",
    }
}

/// Compute a fingerprint for a script.
///
/// `files_patterns` is `None` for a script that declares no `files` (no
/// input hashing is performed and the resulting fingerprint can never be
/// `cacheable`); `Some(&[])` for a script that declares `files: []`.
///
/// `package_locks` names are hashed and folded into the same file-hash map
/// regardless of whether `files_patterns` is declared, so that a lockfile
/// change invalidates freshness even for a script with no `files` of its
/// own (`spec.md` §4.4: "clean... is also controlled by packageLocks
/// inclusion in the fingerprint").
#[tracing::instrument(skip(dependencies))]
pub async fn compute(
    package_dir: &AbsDirPath,
    command: Option<&str>,
    files_patterns: Option<&[String]>,
    output_patterns: &[String],
    clean: CleanPolicy,
    package_locks: &[String],
    dependencies: &[DependencyFingerprint],
) -> Result<Fingerprint> {
    let interpreter_version = host::interpreter_version().await;

    let mut files = match files_patterns {
        Some(patterns) => hash_matching_files(package_dir, patterns).await?,
        None => BTreeMap::new(),
    };

    for name in package_locks {
        let path = package_dir.join_file(&crate::path::RelFilePath::new(name.clone())?);
        if crate::fs::exists(path.as_std_path()).await {
            let hash = crate::fs::hash_file_sha256(&path).await?;
            files.insert(name.clone(), hash);
        }
    }

    let deps_cacheable = dependencies.iter().all(|dep| dep.fingerprint.cacheable());
    let cacheable = command.is_none() || (files_patterns.is_some() && deps_cacheable);

    let mut output: Vec<String> = output_patterns.to_vec();
    output.sort();

    let dependencies = dependencies
        .iter()
        .map(|dep| (dep.reference_key.clone(), dep.fingerprint.as_str().to_owned()))
        .collect();

    let data = FingerprintData {
        platform: host::platform_name().to_owned(),
        architecture: host::architecture().to_owned(),
        interpreter_version,
        command: command.map(str::to_owned),
        clean: clean_label(clean),
        files,
        output,
        dependencies,
    };

    let canonical = serde_json::to_string(&data).context("serialize fingerprint")?;
    Ok(Fingerprint { canonical, cacheable })
}

/// Expand `patterns` (globs rooted at `package_dir`) against the package's
/// files and hash every match, producing a `relativePath -> sha256hex` map.
///
/// Glob matching is done with `globset` over paths discovered by a plain
/// `walkdir::WalkDir` walk (via [`crate::fs::walk_files`]) — a sequential
/// walk rather than the teacher's parallel `jwalk` walk, since fingerprinting
/// needs a stable hash order, not maximum throughput.
async fn hash_matching_files(
    package_dir: &AbsDirPath,
    patterns: &[String],
) -> Result<BTreeMap<String, String>> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {pattern}"))?);
    }
    let set = builder.build().context("build glob set")?;

    let mut matches = Vec::new();
    for file in crate::fs::walk_files(package_dir).await? {
        let Some(rel) = package_dir.relativize(&file) else {
            continue;
        };
        let rel_str = rel.as_std_path().to_string_lossy().replace('\\', "/");
        if set.is_match(&rel_str) {
            matches.push((rel_str, file));
        }
    }
    matches.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hashes = BTreeMap::new();
    for (rel_str, file) in matches {
        let hash = crate::fs::hash_file_sha256(&file).await?;
        hashes.insert(rel_str, hash);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_command_is_always_cacheable() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let fp = compute(&package_dir, None, None, &[], CleanPolicy::False, &[], &[])
            .await
            .unwrap();
        assert!(fp.cacheable());
    }

    #[tokio::test]
    async fn command_without_files_is_never_cacheable() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let fp = compute(
            &package_dir,
            Some("echo hi"),
            None,
            &[],
            CleanPolicy::False,
            &[],
            &[],
        )
        .await
        .unwrap();
        assert!(!fp.cacheable());
    }

    #[tokio::test]
    async fn fingerprint_is_stable_regardless_of_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();

        let dep_a = DependencyFingerprint {
            reference_key: "a".to_string(),
            fingerprint: compute(&package_dir, None, None, &[], CleanPolicy::False, &[], &[])
                .await
                .unwrap(),
        };
        let dep_b = DependencyFingerprint {
            reference_key: "b".to_string(),
            fingerprint: compute(&package_dir, None, None, &[], CleanPolicy::False, &[], &[])
                .await
                .unwrap(),
        };

        let forward = compute(
            &package_dir,
            Some("echo hi"),
            Some(&[]),
            &[],
            CleanPolicy::False,
            &[],
            &[dep_a.clone(), dep_b.clone()],
        )
        .await
        .unwrap();
        let backward = compute(
            &package_dir,
            Some("echo hi"),
            Some(&[]),
            &[],
            CleanPolicy::False,
            &[],
            &[dep_b, dep_a],
        )
        .await
        .unwrap();

        assert_eq!(forward.as_str(), backward.as_str());
    }

    #[tokio::test]
    async fn hashes_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        tokio::fs::write(dir.path().join("in.txt"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("ignored.md"), b"y").await.unwrap();

        let fp = compute(
            &package_dir,
            Some("echo hi"),
            Some(&["*.txt".to_string()]),
            &[],
            CleanPolicy::False,
            &[],
            &[],
        )
        .await
        .unwrap();
        assert!(fp.as_str().contains("in.txt"));
        assert!(!fp.as_str().contains("ignored.md"));
    }

    #[tokio::test]
    async fn package_lock_contents_are_folded_into_the_file_map() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        tokio::fs::write(dir.path().join("package-lock.json"), b"{}")
            .await
            .unwrap();

        let fp = compute(
            &package_dir,
            Some("echo hi"),
            None,
            &[],
            CleanPolicy::False,
            &["package-lock.json".to_string()],
            &[],
        )
        .await
        .unwrap();
        assert!(fp.as_str().contains("package-lock.json"));
    }
}
