//! Path types tailored to `hustle`.
//!
//! Scripts, manifests, and cache entries are all addressed relative to a
//! package directory, and the engine needs to keep absolute and relative
//! paths from being confused with each other at the type level. This module
//! wraps `std::path::PathBuf` in a small typestate (`Base` = [`Abs`]/[`Rel`],
//! `Type` = [`Dir`]/[`File`]) so that, e.g., a function that joins a relative
//! input glob onto a package directory cannot accidentally be handed two
//! absolute paths.
//!
//! Unlike the wider path toolkits this is modeled on, there is no attempt
//! here to support a cross-product of conversions; only the operations the
//! engine actually performs (joining, relativizing, re-basing) are provided.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::bail};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type RelFilePath = TypedPath<Rel, File>;
pub type RelDirPath = TypedPath<Rel, Dir>;
pub type AbsFilePath = TypedPath<Abs, File>;
pub type AbsDirPath = TypedPath<Abs, Dir>;

/// Marker for a path known to be absolute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Abs;
/// Marker for a path known to be relative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rel;
/// Marker for a path known to point at a directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dir;
/// Marker for a path known to point at a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct File;

/// A [`PathBuf`] tagged at compile time with whether it is absolute or
/// relative, and whether it refers to a directory or a file.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("{}", self.0.display())]
pub struct TypedPath<Base, Type>(PathBuf, PhantomData<(Base, Type)>);

impl<Base, Type> std::fmt::Debug for TypedPath<Base, Type> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl<Base, Type> TypedPath<Base, Type> {
    fn wrap(path: PathBuf) -> Self {
        Self(path, PhantomData)
    }

    pub fn as_std_path(&self) -> &Path {
        &self.0
    }

    pub fn into_std_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }
}

impl TypedPath<Abs, Dir> {
    /// Construct from an already-absolute directory path, trusting the
    /// caller. Used when a path has just come from `std::env::current_dir`
    /// or another source already known to be absolute.
    pub fn assume(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            bail!("path is not absolute: {}", path.display());
        }
        Ok(Self::wrap(path))
    }

    /// Join a relative file path onto this directory.
    pub fn join_file(&self, rel: &TypedPath<Rel, File>) -> TypedPath<Abs, File> {
        TypedPath::wrap(self.0.join(&rel.0))
    }

    /// Join a relative directory path onto this directory.
    pub fn join_dir(&self, rel: &TypedPath<Rel, Dir>) -> TypedPath<Abs, Dir> {
        TypedPath::wrap(self.0.join(&rel.0))
    }

    /// Join a raw relative path segment (e.g. a cross-package reference)
    /// onto this directory, normalizing `.`/`..` components lexically.
    pub fn join_relative_str(&self, rel: &str) -> TypedPath<Abs, Dir> {
        let mut joined = self.0.clone();
        for component in Path::new(rel).components() {
            joined.push(component.as_os_str());
        }
        TypedPath::wrap(lexically_normalize(&joined))
    }

    /// Express `target` relative to `self`, if `target` is nested under it
    /// (or `self` itself). Used to render diagnostics relative to the
    /// invocation's working directory.
    pub fn relativize(&self, target: &TypedPath<Abs, File>) -> Option<TypedPath<Rel, File>> {
        target
            .0
            .strip_prefix(&self.0)
            .ok()
            .map(|p| TypedPath::wrap(p.to_path_buf()))
    }

    /// Express `target` relative to `self`, walking up through common
    /// ancestors as needed (`../sibling`, `../../cousin`, etc). Unlike
    /// [`TypedPath::relativize`] this always succeeds, since two absolute
    /// paths always share at least their root component. Used for
    /// cross-package labels (`spec.md` §4.1's `relative/path:name`).
    pub fn relativize_dir(&self, target: &TypedPath<Abs, Dir>) -> TypedPath<Rel, Dir> {
        TypedPath::wrap(relative_between(&self.0, &target.0))
    }
}

/// Compute `target` expressed relative to `base`, lexically (no filesystem
/// access, no symlink resolution).
fn relative_between(base: &Path, target: &Path) -> PathBuf {
    let base_comps: Vec<_> = base.components().collect();
    let target_comps: Vec<_> = target.components().collect();
    let common_len = base_comps
        .iter()
        .zip(target_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..base_comps.len() {
        result.push("..");
    }
    for component in &target_comps[common_len..] {
        result.push(component.as_os_str());
    }
    result
}

impl TypedPath<Abs, File> {
    pub fn assume(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            bail!("path is not absolute: {}", path.display());
        }
        Ok(Self::wrap(path))
    }

    /// The directory containing this file.
    pub fn parent_dir(&self) -> TypedPath<Abs, Dir> {
        TypedPath::wrap(self.0.parent().unwrap_or(&self.0).to_path_buf())
    }
}

impl TypedPath<Rel, File> {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            bail!("path is not relative: {}", path.display());
        }
        Ok(Self::wrap(path))
    }
}

impl TypedPath<Rel, Dir> {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_absolute() {
            bail!("path is not relative: {}", path.display());
        }
        Ok(Self::wrap(path))
    }
}

impl<Base, Type> Serialize for TypedPath<Base, Type> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.to_string_lossy().serialize(serializer)
    }
}

impl<'de, Base, Type> Deserialize<'de> for TypedPath<Base, Type> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::wrap(PathBuf::from(raw)))
    }
}

/// Collapse `.`/`..` components without touching the filesystem. Used for
/// cross-package dependency paths (`../sibling:build`), which must resolve
/// the same way regardless of symlinks.
fn lexically_normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_relative_str_normalizes_dotdot() {
        let base = AbsDirPath::assume("/work/foo").unwrap();
        let joined = base.join_relative_str("../bar");
        assert_eq!(joined.as_std_path(), Path::new("/work/bar"));
    }

    #[test]
    fn rejects_absolute_rel_path() {
        assert!(RelFilePath::new("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_relative_abs_path() {
        assert!(AbsDirPath::assume("relative/dir").is_err());
    }

    #[test]
    fn relativize_strips_prefix() {
        let base = AbsDirPath::assume("/work/foo").unwrap();
        let file = AbsFilePath::assume("/work/foo/src/main.rs").unwrap();
        let rel = base.relativize(&file).unwrap();
        assert_eq!(rel.as_std_path(), Path::new("src/main.rs"));
    }
}
