//! Analyzer: resolves an entry [`ScriptReference`] into a fully validated,
//! cycle-free [`ScriptGraph`], or a batch of diagnostics explaining why it
//! couldn't (`spec.md` §4.1).
//!
//! Manifests are loaded and parsed once per package directory and cached for
//! the lifetime of the analysis; cycle detection is a recursive descent with
//! an explicit path stack, matching `spec.md` §4.1's prescribed algorithm.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use color_eyre::{Result, eyre::OptionExt};

use crate::config::MANIFEST_STANZA_KEY;
use crate::diagnostics::{Diagnostic, Location, format_cycle_trail};
use crate::manifest::{self, LoadResult, Manifest, RawClean};
use crate::path::{AbsDirPath, RelFilePath};
use crate::script::{
    CleanPolicy, DependencyEdge, NoCommandConfig, OneShotConfig, ScriptConfig, ScriptGraph,
    ScriptNode, ScriptNodeId, ScriptReference, ServiceConfig,
};

/// A fully resolved graph plus the entry script's node id.
pub struct Analysis {
    pub graph: ScriptGraph,
    pub root: ScriptNodeId,
}

/// The result of an analysis run: either a validated graph, or the batch of
/// diagnostics that prevented one (`spec.md` §4.1: "never throw... batch
/// multiple independent errors").
pub enum Outcome {
    Resolved(Analysis),
    Diagnostics(Vec<Diagnostic>),
}

/// Resolve `entry_script` in the manifest at `root_package_dir`, recursively
/// resolving every dependency it transitively declares.
///
/// IO failures reading the *entry* manifest are real errors (`spec.md` §7's
/// *Launch* error kind — there is no source text yet to anchor a diagnostic
/// to); every other manifest read failure (a cross-package dependency whose
/// target package is missing) becomes a diagnostic anchored at the
/// dependency declaration that pointed at it.
#[tracing::instrument(skip(entry_script))]
pub async fn analyze(
    root_package_dir: AbsDirPath,
    entry_script: impl Into<String> + std::fmt::Debug,
) -> Result<Outcome> {
    let mut analyzer = Analyzer {
        root_package_dir: root_package_dir.clone(),
        graph: ScriptGraph::new(),
        manifests: HashMap::new(),
        resolve_state: HashMap::new(),
        stack: Vec::new(),
        diagnostics: Vec::new(),
    };

    let root_id = analyzer
        .resolve(root_package_dir, entry_script.into(), None)
        .await?;

    if !analyzer.diagnostics.is_empty() {
        return Ok(Outcome::Diagnostics(analyzer.diagnostics));
    }

    let root = root_id.ok_or_eyre(
        "analyzer produced no diagnostics but failed to resolve the entry script (programmer error)",
    )?;
    Ok(Outcome::Resolved(Analysis {
        graph: analyzer.graph,
        root,
    }))
}

enum ResolveState {
    InProgress,
    Done(ScriptNodeId),
    Failed,
}

struct Analyzer {
    root_package_dir: AbsDirPath,
    graph: ScriptGraph,
    manifests: HashMap<AbsDirPath, Option<Arc<Manifest>>>,
    resolve_state: HashMap<String, ResolveState>,
    stack: Vec<ScriptReference>,
    diagnostics: Vec<Diagnostic>,
}

impl Analyzer {
    /// Resolve a single script reference, recursing into its dependencies.
    /// Boxed because async fns can't recurse directly.
    fn resolve<'a>(
        &'a mut self,
        package_dir: AbsDirPath,
        name: String,
        declared_at: Option<Location>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ScriptNodeId>>> + Send + 'a>> {
        Box::pin(async move {
            let reference = ScriptReference::new(package_dir.clone(), name.clone());
            let key = reference.map_key();

            match self.resolve_state.get(&key) {
                Some(ResolveState::Done(id)) => return Ok(Some(*id)),
                Some(ResolveState::Failed) => return Ok(None),
                Some(ResolveState::InProgress) => {
                    self.report_cycle(&reference);
                    return Ok(None);
                }
                None => {}
            }

            self.resolve_state.insert(key.clone(), ResolveState::InProgress);
            self.stack.push(reference.clone());

            let result = self
                .resolve_inner(&package_dir, &name, declared_at.as_ref(), &reference)
                .await?;

            self.stack.pop();
            self.resolve_state.insert(
                key,
                match result {
                    Some(id) => ResolveState::Done(id),
                    None => ResolveState::Failed,
                },
            );
            Ok(result)
        })
    }

    async fn resolve_inner(
        &mut self,
        package_dir: &AbsDirPath,
        name: &str,
        declared_at: Option<&Location>,
        reference: &ScriptReference,
    ) -> Result<Option<ScriptNodeId>> {
        let Some(manifest) = self.load_manifest(package_dir, declared_at).await? else {
            return Ok(None);
        };

        let Some(stanza) = manifest.wireit.get(name) else {
            let primary = declared_at
                .cloned()
                .unwrap_or_else(|| Location::whole_file(manifest.path.clone()));
            self.diagnostics.push(Diagnostic::error(
                format!(
                    "script not found: {}",
                    reference.label(&self.root_package_dir)
                ),
                primary,
            ));
            return Ok(None);
        };

        if let Some(scripts_entry) = manifest.scripts.get(name)
            && scripts_entry.value != MANIFEST_STANZA_KEY
        {
            self.diagnostics.push(
                Diagnostic::error(
                    format!(
                        "scripts.{name} must be {MANIFEST_STANZA_KEY:?} because wireit.{name} is declared"
                    ),
                    scripts_entry.location.clone(),
                )
                .with_supplemental("wireit config declared here", stanza.location.clone()),
            );
            return Ok(None);
        }

        if stanza.command.is_none() && stanza.dependencies.is_empty() {
            self.diagnostics.push(Diagnostic::error(
                format!("wireit.{name} must declare a command, dependencies, or both"),
                stanza.location.clone(),
            ));
            return Ok(None);
        }

        let mut ok = true;

        let mut package_locks = Vec::with_capacity(stanza.package_locks.len());
        for entry in &stanza.package_locks {
            if entry.value.contains('/') || entry.value.contains('\\') {
                self.diagnostics.push(Diagnostic::error(
                    format!(
                        "wireit.{name}.packageLocks entry {:?} must be a filename, not a path",
                        entry.value
                    ),
                    entry.location.clone(),
                ));
                ok = false;
            } else {
                package_locks.push(entry.value.clone());
            }
        }

        let mut seen_deps = std::collections::HashSet::new();
        let mut dep_edges = Vec::with_capacity(stanza.dependencies.len());
        for dep in &stanza.dependencies {
            if !seen_deps.insert(dep.value.clone()) {
                self.diagnostics.push(Diagnostic::error(
                    format!(
                        "wireit.{name}.dependencies contains a duplicate entry: {:?}",
                        dep.value
                    ),
                    dep.location.clone(),
                ));
                ok = false;
                continue;
            }

            let (target_dir, target_name) = match dep.value.split_once(':') {
                Some((rel, dep_name)) => {
                    let target_dir = package_dir.join_relative_str(rel);
                    if target_dir == *package_dir {
                        self.diagnostics.push(Diagnostic::error(
                            format!(
                                "cross-package dependency {:?} must not resolve to its own package",
                                dep.value
                            ),
                            dep.location.clone(),
                        ));
                        ok = false;
                        continue;
                    }
                    (target_dir, dep_name.to_string())
                }
                None => (package_dir.clone(), dep.value.clone()),
            };

            match self
                .resolve(target_dir, target_name, Some(dep.location.clone()))
                .await?
            {
                Some(id) => dep_edges.push(DependencyEdge {
                    target: id,
                    location: dep.location.clone(),
                }),
                None => ok = false,
            }
        }

        if !ok {
            return Ok(None);
        }

        let clean = stanza
            .clean
            .as_ref()
            .map(|c| match c.value {
                RawClean::Bool(true) => CleanPolicy::True,
                RawClean::Bool(false) => CleanPolicy::False,
                RawClean::IfFileDeleted => CleanPolicy::IfFileDeleted,
            })
            .unwrap_or_default();

        let is_service = stanza.service.as_ref().is_some_and(|s| s.value);

        let config = match (&stanza.command, is_service) {
            (None, _) => ScriptConfig::NoCommand(NoCommandConfig),
            (Some(command), true) => ScriptConfig::Service(ServiceConfig {
                command: command.value.clone(),
            }),
            (Some(command), false) => ScriptConfig::OneShot(OneShotConfig {
                command: command.value.clone(),
                files: stanza
                    .files
                    .as_ref()
                    .map(|files| files.iter().map(|f| f.value.clone()).collect()),
                output: stanza.output.iter().map(|o| o.value.clone()).collect(),
                clean,
            }),
        };

        let id = self.graph.insert(ScriptNode {
            reference: reference.clone(),
            config,
            dependencies: dep_edges.clone(),
            reverse_dependencies: Vec::new(),
            package_locks,
        });

        for edge in &dep_edges {
            self.graph.add_reverse_dependency(edge.target, id);
        }

        Ok(Some(id))
    }

    async fn load_manifest(
        &mut self,
        package_dir: &AbsDirPath,
        declared_at: Option<&Location>,
    ) -> Result<Option<Arc<Manifest>>> {
        if let Some(cached) = self.manifests.get(package_dir) {
            return Ok(cached.clone());
        }

        let manifest_path =
            package_dir.join_file(&RelFilePath::new(manifest::MANIFEST_FILE_NAME)?);

        let result = match manifest::load(manifest_path).await {
            Ok(LoadResult::Loaded(manifest)) => Some(Arc::new(*manifest)),
            Ok(LoadResult::Invalid(mut diagnostics)) => {
                self.diagnostics.append(&mut diagnostics);
                None
            }
            Err(err) => match declared_at {
                Some(location) => {
                    self.diagnostics.push(Diagnostic::error(
                        format!("could not read manifest: {err}"),
                        location.clone(),
                    ));
                    None
                }
                None => return Err(err),
            },
        };

        self.manifests.insert(package_dir.clone(), result.clone());
        Ok(result)
    }

    /// Build and record a "Cycle detected" diagnostic for `repeated`, whose
    /// trail begins at `repeated`'s first occurrence on the current DFS
    /// stack and ends with `repeated` again (`spec.md` §4.1, §8).
    fn report_cycle(&mut self, repeated: &ScriptReference) {
        let start = self
            .stack
            .iter()
            .position(|r| r == repeated)
            .unwrap_or(0);

        let labels: Vec<String> = self.stack[start..]
            .iter()
            .chain(std::iter::once(repeated))
            .map(|r| r.label(&self.root_package_dir))
            .collect();
        let trail = format_cycle_trail(&labels);

        let primary = self
            .manifests
            .get(&repeated.package_dir)
            .and_then(|m| m.as_ref())
            .map(|manifest| {
                manifest
                    .wireit
                    .get(&repeated.name)
                    .map(|stanza| stanza.location.clone())
                    .unwrap_or_else(|| Location::whole_file(manifest.path.clone()))
            });

        let Some(primary) = primary else {
            // The manifest should always already be cached for an in-progress
            // reference; if not, there's nowhere to anchor the diagnostic.
            return;
        };

        self.diagnostics.push(Diagnostic::error(
            format!("Cycle detected\n{trail}"),
            primary,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_manifest(dir: &std::path::Path, contents: &str) {
        tokio::fs::write(dir.join("package.json"), contents)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolves_a_simple_no_command_chain() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": { "build": "wireit" },
                "wireit": {
                    "build": { "command": "echo hi", "dependencies": ["prepare"] },
                    "prepare": { "command": "echo prepare" }
                }
            }"#,
        )
        .await;

        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let outcome = analyze(package_dir, "build").await.unwrap();
        let Outcome::Resolved(analysis) = outcome else {
            panic!("expected a resolved graph");
        };
        assert_eq!(analysis.graph.len(), 2);
    }

    #[tokio::test]
    async fn detects_a_self_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": { "a": "wireit" },
                "wireit": { "a": { "command": "echo hi", "dependencies": ["a"] } }
            }"#,
        )
        .await;

        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let outcome = analyze(package_dir, "a").await.unwrap();
        let Outcome::Diagnostics(diagnostics) = outcome else {
            panic!("expected diagnostics for a cycle");
        };
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("Cycle detected"));
        assert!(diagnostics[0].message.contains(".-> a\n`-- a"));
    }

    #[tokio::test]
    async fn detects_a_three_script_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": { "a": "wireit", "b": "wireit", "c": "wireit" },
                "wireit": {
                    "a": { "command": "echo a", "dependencies": ["b"] },
                    "b": { "command": "echo b", "dependencies": ["c"] },
                    "c": { "command": "echo c", "dependencies": ["a"] }
                }
            }"#,
        )
        .await;

        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let outcome = analyze(package_dir, "a").await.unwrap();
        let Outcome::Diagnostics(diagnostics) = outcome else {
            panic!("expected diagnostics for a cycle");
        };
        assert!(diagnostics[0].message.contains(".-> a\n|   b\n|   c\n`-- a"));
    }

    #[tokio::test]
    async fn missing_dependency_is_a_single_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": { "build": "wireit" },
                "wireit": { "build": { "command": "echo hi", "dependencies": ["missing"] } }
            }"#,
        )
        .await;

        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let outcome = analyze(package_dir, "build").await.unwrap();
        let Outcome::Diagnostics(diagnostics) = outcome else {
            panic!("expected a diagnostic for the missing dependency");
        };
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("script not found"));
    }

    #[tokio::test]
    async fn script_not_wireit_mismatch_has_two_locations() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": { "build": "not-wireit" },
                "wireit": { "build": { "command": "echo hi" } }
            }"#,
        )
        .await;

        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let outcome = analyze(package_dir, "build").await.unwrap();
        let Outcome::Diagnostics(diagnostics) = outcome else {
            panic!("expected a diagnostic for the mismatch");
        };
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].supplemental.len(), 1);
    }

    #[tokio::test]
    async fn cross_package_self_reference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "scripts": { "build": "wireit" },
                "wireit": { "build": { "command": "echo hi", "dependencies": [".:build"] } }
            }"#,
        )
        .await;

        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let outcome = analyze(package_dir, "build").await.unwrap();
        assert!(matches!(outcome, Outcome::Diagnostics(_)));
    }
}
