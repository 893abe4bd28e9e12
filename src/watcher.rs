//! Watcher: drives repeated analyze-execute cycles in response to
//! filesystem change events (`spec.md` §4.6).
//!
//! The watch set is rebuilt after every analysis from the resolved graph —
//! every package directory a script lives in, each paired with that
//! package's manifest path and its one-shot nodes' declared `files`
//! patterns. `notify`'s recommended backend has no native glob filter, so
//! each directory is watched recursively and events are matched against the
//! patterns in the handler instead, which is also where a `files` entry's
//! negation pattern (`!generated/**`) gets applied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use globset::{Glob, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::analyzer::{self, Outcome};
use crate::cache::AnyCacheBackend;
use crate::config::FailureMode;
use crate::diagnostics::Diagnostic;
use crate::executor::{Executor, ExecutorConfig};
use crate::path::{AbsDirPath, AbsFilePath};
use crate::script::{ScriptConfig, ScriptGraph, ScriptReference};
use crate::supervisor::OutputChunk;

/// One iteration's outcome, handed to the caller for rendering.
pub enum IterationOutcome {
    Diagnostics(Vec<Diagnostic>),
    Completed(crate::executor::ExecutionResult),
}

/// Configuration a [`Watcher`] is built with; the parts of an
/// [`ExecutorConfig`] that stay fixed across re-analysis, plus the entry
/// point to re-resolve on every iteration.
pub struct WatcherConfig {
    pub root_package_dir: AbsDirPath,
    pub entry_script: String,
    pub failure_mode: FailureMode,
    pub cache: AnyCacheBackend,
    pub parallelism: usize,
    pub output_tx: mpsc::UnboundedSender<(ScriptReference, OutputChunk)>,
    pub outcome_tx: mpsc::UnboundedSender<IterationOutcome>,
}

/// One package directory's contribution to the watch set: its manifest plus
/// the `files` patterns declared by any one-shot script resolved there.
struct WatchTarget {
    manifest: AbsFilePath,
    patterns: Vec<String>,
}

fn watch_targets(graph: &ScriptGraph) -> HashMap<AbsDirPath, WatchTarget> {
    let mut targets: HashMap<AbsDirPath, WatchTarget> = HashMap::new();

    for node in graph.nodes() {
        let package_dir = node.reference.package_dir.clone();
        let manifest = package_dir.join_file(
            &crate::path::RelFilePath::new(crate::manifest::MANIFEST_FILE_NAME)
                .expect("manifest file name is a valid relative path"),
        );
        let entry = targets.entry(package_dir).or_insert_with(|| WatchTarget {
            manifest,
            patterns: Vec::new(),
        });
        if let ScriptConfig::OneShot(cfg) = &node.config
            && let Some(files) = &cfg.files
        {
            entry.patterns.extend(files.iter().cloned());
        }
    }

    targets
}

/// Install a fresh recursive watch over every directory in `targets`,
/// replacing whatever was previously watched (`spec.md` §4.6: "all watches
/// are released across re-analysis").
fn install_watches(
    targets: &HashMap<AbsDirPath, WatchTarget>,
    tx: mpsc::UnboundedSender<Event>,
) -> Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => warn!(?err, "watch backend error"),
        })
        .context("create filesystem watcher")?;

    for dir in targets.keys() {
        watcher
            .watch(dir.as_std_path(), RecursiveMode::Recursive)
            .with_context(|| format!("watch directory: {dir}"))?;
    }

    Ok(watcher)
}

/// Whether a changed path should mark the watch stale: it's the package's
/// manifest, or it matches one of the package's `files` patterns (honoring
/// a leading `!` as a negation that excludes rather than includes).
fn path_is_relevant(target: &WatchTarget, package_dir: &AbsDirPath, changed: &AbsFilePath) -> bool {
    if changed == &target.manifest {
        return true;
    }
    if target.patterns.is_empty() {
        return false;
    }

    let Some(rel) = package_dir.relativize(changed) else {
        return false;
    };
    let rel_str = rel.as_std_path().to_string_lossy().replace('\\', "/");

    let mut included = GlobSetBuilder::new();
    let mut excluded = GlobSetBuilder::new();
    for pattern in &target.patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if let Ok(glob) = Glob::new(negated) {
                excluded.add(glob);
            }
        } else if let Ok(glob) = Glob::new(pattern) {
            included.add(glob);
        }
    }
    let Ok(included) = included.build() else {
        return false;
    };
    let excluded = excluded.build().ok();

    included.is_match(&rel_str) && !excluded.is_some_and(|set| set.is_match(&rel_str))
}

/// Runs the watch loop until `shutdown` resolves (`spec.md` §4.6).
pub struct Watcher {
    config: WatcherConfig,
}

impl Watcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let stale = Arc::new(AtomicBool::new(true));
        let mut current_executor: Option<Arc<Executor>> = None;
        let mut current_watcher: Option<RecommendedWatcher> = None;
        let mut targets: HashMap<AbsDirPath, WatchTarget> = HashMap::new();
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<Event>();

        loop {
            if stale.swap(false, Ordering::SeqCst) {
                if let Some(executor) = current_executor.take() {
                    executor.abort();
                }

                match analyzer::analyze(
                    self.config.root_package_dir.clone(),
                    self.config.entry_script.clone(),
                )
                .await?
                {
                    Outcome::Diagnostics(diagnostics) => {
                        let _ = self
                            .config
                            .outcome_tx
                            .send(IterationOutcome::Diagnostics(diagnostics));
                    }
                    Outcome::Resolved(analysis) => {
                        targets = watch_targets(&analysis.graph);
                        current_watcher =
                            Some(install_watches(&targets, fs_tx.clone()).context("install watches")?);

                        let executor = Executor::new(
                            analysis.graph,
                            analysis.root,
                            ExecutorConfig::builder()
                                .failure_mode(self.config.failure_mode)
                                .cache(self.config.cache.clone())
                                .parallelism(self.config.parallelism)
                                .output_tx(self.config.output_tx.clone())
                                .build(),
                        );
                        current_executor = Some(executor.clone());

                        let outcome_tx = self.config.outcome_tx.clone();
                        let stale_for_run = stale.clone();
                        tokio::spawn(async move {
                            let result = executor.execute_top_level().await;
                            // An aborted run will be superseded by the next
                            // analysis this loop already queued; only
                            // forward the result if nothing marked the
                            // watch stale in the meantime.
                            if !stale_for_run.load(Ordering::SeqCst) {
                                let _ = outcome_tx.send(IterationOutcome::Completed(result));
                            }
                        });
                    }
                }
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    if let Some(executor) = current_executor.take() {
                        executor.abort();
                    }
                    return Ok(());
                }
                event = fs_rx.recv() => {
                    let Some(event) = event else { continue };
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                        continue;
                    }
                    if self.event_is_relevant(&targets, &event) {
                        info!(paths = ?event.paths, "watch set changed, marking stale");
                        stale.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    fn event_is_relevant(&self, targets: &HashMap<AbsDirPath, WatchTarget>, event: &Event) -> bool {
        for raw_path in &event.paths {
            let Ok(changed) = AbsFilePath::assume(raw_path.clone()) else {
                continue;
            };
            for (package_dir, target) in targets {
                if package_dir.relativize(&changed).is_some() && path_is_relevant(target, package_dir, &changed) {
                    return true;
                }
            }
        }
        false
    }
}
