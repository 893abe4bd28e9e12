//! Executor: the per-invocation coordinator that walks a resolved
//! [`ScriptGraph`], dispatching each script to one of three execution
//! variants and applying the failure-mode policy (`spec.md` §4.4).
//!
//! Execution is memoized per [`ScriptNodeId`] with an [`OnceCompletion`]
//! exactly as `spec.md` §9 prescribes for the scheduler's DAG walk: the
//! first caller to reach a given script runs it, every other caller
//! rendezvouses on the same result. The recursive walk through a script's
//! dependencies needs the same `Box::pin` treatment [`crate::analyzer`]
//! uses for its own recursive descent, for the same reason (async fns can't
//! recurse directly).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bon::Builder;
use color_eyre::eyre::Context;
use derive_more::Display;
use itertools::Itertools;
use rand::seq::SliceRandom;
use tokio::sync::{Semaphore, mpsc};
use tracing::instrument;

use crate::cache::AnyCacheBackend;
use crate::config::{self, FailureMode};
use crate::fingerprint::{self, DependencyFingerprint, Fingerprint};
use crate::once::OnceCompletion;
use crate::path::{AbsDirPath, RelFilePath};
use crate::script::{
    CleanPolicy, OneShotConfig, ScriptConfig, ScriptGraph, ScriptNode, ScriptNodeId,
    ScriptReference, ServiceConfig,
};
use crate::service::{self, ConsumerHandle, ExecutionError, ServiceExecution};
use crate::supervisor::{self, ExitResult, OutputChunk};

/// Which of the three execution paths actually ran, for reporting
/// ("fresh"/"cached"/etc, `spec.md` §8's end-to-end scenarios).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum SuccessKind {
    #[display("already fresh")]
    Fresh,
    #[display("restored from cache")]
    Cached,
    #[display("ran")]
    Ran,
    #[display("no-command")]
    NoCommand,
    #[display("service")]
    Service,
}

/// The result of a single script's execution: its fingerprint, which path
/// produced it, and the list of services a downstream consumer must itself
/// acquire (`spec.md` §4.4: "the list of services that must remain
/// available to downstream consumers"). Empty for one-shot scripts, since
/// those are fully consumed internally; a union of dependency forwards for
/// no-command scripts; `[self]` for a script that is itself a service.
#[derive(Clone)]
pub struct ExecutionOutcome {
    pub fingerprint: Fingerprint,
    pub kind: SuccessKind,
    pub services: Vec<Arc<ServiceExecution>>,
}

pub type ExecutionResult = Result<ExecutionOutcome, ExecutionError>;

/// Configuration an [`Executor`] is built with, assembled once at the CLI
/// boundary (`spec.md` §9: "do not use process-global singletons").
#[derive(Builder)]
pub struct ExecutorConfig {
    #[builder(default = FailureMode::Continue)]
    pub failure_mode: FailureMode,
    pub cache: AnyCacheBackend,
    #[builder(default = num_cpus::get())]
    pub parallelism: usize,
    /// Tagged output chunks, forwarded to whatever renders them (the CLI's
    /// log layer, or a test harness). Tagging with the originating
    /// [`ScriptReference`] is this crate's concern; framing concurrent
    /// children's output against each other is left to that collaborator
    /// (`spec.md` §9's open question on stdout/stderr interleaving).
    pub output_tx: mpsc::UnboundedSender<(ScriptReference, OutputChunk)>,
}

/// Single per-invocation coordinator (`spec.md` §4.4). Constructed from a
/// resolved [`crate::analyzer::Analysis`] plus an [`ExecutorConfig`]; always
/// held behind an `Arc` so its async methods can recurse through
/// dependencies and hand out `Weak` references to services.
pub struct Executor {
    graph: ScriptGraph,
    root: ScriptNodeId,
    cache: AnyCacheBackend,
    failure_mode: FailureMode,
    worker_slots: Arc<Semaphore>,
    output_tx: mpsc::UnboundedSender<(ScriptReference, OutputChunk)>,
    memo: Mutex<HashMap<ScriptNodeId, Arc<OnceCompletion<ExecutionResult>>>>,
    services: Mutex<HashMap<ScriptNodeId, Arc<ServiceExecution>>>,
    /// For a node that fails before reaching the point where it would
    /// acquire the services it depends on, the services whose reservation
    /// on it must be released instead (`spec.md` §4.5; see
    /// [`ScriptGraph::service_reservations_by_consumer`]).
    consumer_reservations: HashMap<ScriptNodeId, Vec<ScriptNodeId>>,
    in_flight: Mutex<HashMap<ScriptNodeId, supervisor::ChildHandle>>,
    notified: AtomicBool,
    no_new: AtomicBool,
    /// Resolves when an external signal or a `kill` failure-mode abort
    /// fires; `execute_top_level` waits on this to know when to release the
    /// entrypoint's service consumer handles (`spec.md` §4.5's "entrypoint
    /// consumer... held until abort").
    abort: OnceCompletion<()>,
}

impl Executor {
    pub fn new(graph: ScriptGraph, root: ScriptNodeId, config: ExecutorConfig) -> Arc<Self> {
        let consumer_reservations = graph.service_reservations_by_consumer();
        Arc::new(Self {
            graph,
            root,
            cache: config.cache,
            failure_mode: config.failure_mode,
            worker_slots: Arc::new(Semaphore::new(config.parallelism.max(1))),
            output_tx: config.output_tx,
            memo: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            consumer_reservations,
            in_flight: Mutex::new(HashMap::new()),
            notified: AtomicBool::new(false),
            no_new: AtomicBool::new(false),
            abort: OnceCompletion::new(),
        })
    }

    pub fn graph(&self) -> &ScriptGraph {
        &self.graph
    }

    pub fn root(&self) -> ScriptNodeId {
        self.root
    }

    /// Execute the root and keep any top-level services alive until the
    /// abort signal fires (`spec.md` §4.4's `executeTopLevel`).
    #[instrument(skip(self))]
    pub async fn execute_top_level(self: &Arc<Self>) -> ExecutionResult {
        let result = self.execute(self.root).await;

        if let Ok(outcome) = &result
            && !outcome.services.is_empty()
        {
            let mut entry_handles = Vec::with_capacity(outcome.services.len());
            for service in &outcome.services {
                if let Ok(handle) = service.acquire().await {
                    entry_handles.push(handle);
                }
            }

            self.abort.wait().await;
            release_all(entry_handles).await;
        }

        result
    }

    /// Execute a single script, memoized so a given [`ScriptNodeId`] is
    /// ever run at most once per invocation (`spec.md` §3: "deduplicated
    /// across the analysis").
    pub fn execute<'a>(
        self: &'a Arc<Self>,
        id: ScriptNodeId,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        Box::pin(async move {
            let (completion, is_first) = {
                let mut memo = self.memo.lock().expect("executor memo mutex poisoned");
                match memo.get(&id) {
                    Some(existing) => (existing.clone(), false),
                    None => {
                        let completion = Arc::new(OnceCompletion::new());
                        memo.insert(id, completion.clone());
                        (completion, true)
                    }
                }
            };

            if !is_first {
                return completion.wait().await;
            }

            let result = self.execute_uncached(id).await;
            completion.resolve(result.clone());
            result
        })
    }

    async fn execute_uncached(self: &Arc<Self>, id: ScriptNodeId) -> ExecutionResult {
        if self.no_new.load(Ordering::SeqCst) {
            return Err(ExecutionError::Terminated);
        }

        let node = self.graph.get(id).clone();
        match &node.config {
            ScriptConfig::NoCommand(_) => self.execute_no_command(id, &node).await,
            ScriptConfig::OneShot(cfg) => self.execute_one_shot(id, &node, cfg.clone()).await,
            ScriptConfig::Service(cfg) => self.execute_service(id, &node, cfg.clone()).await,
        }
    }

    /// Resolve `node`'s dependencies in randomized order (`spec.md` §4.4:
    /// "to surface undeclared ordering assumptions"), waiting for every
    /// one to succeed and collecting both their fingerprints and the union
    /// of the services they forward.
    async fn resolve_dependencies(
        self: &Arc<Self>,
        node: &ScriptNode,
    ) -> Result<(Vec<DependencyFingerprint>, Vec<Arc<ServiceExecution>>), ExecutionError> {
        let mut edges = node.dependencies.clone();
        edges.shuffle(&mut rand::thread_rng());

        let outcomes =
            futures::future::join_all(edges.iter().map(|edge| self.execute(edge.target))).await;

        let mut fingerprints = Vec::with_capacity(outcomes.len());
        let mut services = Vec::new();
        for (edge, outcome) in edges.iter().zip(outcomes) {
            let dep_reference = self.graph.get(edge.target).reference.clone();
            match outcome {
                Ok(outcome) => {
                    fingerprints.push(DependencyFingerprint {
                        reference_key: dep_reference.map_key(),
                        fingerprint: outcome.fingerprint,
                    });
                    services.extend(outcome.services);
                }
                Err(_) => return Err(ExecutionError::DependencyFailed(dep_reference)),
            }
        }

        let services = services
            .into_iter()
            .unique_by(|service| service.reference().map_key())
            .collect();

        Ok((fingerprints, services))
    }

    /// If `id` fails before it ever reaches the point of acquiring the
    /// services it would have consumed, release those services'
    /// reservations on it instead, so they can still stop once every other
    /// expected consumer has settled (`spec.md` §4.5).
    async fn cancel_reservations_for(&self, id: ScriptNodeId) {
        let Some(service_ids) = self.consumer_reservations.get(&id) else {
            return;
        };
        let services: Vec<_> = {
            let services = self.services.lock().expect("executor services mutex poisoned");
            service_ids.iter().filter_map(|service_id| services.get(service_id).cloned()).collect()
        };
        for service in services {
            service.cancel_reservation().await;
        }
    }

    #[instrument(skip(self, node), fields(script = %node.reference))]
    async fn execute_no_command(self: &Arc<Self>, id: ScriptNodeId, node: &ScriptNode) -> ExecutionResult {
        let (dependencies, services) = match self.resolve_dependencies(node).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.cancel_reservations_for(id).await;
                return Err(err);
            }
        };

        let fingerprint = fingerprint::compute(
            &node.reference.package_dir,
            None,
            None,
            &[],
            CleanPolicy::False,
            &node.package_locks,
            &dependencies,
        )
        .await
        .map_err(io_error)?;

        Ok(ExecutionOutcome {
            fingerprint,
            kind: SuccessKind::NoCommand,
            services,
        })
    }

    #[instrument(skip(self, node, cfg), fields(script = %node.reference))]
    async fn execute_service(
        self: &Arc<Self>,
        id: ScriptNodeId,
        node: &ScriptNode,
        cfg: ServiceConfig,
    ) -> ExecutionResult {
        let (dependencies, upstream) = match self.resolve_dependencies(node).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.cancel_reservations_for(id).await;
                return Err(err);
            }
        };

        let fingerprint = match fingerprint::compute(
            &node.reference.package_dir,
            Some(&cfg.command),
            None,
            &[],
            CleanPolicy::False,
            &node.package_locks,
            &dependencies,
        )
        .await
        {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                self.cancel_reservations_for(id).await;
                return Err(io_error(err));
            }
        };

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let reference = node.reference.clone();
        let forward = self.output_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = raw_rx.recv().await {
                if forward.send((reference.clone(), chunk)).is_err() {
                    break;
                }
            }
        });

        let notifier: Arc<dyn service::FailureNotifier> = self.clone();
        let expected_consumers = self.graph.service_expected_consumers(id, self.root);
        let service = ServiceExecution::new(
            node.reference.clone(),
            cfg.command.clone(),
            node.reference.package_dir.clone(),
            upstream,
            expected_consumers,
            raw_tx,
            Arc::downgrade(&notifier),
        );

        self.services
            .lock()
            .expect("executor services mutex poisoned")
            .insert(id, service.clone());

        Ok(ExecutionOutcome {
            fingerprint,
            kind: SuccessKind::Service,
            services: vec![service],
        })
    }

    #[instrument(skip(self, node, cfg), fields(script = %node.reference))]
    async fn execute_one_shot(
        self: &Arc<Self>,
        id: ScriptNodeId,
        node: &ScriptNode,
        cfg: OneShotConfig,
    ) -> ExecutionResult {
        let (dependencies, services) = match self.resolve_dependencies(node).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.cancel_reservations_for(id).await;
                return Err(err);
            }
        };

        let mut consumers = Vec::with_capacity(services.len());
        let mut failure = None;
        for (index, service) in services.iter().enumerate() {
            match service.acquire().await {
                Ok(handle) => consumers.push(handle),
                Err(_) => {
                    failure = Some((index, service.reference().clone()));
                    break;
                }
            }
        }
        if let Some((index, failed_reference)) = failure {
            release_all(consumers).await;
            // The failing service already knows it failed; anything after
            // it in this node's own service list was never attempted.
            for service in &services[index..] {
                service.cancel_reservation().await;
            }
            return Err(ExecutionError::DependencyFailed(failed_reference));
        }

        let package_dir = node.reference.package_dir.clone();
        let name = node.reference.name.clone();

        let fingerprint = fingerprint::compute(
            &package_dir,
            Some(&cfg.command),
            cfg.files.as_deref(),
            &cfg.output,
            cfg.clean,
            &node.package_locks,
            &dependencies,
        )
        .await
        .map_err(io_error)?;

        if is_fresh(&package_dir, &name, &fingerprint, &cfg.output)
            .await
            .map_err(io_error)?
        {
            release_all(consumers).await;
            return Ok(ExecutionOutcome {
                fingerprint,
                kind: SuccessKind::Fresh,
                services: vec![],
            });
        }

        if fingerprint.cacheable()
            && let Some(files) = self
                .cache
                .restore(fingerprint.as_str())
                .await
                .map_err(io_error)?
        {
            for file in files {
                let path = package_dir.join_file(&file.path);
                crate::fs::write(&path, &file.content).await.map_err(io_error)?;
                // Restored files carry the mtime of whichever run produced
                // the cached blob; bump it to now so tools downstream of
                // this script that key off mtime (rather than content) see
                // a cache restore as indistinguishable from a fresh build.
                let std_path = path.as_std_path().to_owned();
                tokio::task::spawn_blocking(move || {
                    filetime::set_file_mtime(&std_path, filetime::FileTime::now())
                })
                .await
                .map_err(|err| io_error(err.into()))?
                .map_err(|err| io_error(err.into()))?;
            }
            write_state(&package_dir, &name, fingerprint.as_str())
                .await
                .map_err(io_error)?;
            release_all(consumers).await;
            return Ok(ExecutionOutcome {
                fingerprint,
                kind: SuccessKind::Cached,
                services: vec![],
            });
        }

        let should_clean = match cfg.clean {
            CleanPolicy::True => true,
            CleanPolicy::False => false,
            CleanPolicy::IfFileDeleted => match read_state(&package_dir, &name).await.map_err(io_error)? {
                Some(prior) => file_count(&prior) > file_count(fingerprint.as_str()),
                None => false,
            },
        };
        if should_clean && !cfg.output.is_empty() {
            clean_outputs(&package_dir, &cfg.output).await.map_err(io_error)?;
        }

        if self.no_new.load(Ordering::SeqCst) {
            release_all(consumers).await;
            return Err(ExecutionError::Terminated);
        }

        let _permit = self
            .worker_slots
            .acquire()
            .await
            .expect("worker-slot semaphore closed");

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let reference = node.reference.clone();
        let forward = self.output_tx.clone();
        let drain = tokio::spawn(drain_output(raw_rx, forward, reference));

        let child = supervisor::spawn(&cfg.command, &package_dir, raw_tx).await;
        self.in_flight
            .lock()
            .expect("executor in-flight mutex poisoned")
            .insert(id, child.clone());
        let exit = child.wait().await;
        self.in_flight
            .lock()
            .expect("executor in-flight mutex poisoned")
            .remove(&id);

        let (stdout, stderr) = drain.await.unwrap_or_default();
        write_captured_output(&package_dir, &name, &stdout, &stderr)
            .await
            .map_err(io_error)?;

        if !exit.is_success() {
            release_all(consumers).await;
            self.apply_failure_policy();
            return Err(exit_to_execution_error(exit));
        }

        if fingerprint.cacheable() {
            let files = collect_outputs(&package_dir, &cfg.output).await.map_err(io_error)?;
            self.cache
                .store(fingerprint.as_str(), files)
                .await
                .map_err(io_error)?;
        }
        write_state(&package_dir, &name, fingerprint.as_str())
            .await
            .map_err(io_error)?;

        release_all(consumers).await;
        Ok(ExecutionOutcome {
            fingerprint,
            kind: SuccessKind::Ran,
            services: vec![],
        })
    }

    /// Apply this invocation's [`FailureMode`] the first time a failure is
    /// reported (`spec.md` §4.4's `notifyFailure`, idempotent).
    fn apply_failure_policy(&self) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.failure_mode {
            FailureMode::Continue => {}
            FailureMode::NoNew => {
                self.no_new.store(true, Ordering::SeqCst);
            }
            FailureMode::Kill => {
                self.no_new.store(true, Ordering::SeqCst);
                self.terminate_in_flight();
            }
        }
    }

    fn terminate_in_flight(&self) {
        let in_flight = self.in_flight.lock().expect("executor in-flight mutex poisoned");
        for child in in_flight.values() {
            child.terminate();
        }
    }

    /// Stop starting new scripts, terminate every in-flight child, and
    /// release every top-level service's entrypoint consumer handle
    /// (`spec.md` §5: "abort... releases entrypoint consumer handles on
    /// top-level services"). Idempotent: a second call is a no-op since
    /// `abort` only ever resolves once.
    pub fn abort(&self) {
        self.no_new.store(true, Ordering::SeqCst);
        self.terminate_in_flight();
        self.abort.resolve(());
    }
}

impl service::FailureNotifier for Executor {
    fn notify_failure(&self) {
        self.apply_failure_policy();
    }
}

async fn release_all(handles: Vec<ConsumerHandle>) {
    for handle in handles {
        handle.release().await;
    }
}

fn io_error(err: color_eyre::Report) -> ExecutionError {
    ExecutionError::Io(err.to_string())
}

fn exit_to_execution_error(exit: ExitResult) -> ExecutionError {
    match exit {
        ExitResult::Ok => unreachable!("success is handled by the caller before this is reached"),
        ExitResult::ExitNonZero(code) => ExecutionError::ExitNonZero(code),
        ExitResult::Signal(name) => ExecutionError::Signal(name),
        ExitResult::SpawnError(message) => ExecutionError::SpawnError(message),
        ExitResult::Terminated => ExecutionError::Terminated,
    }
}

async fn drain_output(
    mut rx: mpsc::UnboundedReceiver<OutputChunk>,
    forward: mpsc::UnboundedSender<(ScriptReference, OutputChunk)>,
    reference: ScriptReference,
) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(chunk) = rx.recv().await {
        match &chunk {
            OutputChunk::Stdout(line) => {
                stdout.push_str(line);
                stdout.push('\n');
            }
            OutputChunk::Stderr(line) => {
                stderr.push_str(line);
                stderr.push('\n');
            }
        }
        if forward.send((reference.clone(), chunk)).is_err() {
            break;
        }
    }
    (stdout, stderr)
}

/// A script is fresh iff a prior-run fingerprint is persisted and equals
/// the current one, and every declared output is present (`spec.md` §4.2).
async fn is_fresh(
    package_dir: &AbsDirPath,
    name: &str,
    fingerprint: &Fingerprint,
    output_patterns: &[String],
) -> color_eyre::Result<bool> {
    let Some(prior) = read_state(package_dir, name).await? else {
        return Ok(false);
    };
    if prior != fingerprint.as_str() {
        return Ok(false);
    }
    if !output_patterns.is_empty() && matching_paths(package_dir, output_patterns).await?.is_empty() {
        return Ok(false);
    }
    Ok(true)
}

/// Expand `patterns` (globs rooted at `package_dir`) to the files currently
/// present on disk that match, same walk shape as
/// [`crate::fingerprint::hash_matching_files`].
async fn matching_paths(
    package_dir: &AbsDirPath,
    patterns: &[String],
) -> color_eyre::Result<Vec<crate::path::AbsFilePath>> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            globset::Glob::new(pattern).with_context(|| format!("invalid glob: {pattern}"))?,
        );
    }
    let set = builder.build().context("build glob set")?;

    let mut matches = Vec::new();
    for file in crate::fs::walk_files(package_dir).await? {
        let Some(rel) = package_dir.relativize(&file) else {
            continue;
        };
        let rel_str = rel.as_std_path().to_string_lossy().replace('\\', "/");
        if set.is_match(&rel_str) {
            matches.push(file);
        }
    }
    Ok(matches)
}

async fn clean_outputs(package_dir: &AbsDirPath, output_patterns: &[String]) -> color_eyre::Result<()> {
    for file in matching_paths(package_dir, output_patterns).await? {
        crate::fs::remove_file(&file).await?;
    }
    Ok(())
}

async fn collect_outputs(
    package_dir: &AbsDirPath,
    output_patterns: &[String],
) -> color_eyre::Result<Vec<crate::cache::CachedFile>> {
    let mut files = Vec::new();
    for file in matching_paths(package_dir, output_patterns).await? {
        let Some(rel) = package_dir.relativize(&file) else {
            continue;
        };
        let Some(content) = crate::fs::read_buffered(&file).await? else {
            continue;
        };
        files.push(crate::cache::CachedFile { path: rel, content });
    }
    Ok(files)
}

/// Number of entries in a canonical fingerprint string's `files` map, used
/// to detect whether the declared input set shrank since the last run
/// (`clean == "if-file-deleted"`, `spec.md` §4.4).
fn file_count(fingerprint_json: &str) -> usize {
    serde_json::from_str::<serde_json::Value>(fingerprint_json)
        .ok()
        .and_then(|value| value.get("files").and_then(|f| f.as_object().map(|o| o.len())))
        .unwrap_or(0)
}

fn state_dir(package_dir: &AbsDirPath, name: &str) -> AbsDirPath {
    let hex_name = hex::encode(name.as_bytes());
    package_dir.join_relative_str(&format!("{}/{hex_name}", config::STATE_DIR_NAME))
}

async fn read_state(package_dir: &AbsDirPath, name: &str) -> color_eyre::Result<Option<String>> {
    let path = state_dir(package_dir, name).join_file(&RelFilePath::new("state")?);
    match crate::fs::read_buffered(&path).await? {
        Some(bytes) => Ok(Some(String::from_utf8(bytes).context("state file is not utf8")?)),
        None => Ok(None),
    }
}

async fn write_state(package_dir: &AbsDirPath, name: &str, fingerprint: &str) -> color_eyre::Result<()> {
    let path = state_dir(package_dir, name).join_file(&RelFilePath::new("state")?);
    crate::fs::write(&path, fingerprint).await
}

async fn write_captured_output(
    package_dir: &AbsDirPath,
    name: &str,
    stdout: &str,
    stderr: &str,
) -> color_eyre::Result<()> {
    let dir = state_dir(package_dir, name);
    crate::fs::write(&dir.join_file(&RelFilePath::new("stdout")?), stdout).await?;
    crate::fs::write(&dir.join_file(&RelFilePath::new("stderr")?), stderr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::AbsDirPath;
    use crate::script::{DependencyEdge, NoCommandConfig, ScriptNode};

    fn new_executor(graph: ScriptGraph, root: ScriptNodeId) -> Arc<Executor> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Executor::new(
            graph,
            root,
            ExecutorConfig::builder()
                .cache(AnyCacheBackend::None)
                .parallelism(2)
                .output_tx(tx)
                .build(),
        )
    }

    #[tokio::test]
    async fn one_shot_without_files_is_never_fresh_twice() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();

        let mut graph = ScriptGraph::new();
        let id = graph.insert(ScriptNode {
            reference: ScriptReference::new(package_dir.clone(), "build".to_string()),
            config: ScriptConfig::OneShot(OneShotConfig {
                command: "true".to_string(),
                files: None,
                output: vec![],
                clean: CleanPolicy::False,
            }),
            dependencies: vec![],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });

        let executor = new_executor(graph, id);
        let first = executor.execute(id).await.unwrap();
        assert_eq!(first.kind, SuccessKind::Ran);
        assert!(!first.fingerprint.cacheable());
    }

    #[tokio::test]
    async fn second_run_with_unchanged_files_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        tokio::fs::write(dir.path().join("in.txt"), b"x").await.unwrap();

        let mut graph = ScriptGraph::new();
        let id = graph.insert(ScriptNode {
            reference: ScriptReference::new(package_dir.clone(), "build".to_string()),
            config: ScriptConfig::OneShot(OneShotConfig {
                command: "true".to_string(),
                files: Some(vec!["in.txt".to_string()]),
                output: vec![],
                clean: CleanPolicy::False,
            }),
            dependencies: vec![],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });

        let executor = new_executor(graph.clone(), id);
        let first = executor.execute(id).await.unwrap();
        assert_eq!(first.kind, SuccessKind::Ran);

        let executor = new_executor(graph, id);
        let second = executor.execute(id).await.unwrap();
        assert_eq!(second.kind, SuccessKind::Fresh);
    }

    #[tokio::test]
    async fn no_command_forwards_dependency_services() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();

        let mut graph = ScriptGraph::new();
        let service_id = graph.insert(ScriptNode {
            reference: ScriptReference::new(package_dir.clone(), "server".to_string()),
            config: ScriptConfig::Service(ServiceConfig {
                command: "sleep 30".to_string(),
            }),
            dependencies: vec![],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });
        let relay_id = graph.insert(ScriptNode {
            reference: ScriptReference::new(package_dir.clone(), "relay".to_string()),
            config: ScriptConfig::NoCommand(NoCommandConfig),
            dependencies: vec![DependencyEdge {
                target: service_id,
                location: crate::diagnostics::Location::whole_file(
                    crate::path::AbsFilePath::assume(dir.path().join("package.json")).unwrap(),
                ),
            }],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });
        graph.add_reverse_dependency(service_id, relay_id);

        let executor = new_executor(graph, relay_id);
        let outcome = executor.execute(relay_id).await.unwrap();
        assert_eq!(outcome.kind, SuccessKind::NoCommand);
        assert_eq!(outcome.services.len(), 1);
    }

    #[tokio::test]
    async fn dependency_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();

        let mut graph = ScriptGraph::new();
        let dep_id = graph.insert(ScriptNode {
            reference: ScriptReference::new(package_dir.clone(), "dep".to_string()),
            config: ScriptConfig::OneShot(OneShotConfig {
                command: "exit 1".to_string(),
                files: None,
                output: vec![],
                clean: CleanPolicy::False,
            }),
            dependencies: vec![],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });
        let consumer_id = graph.insert(ScriptNode {
            reference: ScriptReference::new(package_dir.clone(), "consumer".to_string()),
            config: ScriptConfig::OneShot(OneShotConfig {
                command: "true".to_string(),
                files: None,
                output: vec![],
                clean: CleanPolicy::False,
            }),
            dependencies: vec![DependencyEdge {
                target: dep_id,
                location: crate::diagnostics::Location::whole_file(
                    crate::path::AbsFilePath::assume(dir.path().join("package.json")).unwrap(),
                ),
            }],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });
        graph.add_reverse_dependency(dep_id, consumer_id);

        let executor = new_executor(graph, consumer_id);
        let result = executor.execute(consumer_id).await;
        assert!(matches!(result, Err(ExecutionError::DependencyFailed(_))));
    }
}
