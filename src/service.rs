//! Service Execution: the per-script state machine layered on the
//! supervisor for scripts whose command runs indefinitely (`spec.md` §4.5).
//!
//! A service is never fingerprint-skipped or cache-restored; it starts
//! lazily on first consumer demand and stops once every expected consumer
//! has released it. The state machine is modeled as an explicit tagged
//! variant per `spec.md` §9 ("every ingress is a method whose body is a
//! single exhaustive match over the current state"), as a runtime-checked
//! enum because a service has more than two states and transitions happen
//! in response to external events, not just owned method calls.

use std::sync::{Arc, Mutex, Weak};

use derive_more::Display;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::once::OnceCompletion;
use crate::path::AbsDirPath;
use crate::script::ScriptReference;
use crate::supervisor::{self, ChildHandle, ExitResult, LifecycleState, OutputChunk};

/// Error taxonomy for a single script's execution attempt. Unifies
/// `spec.md` §7's *Execution* and *Dependency* error kinds; the *Invalid
/// config*, *Launch*, and *Graph* kinds surface earlier, as analyzer
/// diagnostics, and never reach this type.
#[derive(Clone, Debug, Display)]
pub enum ExecutionError {
    #[display("failed to spawn: {_0}")]
    SpawnError(String),
    #[display("exited with status {_0}")]
    ExitNonZero(i32),
    #[display("killed by signal {_0}")]
    Signal(String),
    #[display("terminated")]
    Terminated,
    /// A service's child exited on its own, without a termination request.
    #[display("service exited unexpectedly")]
    ServiceExitedUnexpectedly,
    /// An upstream service this execution depended on failed or was
    /// terminated out from under it.
    #[display("upstream service terminated unexpectedly")]
    ServiceTerminatedUnexpectedly,
    /// A dependency's own execution did not succeed.
    #[display("dependency failed: {_0}")]
    DependencyFailed(ScriptReference),
    /// An internal I/O or glob error outside the documented taxonomy
    /// (manifest-adjacent state read/write, cache corruption, malformed
    /// glob pattern). Wrapped here rather than propagated as a raw
    /// `color_eyre::Report` so every execution result stays a plain,
    /// serializable-shaped value.
    #[display("{_0}")]
    Io(String),
}

/// Something that wants to know when a service fails unexpectedly, so the
/// failure-mode policy can be applied (`spec.md` §4.4). Implemented by the
/// executor; held here as a [`Weak`] reference so a `ServiceExecution` never
/// keeps the executor alive (`spec.md` §9: avoid owning pointers that would
/// form a cycle).
pub trait FailureNotifier: Send + Sync {
    fn notify_failure(&self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
enum ServiceState {
    #[display("initial")]
    Initial,
    #[display("fingerprinting")]
    Fingerprinting,
    #[display("awaiting-first-consumer")]
    AwaitingFirstConsumer,
    #[display("starting")]
    Starting,
    #[display("started")]
    Started,
    #[display("stopping")]
    Stopping,
    #[display("stopped")]
    Stopped,
    #[display("failing")]
    Failing,
    #[display("failed")]
    Failed,
}

/// A running (or not-yet-running) service script.
///
/// The Executor resolves a service's dependencies and computes its
/// fingerprint the same way it does for a one-shot script (the shared
/// `initial`/`fingerprinting` machinery of `spec.md` §4.5 lives there, since
/// it is identical across execution variants); a `ServiceExecution` is
/// constructed already holding that result, so its own state machine begins
/// at `awaiting-first-consumer`.
pub struct ServiceExecution {
    reference: ScriptReference,
    command: String,
    package_dir: AbsDirPath,
    upstream: Vec<Arc<ServiceExecution>>,
    state: Mutex<ServiceState>,
    /// How many consumer handles this service expects to see
    /// acquired-then-settled over its lifetime, enumerated up front by the
    /// executor from the reverse-dependency graph (`spec.md` §4.5). Fixed at
    /// construction so a late-arriving consumer can never be mistaken for
    /// the last one.
    expected_consumers: usize,
    /// Number of `acquire()` calls made so far; only the first one starts
    /// the service.
    acquired: Mutex<usize>,
    /// Number of consumer handles settled so far, by either a real
    /// `release()` or a [`ServiceExecution::cancel_reservation`] call for a
    /// reservation that will never be acquired. The service stops once this
    /// reaches `expected_consumers`.
    settled: Mutex<usize>,
    child: Mutex<Option<ChildHandle>>,
    upstream_handles: Mutex<Vec<ConsumerHandle>>,
    output_tx: Mutex<Option<mpsc::UnboundedSender<OutputChunk>>>,
    /// When the service last reached `started`, for logging how long it ran.
    started_at: Mutex<Option<jiff::Timestamp>>,
    /// Resolves once the service has reached `started` or failed before
    /// getting there; consumers awaiting `acquire()` rendezvous on this.
    ready: OnceCompletion<Result<(), ExecutionError>>,
    /// Resolves once the service has fully terminated, successfully or not.
    done: OnceCompletion<Result<(), ExecutionError>>,
    failure_notifier: Weak<dyn FailureNotifier>,
}

impl ServiceExecution {
    pub fn new(
        reference: ScriptReference,
        command: String,
        package_dir: AbsDirPath,
        upstream: Vec<Arc<ServiceExecution>>,
        expected_consumers: usize,
        output_tx: mpsc::UnboundedSender<OutputChunk>,
        failure_notifier: Weak<dyn FailureNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reference,
            command,
            package_dir,
            upstream,
            state: Mutex::new(ServiceState::AwaitingFirstConsumer),
            expected_consumers: expected_consumers.max(1),
            acquired: Mutex::new(0),
            settled: Mutex::new(0),
            child: Mutex::new(None),
            upstream_handles: Mutex::new(Vec::new()),
            output_tx: Mutex::new(Some(output_tx)),
            started_at: Mutex::new(None),
            ready: OnceCompletion::new(),
            done: OnceCompletion::new(),
            failure_notifier,
        })
    }

    pub fn reference(&self) -> &ScriptReference {
        &self.reference
    }

    fn set_state(&self, state: ServiceState) {
        let mut current = self.state.lock().expect("service state mutex poisoned");
        info!(service = %self.reference, from = %*current, to = %state, "service state transition");
        *current = state;
    }

    fn state(&self) -> ServiceState {
        *self.state.lock().expect("service state mutex poisoned")
    }

    /// Log how long the service was up, if it ever reached `started`.
    fn log_uptime(&self) {
        let Some(started_at) = *self.started_at.lock().expect("service start-time mutex poisoned") else {
            return;
        };
        let uptime = jiff::Timestamp::now().since(started_at).unwrap_or_default();
        info!(service = %self.reference, %uptime, "service uptime");
    }

    /// Await the service's final result, once it has stopped.
    pub async fn done(&self) -> Result<(), ExecutionError> {
        self.done.wait().await
    }

    /// Acquire a consumer handle, starting the service if this is the first
    /// consumer ever to acquire it, and waiting for it to reach `started`
    /// (`spec.md` §4.5: "awaiting-first-consumer -> first acquire(consumer)
    /// -> starting"). Unlike starting, stopping does not key off this call:
    /// see [`ServiceExecution::release`].
    #[instrument(skip(self), fields(service = %self.reference))]
    pub async fn acquire(self: &Arc<Self>) -> Result<ConsumerHandle, ExecutionError> {
        let is_first = {
            let mut acquired = self.acquired.lock().expect("service acquired mutex poisoned");
            *acquired += 1;
            *acquired == 1
        };

        if is_first {
            self.start().await;
        }

        self.ready.wait().await?;
        Ok(ConsumerHandle {
            service: self.clone(),
        })
    }

    async fn start(self: &Arc<Self>) {
        self.set_state(ServiceState::Starting);

        let upstream_results = join_all(self.upstream.iter().map(|svc| {
            let svc = svc.clone();
            async move {
                let dependency = svc.reference().clone();
                svc.acquire().await.map_err(|_| dependency)
            }
        }))
        .await;

        let mut handles = Vec::with_capacity(upstream_results.len());
        for (result, upstream) in upstream_results.into_iter().zip(self.upstream.iter()) {
            match result {
                Ok(handle) => handles.push(handle),
                Err(_) => {
                    self.set_state(ServiceState::Failed);
                    let err = ExecutionError::DependencyFailed(upstream.reference().clone());
                    self.ready.resolve(Err(err.clone()));
                    self.done.resolve(Err(err));
                    return;
                }
            }
        }
        *self.upstream_handles.lock().expect("upstream handle mutex poisoned") = handles;

        let Some(output_tx) = self.output_tx.lock().expect("output sender mutex poisoned").take() else {
            unreachable!("start() runs at most once per service");
        };
        let child = supervisor::spawn(&self.command, &self.package_dir, output_tx).await;

        // The supervisor resolves `exit` synchronously, before returning the
        // handle, when the spawn syscall itself fails; `wait()` on an
        // already-stopped handle returns immediately.
        if child.state() == LifecycleState::Stopped {
            let message = match child.wait().await {
                ExitResult::SpawnError(message) => message,
                other => other.to_string(),
            };
            self.set_state(ServiceState::Failed);
            let err = ExecutionError::SpawnError(message);
            self.ready.resolve(Err(err.clone()));
            self.done.resolve(Err(err));
            self.release_upstream().await;
            return;
        }

        self.set_state(ServiceState::Started);
        *self.started_at.lock().expect("service start-time mutex poisoned") = Some(jiff::Timestamp::now());
        self.ready.resolve(Ok(()));

        let watch_self = self.clone();
        *self.child.lock().expect("child handle mutex poisoned") = Some(child);
        tokio::spawn(async move { watch_self.watch_child().await });

        // A consumer handle only protects against an upstream stopping
        // because *we* released it; it says nothing about an upstream
        // failing later on its own. Watch each upstream's terminal result so
        // that case still reaches `on_upstream_terminated` (`spec.md` §4.5:
        // "started -> upstream service terminated -> failing -> failed").
        for upstream in &self.upstream {
            let upstream = upstream.clone();
            let watch_self = self.clone();
            tokio::spawn(async move {
                if upstream.done().await.is_err() {
                    watch_self.on_upstream_terminated().await;
                }
            });
        }
    }

    /// Wait for the child to exit and react depending on whether that exit
    /// was requested (`stopping -> stopped`) or spontaneous
    /// (`started -> failing -> failed`), per `spec.md` §4.5.
    async fn watch_child(self: Arc<Self>) {
        let exit = {
            let child = self.child.lock().expect("child handle mutex poisoned");
            match child.as_ref() {
                Some(child) => child.wait(),
                None => return,
            }
        }
        .await;

        let was_stopping = self.state() == ServiceState::Stopping;
        match exit {
            ExitResult::Ok | ExitResult::Terminated if was_stopping => {
                self.set_state(ServiceState::Stopped);
                self.log_uptime();
                self.done.resolve(Ok(()));
            }
            _ => {
                self.set_state(ServiceState::Failing);
                warn!(service = %self.reference, ?exit, "service exited unexpectedly");
                self.failure_notifier.upgrade().inspect(|notifier| notifier.notify_failure());
                self.set_state(ServiceState::Failed);
                self.log_uptime();
                self.done.resolve(Err(ExecutionError::ServiceExitedUnexpectedly));
            }
        }
        self.release_upstream().await;
    }

    /// Release a consumer handle, stopping the service once every expected
    /// consumer has settled (`spec.md` §4.5: "started -> last consumer
    /// released -> stopping"). `expected_consumers` is fixed up front, so
    /// this only stops the service once every command-bearing consumer (and
    /// the entrypoint, if any) has actually released it — not the first
    /// time the live count transiently reaches zero, which could still
    /// happen while a sibling consumer is gated behind a slower dependency
    /// of its own and hasn't acquired yet.
    #[instrument(skip(self), fields(service = %self.reference))]
    async fn release(self: &Arc<Self>) {
        self.settle().await;
    }

    /// Settle a reservation that will never be acquired: called when the
    /// consumer that was counted for it fails before ever reaching this
    /// service (`spec.md` §4.5's consumer handles are "released when the
    /// consumer's execution completes, success or failure" — a consumer
    /// that fails even earlier, before acquiring, still needs to vacate its
    /// reserved slot). Also cascades: if settling this reservation completes
    /// a service that itself never started, its own upstream reservations
    /// are released in turn, since it will now never acquire them either.
    #[instrument(skip(self), fields(service = %self.reference))]
    pub async fn cancel_reservation(self: &Arc<Self>) {
        self.settle().await;
    }

    async fn settle(self: &Arc<Self>) {
        let all_settled = {
            let mut settled = self.settled.lock().expect("service settled mutex poisoned");
            *settled += 1;
            *settled >= self.expected_consumers
        };

        if !all_settled {
            return;
        }

        match self.state() {
            ServiceState::Started => {
                self.set_state(ServiceState::Stopping);
                if let Some(child) = self.child.lock().expect("child handle mutex poisoned").as_ref() {
                    child.terminate();
                }
            }
            ServiceState::Failed | ServiceState::Stopped => {
                // Already terminal; nothing to terminate.
            }
            ServiceState::AwaitingFirstConsumer => {
                // Every expected consumer settled without ever acquiring it:
                // it will never start. Its own upstream reservations (if
                // any) must be released too.
                self.set_state(ServiceState::Stopped);
                self.done.resolve(Ok(()));
                for upstream in self.upstream.clone() {
                    tokio::spawn(async move { upstream.cancel_reservation().await });
                }
            }
            other => {
                warn!(service = %self.reference, state = %other, "every expected consumer settled in an unexpected state");
            }
        }
    }

    /// Propagate termination from a failed upstream service (`spec.md`
    /// §4.5: "started -> upstream service terminated -> failing -> failed").
    #[instrument(skip(self), fields(service = %self.reference))]
    pub async fn on_upstream_terminated(self: &Arc<Self>) {
        if self.state() != ServiceState::Started {
            return;
        }
        self.set_state(ServiceState::Failing);
        if let Some(child) = self.child.lock().expect("child handle mutex poisoned").as_ref() {
            child.terminate();
        }
        self.set_state(ServiceState::Failed);
        self.done.resolve(Err(ExecutionError::ServiceTerminatedUnexpectedly));
        self.release_upstream().await;
    }

    async fn release_upstream(self: &Arc<Self>) {
        let handles = std::mem::take(&mut *self.upstream_handles.lock().expect("upstream handle mutex poisoned"));
        for handle in handles {
            handle.release().await;
        }
    }
}

/// A consumer's claim on a running service. Modeled as an explicit, async
/// `release()` rather than `Drop`: releasing a service consumer is itself
/// async (it may wait for the service's child to fully exit), and `Drop`
/// cannot `.await`.
pub struct ConsumerHandle {
    service: Arc<ServiceExecution>,
}

impl ConsumerHandle {
    pub fn service(&self) -> &Arc<ServiceExecution> {
        &self.service
    }

    pub async fn release(self) {
        self.service.release().await;
    }
}
