//! Child Process Supervisor: spawns a script's command via the platform
//! shell inside its own process group, and terminates the whole group on
//! request (`spec.md` §4.3).
//!
//! Process-group handling follows the same shape `nextest-rs/nextest` uses
//! in its unix test runner (`runner/unix.rs`): `std::process::Command`'s
//! `process_group(0)` puts the child in a fresh group headed by itself, and
//! termination sends a signal to the negated pid. Windows has no process
//! group signal primitive available to an ordinary process, so termination
//! there shells out to `taskkill /t /f` against the whole subtree, per
//! `spec.md` §4.3's explicit simpler-mechanism choice.

use std::process::Stdio;

use color_eyre::{Result, eyre::Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::host;
use crate::once::OnceCompletion;
use crate::path::AbsDirPath;

/// A categorized terminal outcome for a supervised child (`spec.md` §4.3's
/// `stopped` state payload).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitResult {
    Ok,
    ExitNonZero(i32),
    Signal(String),
    SpawnError(String),
    Terminated,
}

impl ExitResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitResult::Ok)
    }
}

impl std::fmt::Display for ExitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitResult::Ok => write!(f, "ok"),
            ExitResult::ExitNonZero(code) => write!(f, "exited with status {code}"),
            ExitResult::Signal(name) => write!(f, "killed by signal {name}"),
            ExitResult::SpawnError(message) => write!(f, "failed to spawn: {message}"),
            ExitResult::Terminated => write!(f, "terminated"),
        }
    }
}

/// A chunk of output from the child's stdout or stderr stream.
#[derive(Clone, Debug)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Lifecycle state of a supervised child (`spec.md` §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// A handle to a single spawned command.
///
/// Output is delivered over an mpsc channel rather than buffered in memory,
/// matching `spec.md` §5's "output chunks... appear in the order the child
/// produced them" while letting the caller decide whether to forward,
/// capture, or both.
#[derive(Clone)]
pub struct ChildHandle {
    state: std::sync::Arc<std::sync::Mutex<LifecycleState>>,
    exit: OnceCompletion<ExitResult>,
    pid: Option<u32>,
}

impl ChildHandle {
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("supervisor state mutex poisoned")
    }

    /// Await the child's terminal result.
    pub async fn wait(&self) -> ExitResult {
        self.exit.wait().await
    }

    /// Request termination of the child and its whole process tree.
    ///
    /// A handle is only ever returned once its spawn has resolved to either
    /// `started` or `stopped`, so there is no externally observable
    /// `starting` state for `terminate()` to race against (`spec.md` §4.3's
    /// deferred-termination case is handled internally by [`spawn`] instead,
    /// between the spawn syscall and returning the handle). Idempotent.
    #[instrument(skip(self), fields(pid = ?self.pid))]
    pub fn terminate(&self) {
        let mut state = self.state.lock().expect("supervisor state mutex poisoned");
        match *state {
            LifecycleState::Started => {
                *state = LifecycleState::Stopping;
                drop(state);
                if let Some(pid) = self.pid {
                    send_terminate_signal(pid);
                }
            }
            LifecycleState::Starting | LifecycleState::Stopping | LifecycleState::Stopped => {}
        }
    }
}

/// Spawn `command` as a shell invocation rooted at `package_dir`, in its own
/// process group, forwarding output chunks over `output_tx` as they arrive.
///
/// `PATH` is curated the way `spec.md` §4.3 prescribes: every
/// `node_modules/.bin` directory from `package_dir` upward to the
/// filesystem root is prepended, ahead of the inherited `PATH` with any
/// leading `.bin` entries of its own stripped (so a stale `.bin` a parent
/// shell already prepended doesn't shadow this package's own version).
#[instrument(skip(output_tx))]
pub async fn spawn(
    command: &str,
    package_dir: &AbsDirPath,
    output_tx: mpsc::UnboundedSender<OutputChunk>,
) -> ChildHandle {
    let state = std::sync::Arc::new(std::sync::Mutex::new(LifecycleState::Starting));
    let exit = OnceCompletion::new();

    let mut cmd = Command::new(host::shell_program());
    shell_args(&mut cmd, command);
    cmd.current_dir(package_dir.as_std_path());
    cmd.env("PATH", curated_path(package_dir));
    for var in POISONED_ENV_VARS {
        cmd.env_remove(var);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    new_process_group(&mut cmd);

    let spawned = cmd.spawn();

    let child = match spawned {
        Ok(child) => child,
        Err(err) => {
            *state.lock().expect("supervisor state mutex poisoned") = LifecycleState::Stopped;
            exit.resolve(ExitResult::SpawnError(err.to_string()));
            return ChildHandle {
                state,
                exit,
                pid: None,
            };
        }
    };

    let pid = child.id();
    *state.lock().expect("supervisor state mutex poisoned") = LifecycleState::Started;

    tokio::spawn(drive_child(child, state.clone(), exit.clone(), output_tx));

    ChildHandle { state, exit, pid }
}

/// Environment variables a package-manager runner is known to inject that
/// would lie about the current package if inherited unchanged by a child
/// spawned from a different package directory (`spec.md` §4.3).
const POISONED_ENV_VARS: &[&str] = &[
    "npm_package_json",
    "npm_lifecycle_event",
    "npm_lifecycle_script",
    "INIT_CWD",
];

fn curated_path(package_dir: &AbsDirPath) -> String {
    let mut entries = Vec::new();
    let mut dir = Some(package_dir.clone());
    while let Some(current) = dir {
        entries.push(
            current
                .as_std_path()
                .join("node_modules")
                .join(".bin")
                .to_string_lossy()
                .into_owned(),
        );
        let parent = current.as_std_path().parent();
        dir = parent.and_then(|p| AbsDirPath::assume(p.to_path_buf()).ok());
    }

    let inherited = std::env::var("PATH").unwrap_or_default();
    let stripped = std::env::split_paths(&inherited)
        .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(".bin"))
        .map(|p| p.to_string_lossy().into_owned());
    entries.extend(stripped);

    std::env::join_paths(entries)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(inherited)
}

#[cfg(not(target_os = "windows"))]
fn shell_args(cmd: &mut Command, command: &str) {
    cmd.arg("-c").arg(command);
}

#[cfg(target_os = "windows")]
fn shell_args(cmd: &mut Command, command: &str) {
    cmd.arg("/d").arg("/s").arg("/c").arg(command);
}

#[cfg(not(target_os = "windows"))]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(target_os = "windows")]
fn new_process_group(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(target_os = "windows"))]
fn send_terminate_signal(pid: u32) {
    // Negative pid targets the whole process group (`spec.md` §4.3).
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(target_os = "windows")]
fn send_terminate_signal(pid: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/t", "/f"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = status {
        warn!(?err, pid, "taskkill failed to run");
    }
}

async fn drive_child(
    mut child: Child,
    state: std::sync::Arc<std::sync::Mutex<LifecycleState>>,
    exit: OnceCompletion<ExitResult>,
    output_tx: mpsc::UnboundedSender<OutputChunk>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = stdout.map(|stdout| {
        let tx = output_tx.clone();
        tokio::spawn(forward_lines(stdout, tx, OutputChunk::Stdout as fn(String) -> OutputChunk))
    });
    let stderr_task = stderr.map(|stderr| {
        let tx = output_tx.clone();
        tokio::spawn(forward_lines(stderr, tx, OutputChunk::Stderr as fn(String) -> OutputChunk))
    });

    let wait_result = child.wait().await;

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let was_stopping = *state.lock().expect("supervisor state mutex poisoned") == LifecycleState::Stopping;
    *state.lock().expect("supervisor state mutex poisoned") = LifecycleState::Stopped;

    let result = match wait_result {
        Ok(status) if status.success() => ExitResult::Ok,
        Ok(status) => terminal_result_for_status(status, was_stopping),
        Err(err) => ExitResult::SpawnError(err.to_string()),
    };
    exit.resolve(result);
}

#[cfg(not(target_os = "windows"))]
fn terminal_result_for_status(status: std::process::ExitStatus, was_stopping: bool) -> ExitResult {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        if was_stopping {
            ExitResult::Terminated
        } else {
            ExitResult::Signal(signal_name(signal))
        }
    } else {
        ExitResult::ExitNonZero(status.code().unwrap_or(-1))
    }
}

#[cfg(target_os = "windows")]
fn terminal_result_for_status(status: std::process::ExitStatus, was_stopping: bool) -> ExitResult {
    if was_stopping {
        ExitResult::Terminated
    } else {
        ExitResult::ExitNonZero(status.code().unwrap_or(-1))
    }
}

#[cfg(not(target_os = "windows"))]
fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGHUP => "SIGHUP".to_string(),
        other => other.to_string(),
    }
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<OutputChunk>,
    wrap: fn(String) -> OutputChunk,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(wrap(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(?err, "error reading child output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn("echo hello", &package_dir, tx).await;
        let result = handle.wait().await;
        assert_eq!(result, ExitResult::Ok);

        let mut saw_hello = false;
        while let Ok(chunk) = rx.try_recv() {
            if let OutputChunk::Stdout(line) = chunk
                && line.contains("hello")
            {
                saw_hello = true;
            }
        }
        assert!(saw_hello);
    }

    #[tokio::test]
    async fn reports_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = spawn("exit 3", &package_dir, tx).await;
        let result = handle.wait().await;
        assert_eq!(result, ExitResult::ExitNonZero(3));
    }

    #[tokio::test]
    async fn repeated_waits_observe_the_same_result() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = spawn("true", &package_dir, tx).await;
        let first = handle.wait().await;
        let second = handle.wait().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn terminate_stops_a_long_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::assume(dir.path()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = spawn("sleep 30", &package_dir, tx).await;
        // Give the child a moment to actually reach `started`.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.terminate();
        let result = handle.wait().await;
        assert_eq!(result, ExitResult::Terminated);
    }
}
