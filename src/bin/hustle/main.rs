//! The binary entrypoint for `hustle`.
//!
//! Validates the package-manager lifecycle environment (`spec.md` §6),
//! resolves the requested script into a graph via [`hustle::analyzer`], and
//! either runs it once or hands it to [`hustle::watcher::Watcher`] for
//! repeated re-execution. Diagnostics and execution failures are rendered
//! here; the library itself never touches a terminal.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::util::SubscriberInitExt;

use hustle::analyzer::{self, Outcome};
use hustle::cache::{AnyCacheBackend, LocalBackend};
use hustle::config::{CacheMode, Config, FailureMode, LifecycleEnv};
use hustle::diagnostics::{self, Diagnostic};
use hustle::executor::{ExecutionResult, Executor, ExecutorConfig};
use hustle::path::{AbsDirPath, AbsFilePath};
use hustle::script::ScriptReference;
use hustle::supervisor::OutputChunk;
use hustle::watcher::{IterationOutcome, Watcher, WatcherConfig};

mod log;

#[derive(Parser, Debug)]
#[command(
    name = "hustle",
    about = "An incremental script runner with content-addressed fingerprinting",
    version = env!("HUSTLE_VERSION")
)]
struct Cli {
    /// Name of the script to resolve and run (`spec.md` §6: "first
    /// positional is the script name").
    script: String,

    /// Re-run affected scripts when a watched file changes, instead of
    /// exiting after one run.
    #[arg(short, long)]
    watch: bool,

    /// What to do with not-yet-started and in-flight scripts after a
    /// failure.
    #[arg(long, value_enum, default_value_t = FailureMode::Continue)]
    failure_mode: FailureMode,

    /// Number of one-shot scripts allowed to run concurrently. Defaults to a
    /// platform heuristic when unset.
    #[arg(long, env = "HUSTLE_PARALLELISM")]
    parallelism: Option<usize>,

    /// Which cache backend to restore and store cacheable outputs with.
    #[arg(long, value_enum, default_value_t = CacheMode::Local, env = "HUSTLE_CACHE")]
    cache: CacheMode,

    /// Overrides the local cache backend's root directory.
    #[arg(long, env = "HUSTLE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// When to colorize diagnostic and log output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let logger = log::make_logger(std::io::stderr, cli.color)?;
    logger.init();

    let lifecycle = LifecycleEnv::from_env().context("validate launch environment")?;
    if lifecycle.script_name != cli.script {
        tracing::warn!(
            cli_script = %cli.script,
            env_script = %lifecycle.script_name,
            "script name argument does not match the lifecycle environment's script name"
        );
    }

    let package_json = AbsFilePath::assume(lifecycle.package_json.clone())
        .context("HUSTLE_PACKAGE_JSON must be an absolute path")?;
    let root_package_dir = package_json.parent_dir();

    let cache = build_cache(cli.cache, cli.cache_dir.clone()).await?;
    let parallelism = cli
        .parallelism
        .unwrap_or_else(|| Config::parallelism_from_env_or(num_cpus::get));

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_output(output_rx, root_package_dir.clone()));

    let exit_code = if cli.watch {
        run_watch(
            root_package_dir,
            cli.script,
            cli.failure_mode,
            cache,
            parallelism,
            output_tx,
        )
        .await?
    } else {
        run_once(
            root_package_dir,
            cli.script,
            cli.failure_mode,
            cache,
            parallelism,
            output_tx,
        )
        .await?
    };

    printer.await.context("join output printer task")?;
    Ok(exit_code)
}

/// Build the configured cache backend (`spec.md` §6's `--cache`).
async fn build_cache(mode: CacheMode, cache_dir: Option<PathBuf>) -> Result<AnyCacheBackend> {
    match mode {
        CacheMode::None => Ok(AnyCacheBackend::None),
        CacheMode::Local => {
            let backend = match cache_dir {
                Some(dir) => LocalBackend::open(dir)?,
                None => LocalBackend::open_default().await?,
            };
            Ok(AnyCacheBackend::Local(backend))
        }
    }
}

/// Analyze and run `script` once, aborting in-flight children on an external
/// abort signal (`spec.md` §5).
async fn run_once(
    root_package_dir: AbsDirPath,
    script: String,
    failure_mode: FailureMode,
    cache: AnyCacheBackend,
    parallelism: usize,
    output_tx: mpsc::UnboundedSender<(ScriptReference, OutputChunk)>,
) -> Result<ExitCode> {
    match analyzer::analyze(root_package_dir.clone(), script)
        .await
        .context("analyze script graph")?
    {
        Outcome::Diagnostics(diagnostics) => {
            render_diagnostics(&diagnostics, &root_package_dir).await;
            Ok(ExitCode::FAILURE)
        }
        Outcome::Resolved(analysis) => {
            let executor = Executor::new(
                analysis.graph,
                analysis.root,
                ExecutorConfig::builder()
                    .failure_mode(failure_mode)
                    .cache(cache)
                    .parallelism(parallelism)
                    .output_tx(output_tx)
                    .build(),
            );

            let abort_executor = executor.clone();
            let abort_task = tokio::spawn(async move {
                wait_for_abort_signal().await;
                abort_executor.abort();
            });

            let result = executor.execute_top_level().await;
            abort_task.abort();
            Ok(render_top_level_result(result))
        }
    }
}

/// Run the watch loop (`spec.md` §4.6) until an external abort signal.
async fn run_watch(
    root_package_dir: AbsDirPath,
    entry_script: String,
    failure_mode: FailureMode,
    cache: AnyCacheBackend,
    parallelism: usize,
    output_tx: mpsc::UnboundedSender<(ScriptReference, OutputChunk)>,
) -> Result<ExitCode> {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let watcher = Watcher::new(WatcherConfig {
        root_package_dir: root_package_dir.clone(),
        entry_script,
        failure_mode,
        cache,
        parallelism,
        output_tx,
        outcome_tx,
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let watch_task = tokio::spawn(watcher.run(shutdown_rx));

    let outcome_printer = tokio::spawn({
        let root_package_dir = root_package_dir.clone();
        async move {
            while let Some(outcome) = outcome_rx.recv().await {
                match outcome {
                    IterationOutcome::Diagnostics(diagnostics) => {
                        render_diagnostics(&diagnostics, &root_package_dir).await;
                    }
                    IterationOutcome::Completed(result) => {
                        render_top_level_result(result);
                    }
                }
            }
        }
    });

    wait_for_abort_signal().await;
    let _ = shutdown_tx.send(());
    watch_task.await.context("join watcher task")??;
    outcome_printer.await.context("join outcome printer task")?;

    Ok(ExitCode::SUCCESS)
}

/// Wait for whichever external abort signal the platform offers
/// (`spec.md` §5: "external signal" aborts in-flight children). On Unix this
/// also catches `SIGTERM`, since process supervisors and CI runners
/// terminate a child's process group that way rather than with `SIGINT`.
#[cfg(unix)]
async fn wait_for_abort_signal() {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            tracing::warn!(%err, "failed to install signal handler, falling back to Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut signals = signals.fuse();
    signals.next().await;
}

#[cfg(not(unix))]
async fn wait_for_abort_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Forward every child process's output chunks to the terminal, tagged with
/// the script that produced them.
async fn print_output(
    mut rx: mpsc::UnboundedReceiver<(ScriptReference, OutputChunk)>,
    root_package_dir: AbsDirPath,
) {
    while let Some((reference, chunk)) = rx.recv().await {
        let label = reference.label(&root_package_dir);
        match chunk {
            OutputChunk::Stdout(line) => println!("[{label}] {line}"),
            OutputChunk::Stderr(line) => eprintln!("[{label}] {line}"),
        }
    }
}

/// Render every diagnostic in a batch, re-reading each one's source file
/// fresh (the Analyzer's manifest cache does not outlive the analysis).
async fn render_diagnostics(diagnostics: &[Diagnostic], cwd: &AbsDirPath) {
    for diagnostic in diagnostics {
        let primary_source = tokio::fs::read_to_string(diagnostic.primary.file.as_std_path())
            .await
            .unwrap_or_default();

        let mut supplemental_sources = Vec::with_capacity(diagnostic.supplemental.len());
        for (_, location) in &diagnostic.supplemental {
            supplemental_sources.push(
                tokio::fs::read_to_string(location.file.as_std_path())
                    .await
                    .unwrap_or_default(),
            );
        }
        let supplemental_refs: Vec<&str> =
            supplemental_sources.iter().map(String::as_str).collect();

        eprintln!(
            "{}",
            diagnostics::render_diagnostic(diagnostic, cwd, &primary_source, &supplemental_refs)
        );
    }
}

/// Log a single execution's outcome and translate it into an exit code
/// (`spec.md` §6: "0 on success; 1 on any reported failure").
fn render_top_level_result(result: ExecutionResult) -> ExitCode {
    match result {
        Ok(outcome) => {
            tracing::info!(kind = %outcome.kind, "run complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("hustle: {err}");
            ExitCode::FAILURE
        }
    }
}
