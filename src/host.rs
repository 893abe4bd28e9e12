//! Host identification for fingerprint computation.
//!
//! A fingerprint embeds the platform name, architecture, and interpreter
//! version (see `spec.md` §3) so that a cache entry built on one host is
//! never treated as fresh on an incompatible one. Detection here favors
//! returning a degraded-but-stable value over failing outright: if we can't
//! determine an interpreter version we fall back to a fixed sentinel rather
//! than erroring the whole fingerprint computation, since being unable to
//! identify the shell should invalidate caching (fail closed on matching,
//! not fail the run).

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// The OS name used as a fingerprint field, e.g. `"linux"`, `"macos"`, `"windows"`.
pub fn platform_name() -> &'static str {
    std::env::consts::OS
}

/// The CPU architecture used as a fingerprint field, e.g. `"x86_64"`, `"aarch64"`.
pub fn architecture() -> &'static str {
    std::env::consts::ARCH
}

/// The command used to invoke scripts via a shell on this platform.
#[cfg(not(target_os = "windows"))]
pub fn shell_program() -> &'static str {
    "/bin/sh"
}

#[cfg(target_os = "windows")]
pub fn shell_program() -> &'static str {
    "cmd.exe"
}

/// Best-effort version string for the shell interpreter scripts run under.
///
/// Runs the shell's own version/help flag and takes the first line of
/// output; if that fails for any reason (missing shell, odd sandboxing)
/// returns `"unknown"` rather than propagating an error, since an
/// unidentifiable interpreter should simply never compare equal to a
/// previous run's fingerprint.
pub async fn interpreter_version() -> String {
    #[cfg(not(target_os = "windows"))]
    let (program, args): (&str, &[&str]) = (shell_program(), &["-c", "$0 --version"]);
    #[cfg(target_os = "windows")]
    let (program, args): (&str, &[&str]) = (shell_program(), &["/c", "ver"]);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| {
                debug!("shell produced no version output, using unknown");
                "unknown".to_owned()
            }),
        Err(err) => {
            debug!(?err, "failed to query interpreter version, using unknown");
            "unknown".to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_and_arch_are_nonempty() {
        assert!(!platform_name().is_empty());
        assert!(!architecture().is_empty());
    }
}
