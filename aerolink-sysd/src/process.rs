//! External command execution.
//!
//! Every place the daemon talks to an external tool (systemctl, apt, dpkg,
//! lsblk, stm32flash, ...) goes through this one abstraction: run an argv,
//! capture stdout and the exit code, optionally pipe a string to stdin.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Result of one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// True when the process exited with status 0.
    pub success: bool,
    /// Exit code, or -1 when terminated by a signal.
    pub exit_code: i32,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
}

/// Run a command and capture its output.
pub async fn run(args: &[&str]) -> Result<CommandOutput> {
    run_with_stdin(args, None).await
}

/// Run a command, optionally piping `input` to its stdin.
pub async fn run_with_stdin(args: &[&str], input: Option<&str>) -> Result<CommandOutput> {
    let (program, rest) = args
        .split_first()
        .context("empty command line")?;

    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .with_context(|| format!("failed to write stdin of {}", program))?;
            // Close stdin so the child sees EOF.
            drop(stdin);
        }
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {}", program))?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        debug!(
            program = %program,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "command stderr"
        );
    }

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code,
        stdout,
    })
}

/// Run a command for its side effect only; failures (including spawn
/// failures) collapse to `false`.
pub async fn run_quiet(args: &[&str]) -> bool {
    match run(args).await {
        Ok(output) => output.success,
        Err(e) => {
            debug!(error = %e, "command failed to run");
            false
        }
    }
}

/// Check whether an executable is reachable through PATH.
pub fn command_exists(name: &str) -> bool {
    let path = match std::env::var_os("PATH") {
        Some(p) => p,
        None => return false,
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name)))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
