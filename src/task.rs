//! Runs build commands as subprocesses.
//! Unaware of the build graph; just command execution.

use anyhow::Context;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

/// The result of executing one build command.
pub struct TaskResult {
    pub success: bool,
    /// Captured stdout.  Compiler diagnostics arrive on stderr, which is
    /// inherited so they reach the terminal unmodified.
    pub output: Vec<u8>,
    pub spend_ms: u128,
}

/// Execute `cmdline` via the shell in `cwd`, waiting for completion.
/// Returns Err only when the process could not be spawned at all.
pub fn run_command(cwd: &Path, cmdline: &str) -> anyhow::Result<TaskResult> {
    let start = Instant::now();
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmdline)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("spawn \"{}\"", cmdline))?;
    Ok(TaskResult {
        success: output.status.success(),
        output: output.stdout,
        spend_ms: start.elapsed().as_millis(),
    })
}

/// Abort the whole build: compiler failures are not recoverable, so take
/// down every in-flight subprocess in our process group and exit.
pub fn fatal_abort() -> ! {
    unsafe {
        libc::kill(0, libc::SIGKILL);
    }
    std::process::exit(2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_command(dir.path(), "pwd").unwrap();
        assert!(result.success);
        let out = String::from_utf8(result.output).unwrap();
        assert_eq!(
            std::fs::canonicalize(out.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[test]
    fn reports_failure_status() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_command(dir.path(), "exit 3").unwrap();
        assert!(!result.success);
    }
}
