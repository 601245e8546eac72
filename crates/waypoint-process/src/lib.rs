//! Package-driver process invocation for the executor (`spec.md` §4.7).
//!
//! Each package's driver (the external, per-package installer named in `spec.md` §1 as a
//! deliberately out-of-scope collaborator) is invoked as a child process with progress
//! captured and a hard timeout. The raw exit code is handed back to the caller, which
//! classifies it through the package's [`waypoint_types::ExitCodeMap`].

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Result of running a package driver with timeout bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverOutput {
    /// Raw exit code (or -1 when the process was killed for exceeding timeout).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Invoke a package driver with an optional hard timeout, capturing stdout/stderr.
///
/// `program`/`args` come from the package's install/repair/uninstall argument template
/// (`spec.md` §3, Exe variant); `working_dir` is the package's working folder under the
/// cache manager's scratch area.
pub fn run_driver(
    program: &str,
    args: &[&str],
    working_dir: &std::path::Path,
    timeout: Option<Duration>,
) -> Result<DriverOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn package driver: {program}"))?;

    let Some(timeout_dur) = timeout else {
        let status = child
            .wait()
            .with_context(|| format!("failed to wait on package driver: {program}"))?;
        return Ok(DriverOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: read_pipe(child.stdout.take()),
            stderr: read_pipe(child.stderr.take()),
            timed_out: false,
            duration: start.elapsed(),
        });
    };

    let deadline = Instant::now() + timeout_dur;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll package driver: {program}"))?
        {
            Some(status) => {
                return Ok(DriverOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\n{program} timed out after {}",
                        humantime::format_duration(timeout_dur)
                    ));

                    return Ok(DriverOutput {
                        exit_code: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }

                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Check whether a package driver binary is resolvable on `PATH`.
pub fn driver_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_driver_captures_exit_code_and_output() {
        let td = tempfile::tempdir().expect("tempdir");
        let out = run_driver("echo", &["installed"], td.path(), None).expect("run");
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("installed"));
        assert!(!out.timed_out);
    }

    #[test]
    fn run_driver_enforces_timeout() {
        let td = tempfile::tempdir().expect("tempdir");
        let out = run_driver("sleep", &["5"], td.path(), Some(Duration::from_millis(100)))
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn driver_exists_for_known_binary() {
        assert!(driver_exists("echo"));
    }

    #[test]
    fn driver_exists_false_for_unknown_binary() {
        assert!(!driver_exists("this-driver-does-not-exist-xyz123"));
    }
}
