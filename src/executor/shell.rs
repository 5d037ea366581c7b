//! The `shell_command` test type.
//!
//! The declared command is handed to `sh -c` with the test bed as the child's
//! working directory. The parent's own working directory is never touched, so
//! there is nothing to restore on any exit path.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{ExecutionOptions, ExecutionRecord, ExecutionState, TestHandler};
use crate::errors::{Result, SpecrunError};
use crate::spec::{Spec, EXITCODE_OUTPUT};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exit codes the shell reserves for "not executable" and "not found".
const SHELL_CANNOT_EXECUTE: i32 = 126;
const SHELL_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandHandler;

impl TestHandler for ShellCommandHandler {
    fn test_type(&self) -> &'static str {
        "shell_command"
    }

    fn execute(
        &self,
        spec: &mut Spec,
        workdir: &Path,
        options: &ExecutionOptions,
    ) -> Result<ExecutionRecord> {
        let command = spec
            .test
            .command
            .as_ref()
            .map(|c| c.to_shell_line())
            .ok_or_else(|| SpecrunError::MissingCommand {
                test_id: spec.id.clone(),
            })?;
        debug!(test_id = %spec.id, "attempting to execute command '{}'", command);

        let started = Instant::now();
        let mut state = ExecutionState::Pending;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| SpecrunError::Launch {
                test_id: spec.id.clone(),
                command: command.clone(),
                reason: e.to_string(),
            })?;
        debug!(test_id = %spec.id, from = ?state, "running");
        state = ExecutionState::Running;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let waited = wait_for(&mut child, options);
        let stdout = join_output(stdout);
        let stderr = join_output(stderr);

        let (status, interrupted) = waited.map_err(|e| SpecrunError::Launch {
            test_id: spec.id.clone(),
            command: command.clone(),
            reason: format!("lost track of child process: {e}"),
        })?;
        debug!(test_id = %spec.id, from = ?state, "finished");
        state = classify(status, interrupted);

        let exit_code = match state {
            ExecutionState::Completed { exit_code } => Some(exit_code),
            _ => None,
        };
        spec.test
            .record_execution(exit_code, stdout.clone(), stderr.clone());
        debug!("stdout: {}", stdout);
        debug!("stderr: {}", stderr);

        // a declared exit code makes 126/127 an ordinary result for the verifier
        let expects_exit_code = spec.outputs.contains_key(EXITCODE_OUTPUT);
        if let Some(code @ (SHELL_CANNOT_EXECUTE | SHELL_NOT_FOUND)) = exit_code {
            if expects_exit_code {
                debug!(test_id = %spec.id, code, "exit code declared, not a launch failure");
            } else {
                return Err(SpecrunError::Launch {
                    test_id: spec.id.clone(),
                    command,
                    reason: format!("shell exit {code}: {}", stderr.trim()),
                });
            }
        }

        Ok(ExecutionRecord {
            command,
            state,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Polls the child until it exits, the deadline passes, or the run is cancelled.
/// Returns the exit status and whether the child was killed by us.
fn wait_for(
    child: &mut Child,
    options: &ExecutionOptions,
) -> std::io::Result<(ExitStatus, Option<String>)> {
    let deadline = options.timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, None));
        }
        let reason = if options.cancel.is_cancelled() {
            Some("cancelled".to_string())
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some(format!(
                "timed out after {:?}",
                options.timeout.unwrap_or_default()
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            kill_tree(child);
            let status = child.wait()?;
            return Ok((status, Some(reason)));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn classify(status: ExitStatus, interrupted: Option<String>) -> ExecutionState {
    if let Some(reason) = interrupted {
        return ExecutionState::Crashed { reason };
    }
    match status.code() {
        Some(exit_code) => ExecutionState::Completed { exit_code },
        None => ExecutionState::Crashed {
            reason: signal_reason(&status),
        },
    }
}

/// Runs the shell in its own process group so a kill reaches its children too.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: plain syscall on the process group we created for this child.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn signal_reason(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {sig}"),
        None => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_reason(_status: &ExitStatus) -> String {
    "terminated abnormally".to_string()
}
