#![forbid(unsafe_code)]

use crate::command::ProvisionCommand;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_POLL: Duration = Duration::from_millis(250);
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("output capture {path}: {source}")]
    Capture {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish before the deadline")]
    DeadlineExceeded { program: String, output: String },
    #[error("{program} was stopped for shutdown")]
    Cancelled { program: String, output: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    /// Exit code, or `signal` when the process was killed.
    pub exit: String,
    /// Interleaved stdout and stderr.
    pub output: String,
}

pub struct ExecRequest<'a> {
    pub command: &'a ProvisionCommand,
    pub log_path: &'a Path,
    pub deadline: Option<Instant>,
    /// Once set, the running command is terminated like an expired deadline.
    pub cancel: Option<&'a AtomicBool>,
}

impl ExecRequest<'_> {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    }
}

/// Runs one command to completion. Implementations must honor `deadline` and `cancel`.
pub trait CommandExecutor: Send + Sync {
    fn run(&self, request: ExecRequest<'_>) -> Result<ExecOutput, ExecError>;
}

/// Spawns real processes with stdout and stderr sharing one log file.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    pub poll: Duration,
    pub term_grace: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            poll: DEFAULT_POLL,
            term_grace: DEFAULT_TERM_GRACE,
        }
    }
}

impl CommandExecutor for ProcessExecutor {
    fn run(&self, request: ExecRequest<'_>) -> Result<ExecOutput, ExecError> {
        let command = request.command;
        let log_path = request.log_path;
        let capture_err = |source: std::io::Error| ExecError::Capture {
            path: log_path.display().to_string(),
            source,
        };

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(capture_err)?;
        }
        let stdout_file = File::create(log_path).map_err(capture_err)?;
        let stderr_file = stdout_file.try_clone().map_err(capture_err)?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        debug!(program = %command.program, pid = child.id(), log = %log_path.display(), "spawned");

        let mut exit_status: Option<ExitStatus> = None;
        let mut stopped = None;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    break;
                }
                Ok(None) => {}
                Err(err) => warn!(program = %command.program, error = %err, "try_wait failed"),
            }
            if request.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                stopped = Some(Stop::Deadline);
            } else if request.cancelled() {
                stopped = Some(Stop::Cancelled);
            }
            if stopped.is_some() {
                terminate(&mut child, self.term_grace, self.poll);
                break;
            }
            sleep(self.poll);
        }

        if exit_status.is_none() && stopped.is_none() {
            exit_status = child.wait().ok();
        }

        let output = read_log(log_path).map_err(capture_err)?;
        let program = command.program.clone();
        match stopped {
            Some(Stop::Deadline) => return Err(ExecError::DeadlineExceeded { program, output }),
            Some(Stop::Cancelled) => return Err(ExecError::Cancelled { program, output }),
            None => {}
        }

        let success = exit_status.is_some_and(|status| status.success());
        Ok(ExecOutput {
            success,
            exit: exit_status
                .as_ref()
                .map(format_exit_status)
                .unwrap_or_else(|| "unknown".to_string()),
            output,
        })
    }
}

enum Stop {
    Deadline,
    Cancelled,
}

/// SIGTERM to the whole process group, then SIGKILL once the grace period runs out.
fn terminate(child: &mut Child, grace: Duration, poll: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(pid, error = %err, "SIGTERM failed");
            }
            let grace_until = Instant::now() + grace;
            while Instant::now() < grace_until {
                if let Ok(Some(_)) = child.try_wait() {
                    return;
                }
                sleep(poll);
            }
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (grace, poll);
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn read_log(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn format_exit_status(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Last `max_chars` characters, for error messages and lease failure reasons.
pub fn output_tail(output: &str, max_chars: usize) -> String {
    let trimmed = output.trim();
    let total = trimmed.chars().count();
    if total <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(total - max_chars).collect();
    format!("…{tail}")
}

pub fn attempt_log_path(work_dir: &Path, index: usize, region: &str) -> PathBuf {
    work_dir.join(format!("attempt-{index}-{region}.log"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("{prefix}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn sh(script: &str) -> ProvisionCommand {
        ProvisionCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn fast() -> ProcessExecutor {
        ProcessExecutor {
            poll: Duration::from_millis(20),
            term_grace: Duration::from_millis(500),
        }
    }

    #[test]
    fn captures_stdout_and_stderr_together() {
        let dir = temp_dir("dkcm_exec_capture");
        let log = dir.join("out.log");
        let cmd = sh("echo first; echo second 1>&2; exit 3");
        let out = fast()
            .run(ExecRequest {
                command: &cmd,
                log_path: &log,
                deadline: None,
                cancel: None,
            })
            .expect("run");
        assert!(!out.success);
        assert_eq!(out.exit, "3");
        assert!(out.output.contains("first"));
        assert!(out.output.contains("second"));
        assert_eq!(std::fs::read_to_string(&log).expect("log"), out.output);
    }

    #[test]
    fn deadline_terminates_the_process() {
        let dir = temp_dir("dkcm_exec_deadline");
        let cmd = sh("echo started; sleep 30");
        let started = Instant::now();
        let err = fast()
            .run(ExecRequest {
                command: &cmd,
                log_path: &dir.join("out.log"),
                deadline: Some(Instant::now() + Duration::from_millis(300)),
                cancel: None,
            })
            .expect_err("must time out");
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ExecError::DeadlineExceeded { output, .. } => assert!(output.contains("started")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cancel_flag_stops_the_process_group() {
        let dir = temp_dir("dkcm_exec_cancel");
        let cmd = sh("echo started; sleep 30 & wait");
        let cancel = std::sync::Arc::new(AtomicBool::new(false));
        let setter = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                sleep(Duration::from_millis(300));
                cancel.store(true, Ordering::Relaxed);
            })
        };

        let started = Instant::now();
        let err = fast()
            .run(ExecRequest {
                command: &cmd,
                log_path: &dir.join("out.log"),
                deadline: None,
                cancel: Some(&cancel),
            })
            .expect_err("must be cancelled");
        setter.join().expect("setter");
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ExecError::Cancelled { output, .. } => assert!(output.contains("started")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = temp_dir("dkcm_exec_missing");
        let cmd = ProvisionCommand {
            program: "/definitely/not/here/kubetest2".to_string(),
            args: Vec::new(),
        };
        let err = fast()
            .run(ExecRequest {
                command: &cmd,
                log_path: &dir.join("out.log"),
                deadline: None,
                cancel: None,
            })
            .expect_err("spawn must fail");
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn output_tail_keeps_the_end() {
        assert_eq!(output_tail("  short  ", 10), "short");
        assert_eq!(output_tail("abcdefghij", 4), "…ghij");
    }
}
