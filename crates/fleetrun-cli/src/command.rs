//! External process job executor.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleetrun_core::{ErrorKind, JobError, JobExecutor};
use tokio::process::Command;

/// Lines of stderr kept in the error details of a failed run.
const STDERR_TAIL_LINES: usize = 20;

/// Runs a program to completion; a zero exit status is success.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    /// `command` is the program followed by its arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self) -> Result<(), JobError> {
        let Some((exe, args)) = self.command.split_first() else {
            return Err(JobError::validation("empty command"));
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|e| spawn_error(exe, e))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    JobError::external_tool(format!("{exe} timeout after {limit:?}"))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| JobError::wrap(ErrorKind::ExternalTool, format!("{exe} failed"), e))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match output.status.code() {
            Some(code) => format!("{exe} exited with status {code}"),
            None => format!("{exe} terminated by signal"),
        };
        let mut error =
            JobError::external_tool(message).with_context("command", self.command.join(" "));
        let tail = stderr_tail(&stderr, STDERR_TAIL_LINES);
        if !tail.is_empty() {
            error = error.with_details(tail);
        }
        Err(error)
    }
}

fn spawn_error(exe: &str, e: io::Error) -> JobError {
    match e.kind() {
        io::ErrorKind::NotFound => {
            JobError::wrap(ErrorKind::ExternalTool, format!("{exe} not found in PATH"), e)
        }
        io::ErrorKind::PermissionDenied => {
            JobError::wrap(ErrorKind::Filesystem, format!("permission denied running {exe}"), e)
        }
        _ => JobError::wrap(ErrorKind::ExternalTool, format!("failed to start {exe}"), e),
    }
}

/// Last `max_lines` non-empty lines of `stderr`.
fn stderr_tail(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
