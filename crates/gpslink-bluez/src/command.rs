//! Running host Bluetooth tools.
//!
//! `sdptool`, `rfcomm` and `bluetoothctl` can all hang when the adapter or
//! the remote misbehaves, so every invocation is bounded by a timeout and
//! the child is killed if the timeout fires.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

/// Default deadline for a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from running an external tool.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started (missing binary, permissions).
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program did not finish within its deadline and was killed.
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    /// The program ran but reported failure.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Captured result of a finished tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

/// One invocation of a host tool, optionally through `sudo -n`.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    sudo: bool,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sudo: false,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs through `sudo -n` (never prompts; fails instead).
    #[must_use]
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable command line, used in errors and logs.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            parts.push("sudo");
        }
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }

    /// Runs the tool and captures its output regardless of exit status.
    pub async fn output(&self) -> Result<ToolOutput, CommandError> {
        let mut command = if self.sudo {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(&self.program);
            command
        } else {
            Command::new(&self.program)
        };
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        trace!(command = %self.display(), timeout = ?self.timeout, "Running tool");

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(CommandError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(CommandError::TimedOut {
                    program: self.program.clone(),
                    timeout: self.timeout,
                })
            }
        };

        let result = ToolOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        debug!(
            command = %self.display(),
            success = result.success,
            "Tool finished"
        );
        Ok(result)
    }

    /// Runs the tool and fails unless it exits successfully.
    pub async fn run(&self) -> Result<ToolOutput, CommandError> {
        let output = self.output().await?;
        if output.success {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }
}
