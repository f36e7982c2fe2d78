//! Process management - Running runtime CLI invocations with a hard timeout

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::error::RuntimeError;

/// Captured result of a finished invocation
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands, killing them once the timeout expires
#[derive(Debug, Clone)]
pub struct CommandRunner {
    default_timeout: Duration,
}

impl CommandRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run with the default timeout, failing on a non-zero exit code
    pub async fn run(&self, program: &Path, args: &[OsString]) -> Result<ProcessOutput, RuntimeError> {
        self.run_with_timeout(program, args, self.default_timeout).await
    }

    /// Run with an explicit timeout, failing on a non-zero exit code
    pub async fn run_with_timeout(
        &self,
        program: &Path,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<ProcessOutput, RuntimeError> {
        let command = describe(program, args);
        let output = self.output(program, args, timeout).await?;

        if output.success() {
            Ok(output)
        } else {
            Err(RuntimeError::Failed {
                command,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Run and return whatever the process produced, regardless of exit code
    pub async fn output(
        &self,
        program: &Path,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<ProcessOutput, RuntimeError> {
        let command = describe(program, args);
        debug!("Running `{}`", command);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(RuntimeError::Io(e)),
            Err(_) => {
                warn!("`{}` timed out after {:?}, killed", command, timeout);
                Err(RuntimeError::Timeout {
                    command,
                    secs: timeout.as_secs(),
                })
            }
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Build an argument vector from string slices
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

fn describe(program: &Path, args: &[OsString]) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    let mut parts = vec![name];
    parts.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}
