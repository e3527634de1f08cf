//! Command execution utilities for scheduler tools.

use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

/// Error type for command execution.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to execute {command}: {error}")]
    Execution { command: String, error: String },
    #[error("Command {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Spawn `cmd` with stdin detached and wait for all of its output.
///
/// Remote-login tools read stdin when it is a terminal, so every scheduler
/// command gets `/dev/null` instead.
async fn output(cmd: &mut Command, name: &str) -> Result<std::process::Output, CommandError> {
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    tracing::trace!(command = name, "spawning");
    cmd.output().await.map_err(|e| CommandError::Execution {
        command: name.to_string(),
        error: e.to_string(),
    })
}

/// Execute a command and return stdout as a string.
///
/// This is a convenience wrapper that handles common error cases
/// and UTF-8 conversion for scheduler command output.
pub async fn run_command(cmd: &mut Command, name: &str) -> Result<String, CommandError> {
    let output = output(cmd, name).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandError::Failed {
            command: name.to_string(),
            stderr: stderr.to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Execute a command and return stdout, treating non-zero exit as OK.
///
/// Some commands (like bjobs with no jobs) return non-zero but are still valid.
pub async fn run_command_allow_failure(
    cmd: &mut Command,
    name: &str,
) -> Result<String, CommandError> {
    let output = output(cmd, name).await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Execute a command and return stdout, tolerating a non-zero exit only when
/// stdout has content.
///
/// Listing tools exit non-zero when some of the requested entries are gone
/// but still print the rest; a failing run with nothing on stdout means the
/// tool itself could not answer.
pub async fn run_command_listing(cmd: &mut Command, name: &str) -> Result<String, CommandError> {
    let output = output(cmd, name).await?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if !output.status.success() && stdout.trim().is_empty() {
        return Err(CommandError::Failed {
            command: name.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(stdout)
}

/// Execute a command and return stdout followed by stderr.
///
/// Submission tools print the job id on one stream and warnings on the other;
/// callers that parse an id want to see both.
pub async fn run_command_merged(cmd: &mut Command, name: &str) -> Result<String, CommandError> {
    let output = output(cmd, name).await?;
    if !output.status.success() {
        tracing::debug!(command = name, status = %output.status, "non-zero exit");
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}
