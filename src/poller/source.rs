//! Credential sources — where the poller gets the current credential from.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{RelayError, Result};

/// Anything that can hand back the current raw credential.
///
/// Failures are treated as transient by the poller.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Runs a shell command and takes its trimmed stdout as the credential.
pub struct CommandSource {
    command: String,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl CredentialSource for CommandSource {
    async fn fetch(&self) -> Result<String> {
        tracing::debug!(command = %self.command, "Fetching credential from command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                RelayError::CredentialSource(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| RelayError::CredentialSource(format!("failed to spawn command: {}", e)))?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            return Err(RelayError::CredentialSource(format!(
                "command failed with return code {}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let credential = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if credential.is_empty() {
            return Err(RelayError::CredentialSource(
                "command produced no output".into(),
            ));
        }

        tracing::debug!(length = credential.len(), "Fetched credential");
        Ok(credential)
    }
}
