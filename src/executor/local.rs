// Local command execution without SSH

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{ChunkSink, CommandResult, Connection};
use crate::output::errors::OpsError;

/// Local connection for executing commands on the console host
pub struct LocalConnection {
    host_name: String,
    env: Vec<(String, String)>,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
            env: Vec::new(),
        }
    }

    /// Set an environment variable for every command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

fn spawn_error(e: std::io::Error) -> OpsError {
    OpsError::Runtime {
        message: format!("Failed to execute local command: {}", e),
        suggestion: Some("Check that 'sh' is available on the system".to_string()),
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, OpsError> {
        let output = self.command(cmd).output().await.map_err(spawn_error)?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        on_stdout: ChunkSink,
        on_stderr: ChunkSink,
    ) -> Result<CommandResult, OpsError> {
        let mut child = self
            .command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let stdout_handle = child
            .stdout
            .take()
            .ok_or_else(|| OpsError::runtime("Failed to capture stdout"))?;
        let stderr_handle = child
            .stderr
            .take()
            .ok_or_else(|| OpsError::runtime("Failed to capture stderr"))?;

        let stdout_task = tokio::spawn(forward_lines(stdout_handle, on_stdout));
        let stderr_task = tokio::spawn(forward_lines(stderr_handle, on_stderr));

        let status = child
            .wait()
            .await
            .map_err(|e| OpsError::runtime(format!("Failed to wait for command: {}", e)))?;

        stdout_task
            .await
            .map_err(|e| OpsError::runtime(format!("Failed to read stdout: {}", e)))?;
        stderr_task
            .await
            .map_err(|e| OpsError::runtime(format!("Failed to read stderr: {}", e)))?;

        Ok(CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: status.code().unwrap_or(-1),
        })
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

/// Forward raw lines until EOF. Bytes are passed through undecoded, so
/// output that is not UTF-8 never ends the read early.
async fn forward_lines<R>(handle: R, callback: ChunkSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(handle);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => callback(&line),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "output pipe closed");
                break;
            }
        }
    }
}
