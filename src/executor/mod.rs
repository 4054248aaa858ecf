// Remote execution adapter: runs playbooks and commands against hosts

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::inventory::Host;
use crate::output::errors::OpsError;
use crate::tasks::OutputSink;

pub mod local;
pub mod runner;
pub mod ssh;

pub use local::LocalConnection;
pub use runner::AutomationRunner;
pub use ssh::{CommandResult, ConnectionPool, SshConnection};

/// Receives raw output bytes as they arrive; chunk boundaries are arbitrary
/// and may split a multi-byte character
pub type ChunkSink = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Common trait for all connection types (SSH, local)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a command and return the result
    async fn exec(&self, cmd: &str) -> Result<CommandResult, OpsError>;

    /// Execute a command with streaming output callbacks.
    ///
    /// Output is delivered only through the callbacks; the returned
    /// result carries the exit code.
    async fn exec_streaming(
        &self,
        cmd: &str,
        on_stdout: ChunkSink,
        on_stderr: ChunkSink,
    ) -> Result<CommandResult, OpsError>;

    /// Get the host name for this connection
    fn host_name(&self) -> &str;
}

/// Credentials for privileged remote actions
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub private_key: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

/// What to execute
#[derive(Debug, Clone)]
pub enum Payload {
    /// Run a playbook with the automation tool against a rendered inventory
    Playbook {
        playbook: PathBuf,
        inventory: PathBuf,
        config: Option<PathBuf>,
        extra_vars: BTreeMap<String, String>,
        limit: Option<String>,
    },
    /// A shell command run on each host
    Command(String),
    /// An inline script run on each host
    Script(String),
}

impl Payload {
    /// Short description used in logs and error messages
    pub fn describe(&self) -> String {
        match self {
            Payload::Playbook { playbook, .. } => playbook
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| playbook.display().to_string()),
            Payload::Command(cmd) => {
                let first = cmd.lines().next().unwrap_or_default();
                if first.len() > 60 {
                    format!("{}...", &first[..first.floor_char_boundary_compat(57)])
                } else {
                    first.to_string()
                }
            }
            Payload::Script(_) => "inline script".to_string(),
        }
    }
}

trait FloorCharBoundary {
    fn floor_char_boundary_compat(&self, index: usize) -> usize;
}

impl FloorCharBoundary for str {
    fn floor_char_boundary_compat(&self, index: usize) -> usize {
        let mut index = index.min(self.len());
        while !self.is_char_boundary(index) {
            index -= 1;
        }
        index
    }
}

/// A unit of remote work
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub hosts: Vec<Host>,
    pub payload: Payload,
    pub credentials: Credentials,
}

/// Terminal status of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Host whose command failed, for per-host payloads
    pub host: Option<String>,
}

impl RunOutcome {
    pub fn success() -> Self {
        RunOutcome {
            exit_code: 0,
            host: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into an error naming `what` ran
    pub fn into_result(self, what: impl Into<String>) -> Result<(), OpsError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(OpsError::RemoteExit {
                host: self.host,
                command: what.into(),
                exit_code: self.exit_code,
            })
        }
    }
}

/// Launches remote work and streams its output
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Run `request`, forwarding output chunks to `output` in order
    async fn run(&self, request: RunRequest, output: OutputSink) -> Result<RunOutcome, OpsError>;

    /// Check that `host` is reachable with `credentials`
    async fn probe(&self, _host: &Host, _credentials: &Credentials) -> Result<(), OpsError> {
        Ok(())
    }
}

/// Re-chunks a byte stream into `[host] line` records.
///
/// Bytes are buffered until a newline so a character split across two
/// chunks is decoded whole; invalid sequences become U+FFFD.
pub(crate) struct HostLines {
    host: String,
    pending: Mutex<Vec<u8>>,
    sink: OutputSink,
}

impl HostLines {
    pub(crate) fn new(host: impl Into<String>, sink: OutputSink) -> Arc<Self> {
        Arc::new(HostLines {
            host: host.into(),
            pending: Mutex::new(Vec::new()),
            sink,
        })
    }

    pub(crate) fn push(&self, chunk: &[u8]) {
        let mut pending = self.pending.lock();
        pending.extend_from_slice(chunk);
        while let Some(idx) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=idx).collect();
            (self.sink)(format!("[{}] {}", self.host, String::from_utf8_lossy(&line)));
        }
    }

    pub(crate) fn flush(&self) {
        let rest = std::mem::take(&mut *self.pending.lock());
        if !rest.is_empty() {
            (self.sink)(format!("[{}] {}\n", self.host, String::from_utf8_lossy(&rest)));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner for exercising operations without real hosts

    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRun {
        pub hosts: Vec<String>,
        pub payload: Payload,
    }

    #[derive(Default)]
    pub(crate) struct FakeRunner {
        pub lines: Vec<String>,
        pub exit_code: i32,
        pub delay: Option<Duration>,
        pub fail_probe: Option<String>,
        pub calls: Mutex<Vec<RecordedRun>>,
    }

    impl FakeRunner {
        pub fn ok() -> Self {
            FakeRunner {
                lines: vec!["PLAY RECAP ok=1 changed=1\n".to_string()],
                ..Default::default()
            }
        }

        pub fn exiting(code: i32) -> Self {
            FakeRunner {
                lines: vec!["fatal: task failed\n".to_string()],
                exit_code: code,
                ..Default::default()
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> Vec<RecordedRun> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteRunner for FakeRunner {
        async fn run(&self, request: RunRequest, output: OutputSink) -> Result<RunOutcome, OpsError> {
            self.calls.lock().push(RecordedRun {
                hosts: request.hosts.iter().map(|h| h.name.clone()).collect(),
                payload: request.payload.clone(),
            });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            for line in &self.lines {
                output(line.clone());
            }

            Ok(RunOutcome {
                exit_code: self.exit_code,
                host: request.hosts.first().map(|h| h.name.clone()),
            })
        }

        async fn probe(&self, host: &Host, _credentials: &Credentials) -> Result<(), OpsError> {
            match &self.fail_probe {
                Some(message) => Err(OpsError::Ssh {
                    host: host.name.clone(),
                    message: message.clone(),
                    suggestion: None,
                }),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            user: Some("root".to_string()),
            password: Some(Zeroizing::new("hunter2".to_string())),
            private_key: None,
        };

        let debug = format!("{:?}", creds);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2"));
        assert!(creds.password.is_some());
    }

    #[test]
    fn test_host_lines_rechunks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: OutputSink = Arc::new(move |chunk: String| sink_seen.lock().push(chunk));

        let lines = HostLines::new("wk-1", sink);
        lines.push(b"hel");
        lines.push(b"lo\nwor");
        lines.push(b"ld\npartial");
        lines.flush();

        assert_eq!(
            *seen.lock(),
            vec!["[wk-1] hello\n", "[wk-1] world\n", "[wk-1] partial\n"]
        );
    }

    #[test]
    fn test_host_lines_joins_split_character() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: OutputSink = Arc::new(move |chunk: String| sink_seen.lock().push(chunk));

        let lines = HostLines::new("h", sink);
        lines.push(&[0xC3]);
        lines.push(&[0xA9, b'\n']);
        lines.push(&[0xFF, b'o', b'k', b'\n']);
        lines.push(&[0xE2, 0x82]);
        lines.flush();

        assert_eq!(
            *seen.lock(),
            vec!["[h] \u{e9}\n", "[h] \u{fffd}ok\n", "[h] \u{fffd}\n"]
        );
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(RunOutcome::success().into_result("noop").is_ok());

        let err = RunOutcome {
            exit_code: 4,
            host: Some("cp-1".to_string()),
        }
        .into_result("add-node.yml")
        .unwrap_err();
        assert_eq!(err.summary(), "add-node.yml on cp-1 exited with status 4");
    }

    #[test]
    fn test_payload_describe() {
        let long = "x".repeat(100);
        assert_eq!(Payload::Command(long).describe().len(), 60);
        assert_eq!(Payload::Script("echo hi".into()).describe(), "inline script");
    }
}
