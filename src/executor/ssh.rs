// SSH connection management with pooling

use async_trait::async_trait;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use ssh2::{KeyboardInteractivePrompt, Session};
use tracing::debug;
use zeroize::Zeroizing;

use super::{ChunkSink, Connection, Credentials};
use crate::inventory::Host;
use crate::output::errors::OpsError;

/// SSH connection pool for reusing connections across the hosts of one run
pub struct ConnectionPool {
    connections: DashMap<String, Arc<Mutex<PooledConnection>>>,
    connect_timeout: Duration,
    default_user: Option<String>,
    request_user: Option<String>,
    private_key_path: Option<PathBuf>,
    password: Option<Zeroizing<String>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            connections: DashMap::new(),
            connect_timeout: Duration::from_secs(30),
            default_user: None,
            request_user: None,
            private_key_path: None,
            password: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = Some(user.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    pub fn with_password(mut self, password: Zeroizing<String>) -> Self {
        self.password = Some(password);
        self
    }

    /// Apply per-request credentials on top of the configured defaults
    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        if let Some(user) = &credentials.user {
            self.request_user = Some(user.clone());
        }
        if let Some(key) = &credentials.private_key {
            self.private_key_path = Some(key.clone());
        }
        if let Some(password) = &credentials.password {
            self.password = Some(password.clone());
        }
        self
    }

    /// Get a connection to a host (from pool or create new)
    pub async fn get(self: &Arc<Self>, host: &Host) -> Result<SshConnection, OpsError> {
        let key = host.ssh_target();

        if let Some(conn) = self.connections.get(&key) {
            if conn.lock().is_valid() {
                return Ok(SshConnection {
                    inner: Arc::clone(conn.value()),
                    host_name: host.name.clone(),
                });
            }
        }

        let pool = Arc::clone(self);
        let target = host.clone();
        let conn = tokio::task::spawn_blocking(move || pool.connect(&target))
            .await
            .map_err(|e| OpsError::runtime(format!("SSH connect worker failed: {}", e)))??;

        let inner = Arc::new(Mutex::new(conn));
        self.connections.insert(key, Arc::clone(&inner));
        Ok(SshConnection {
            inner,
            host_name: host.name.clone(),
        })
    }

    fn user_for(&self, host: &Host) -> String {
        self.request_user
            .clone()
            .or_else(|| (!host.user.is_empty()).then(|| host.user.clone()))
            .or_else(|| self.default_user.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Create a new SSH connection
    fn connect(&self, host: &Host) -> Result<PooledConnection, OpsError> {
        let address = (host.address.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|e| OpsError::Ssh {
                host: host.name.clone(),
                message: format!("Invalid address {}: {}", host.address, e),
                suggestion: Some("Check the host address format".to_string()),
            })?
            .next()
            .ok_or_else(|| OpsError::Ssh {
                host: host.name.clone(),
                message: format!("{} did not resolve to any address", host.address),
                suggestion: None,
            })?;

        let tcp = TcpStream::connect_timeout(&address, self.connect_timeout).map_err(|e| {
            OpsError::Ssh {
                host: host.name.clone(),
                message: format!("Connection failed: {}", e),
                suggestion: ssh_connection_suggestion(&e),
            }
        })?;

        let mut session = Session::new().map_err(|e| OpsError::Ssh {
            host: host.name.clone(),
            message: format!("Failed to create SSH session: {}", e),
            suggestion: None,
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);

        session.handshake().map_err(|e| OpsError::Ssh {
            host: host.name.clone(),
            message: format!("SSH handshake failed: {}", e),
            suggestion: Some("Check SSH service is running on the target".to_string()),
        })?;

        let user = self.user_for(host);
        let mut authenticated = false;

        // Password from the request first, then keys, then the agent
        if let Some(password) = &self.password {
            if session.userauth_password(&user, password).is_ok() {
                authenticated = true;
            } else {
                // Keyboard-interactive, used by some PAM configurations
                let mut prompter = PasswordPrompter(password.clone());
                if session
                    .userauth_keyboard_interactive(&user, &mut prompter)
                    .is_ok()
                {
                    authenticated = true;
                }
            }
        }

        if !authenticated {
            let key_paths = self
                .private_key_path
                .iter()
                .cloned()
                .chain(
                    [
                        dirs::home_dir().map(|h| h.join(".ssh/id_ed25519")),
                        dirs::home_dir().map(|h| h.join(".ssh/id_rsa")),
                    ]
                    .into_iter()
                    .flatten(),
                )
                .collect::<Vec<_>>();

            for key_path in key_paths {
                if key_path.exists()
                    && session
                        .userauth_pubkey_file(&user, None, &key_path, None)
                        .is_ok()
                {
                    authenticated = true;
                    break;
                }
            }
        }

        if !authenticated {
            if let Ok(mut agent) = session.agent() {
                if agent.connect().is_ok() {
                    agent.list_identities().ok();
                    for identity in agent.identities().unwrap_or_default() {
                        if agent.userauth(&user, &identity).is_ok() {
                            authenticated = true;
                            break;
                        }
                    }
                }
            }
        }

        if !authenticated {
            return Err(OpsError::Ssh {
                host: host.name.clone(),
                message: format!("Authentication failed for user {}", user),
                suggestion: Some(
                    "Supply a password or private key in the request credentials".to_string(),
                ),
            });
        }

        debug!(host = %host.name, user = %user, "ssh session established");
        Ok(PooledConnection {
            session,
            host_name: host.name.clone(),
        })
    }

    /// Close all connections
    pub fn close_all(&self) {
        self.connections.clear();
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled SSH connection
pub struct PooledConnection {
    session: Session,
    host_name: String,
}

impl PooledConnection {
    /// Check if the connection is still valid
    pub fn is_valid(&self) -> bool {
        self.session.authenticated()
    }

    fn open_error(&self, e: ssh2::Error) -> OpsError {
        // Timeouts and transport errors mean the session should not be reused
        let text = e.to_string();
        let broken = text.contains("timeout")
            || text.contains("Connection")
            || text.contains("Broken pipe");

        OpsError::Ssh {
            host: self.host_name.clone(),
            message: format!(
                "Failed to open channel{}: {}",
                if broken { " (connection error)" } else { "" },
                e
            ),
            suggestion: None,
        }
    }

    /// Execute a command on this connection
    pub fn exec(&self, command: &str) -> Result<CommandResult, OpsError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.open_error(e))?;

        channel.exec(command).map_err(|e| OpsError::Ssh {
            host: self.host_name.clone(),
            message: format!("Failed to execute command: {}", e),
            suggestion: None,
        })?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        channel.read_to_string(&mut stdout).ok();
        channel.stderr().read_to_string(&mut stderr).ok();

        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Execute a command with streaming output.
    ///
    /// Raising `cancel` closes the channel and returns an error within one
    /// poll interval.
    pub fn exec_streaming<F, G>(
        &self,
        command: &str,
        cancel: &AtomicBool,
        mut on_stdout: F,
        mut on_stderr: G,
    ) -> Result<i32, OpsError>
    where
        F: FnMut(&[u8]),
        G: FnMut(&[u8]),
    {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.open_error(e))?;

        channel.exec(command).map_err(|e| OpsError::Ssh {
            host: self.host_name.clone(),
            message: format!("Failed to execute command: {}", e),
            suggestion: None,
        })?;

        self.session.set_blocking(false);

        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];

        loop {
            if cancel.load(Ordering::SeqCst) {
                self.session.set_blocking(true);
                channel.close().ok();
                debug!(host = %self.host_name, "streaming command cancelled");
                return Err(OpsError::Ssh {
                    host: self.host_name.clone(),
                    message: "Command cancelled before it finished".to_string(),
                    suggestion: None,
                });
            }

            let mut activity = false;

            match channel.read(&mut stdout_buf) {
                Ok(0) => {}
                Ok(n) => {
                    on_stdout(&stdout_buf[..n]);
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            match channel.stderr().read(&mut stderr_buf) {
                Ok(0) => {}
                Ok(n) => {
                    on_stderr(&stderr_buf[..n]);
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            if channel.eof() && !activity {
                break;
            }

            if !activity {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        self.session.set_blocking(true);
        channel.wait_close().ok();
        Ok(channel.exit_status().unwrap_or(-1))
    }
}

/// Raises its flag when dropped so blocking work outlived by its caller stops
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Shared handle to a pooled connection
pub struct SshConnection {
    inner: Arc<Mutex<PooledConnection>>,
    host_name: String,
}

/// Result of executing a command
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(Zeroizing<String>);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.to_string()).collect()
    }
}

// libssh2 calls block, so every call runs on the blocking pool
#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, OpsError> {
        let inner = Arc::clone(&self.inner);
        let cmd = cmd.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = inner.lock();
            conn.exec(&cmd)
        })
        .await
        .map_err(|e| OpsError::runtime(format!("SSH worker failed: {}", e)))?
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        on_stdout: ChunkSink,
        on_stderr: ChunkSink,
    ) -> Result<CommandResult, OpsError> {
        let inner = Arc::clone(&self.inner);
        let cmd = cmd.to_string();

        // Dropping this future (task timeout) stops the loop below; chunks
        // stay raw so the caller can join characters split across reads
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));

        let exit_code = tokio::task::spawn_blocking(move || {
            let conn = inner.lock();
            conn.exec_streaming(&cmd, &cancel, |bytes| on_stdout(bytes), |bytes| on_stderr(bytes))
        })
        .await
        .map_err(|e| OpsError::runtime(format!("SSH worker failed: {}", e)))??;

        Ok(CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
        })
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::HostRole;

    #[test]
    fn test_request_user_wins_over_default() {
        let pool = ConnectionPool::new()
            .with_default_user("ops")
            .with_credentials(&Credentials {
                user: Some("admin".to_string()),
                ..Default::default()
            });

        let host = Host::new("wk-1", HostRole::Worker);
        assert_eq!(pool.user_for(&host), "admin");
    }

    #[test]
    fn test_host_user_used_without_override() {
        let pool = ConnectionPool::new().with_default_user("ops");
        let host = Host::new("wk-1", HostRole::Worker).with_user("deploy");
        assert_eq!(pool.user_for(&host), "deploy");
    }

    #[test]
    fn test_connection_suggestions() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(ssh_connection_suggestion(&refused)
            .unwrap()
            .contains("SSH service"));

        let other = std::io::Error::from(std::io::ErrorKind::Other);
        assert!(ssh_connection_suggestion(&other).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_ssh_error() {
        // Port 1 on loopback refuses immediately
        let pool = Arc::new(ConnectionPool::new().with_connect_timeout(Duration::from_secs(2)));
        let host = Host::new("gone", HostRole::Worker)
            .with_address("127.0.0.1")
            .with_port(1);

        let err = match pool.get(&host).await {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        assert!(matches!(err, OpsError::Ssh { ref host, .. } if host == "gone"));
    }

    #[tokio::test]
    async fn test_dropped_caller_stops_blocking_loop() {
        let cancel = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let (flag, done) = (Arc::clone(&cancel), Arc::clone(&stopped));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let caller = async move {
            let _cancel_on_drop = CancelOnDrop(Arc::clone(&flag));
            tokio::task::spawn_blocking(move || {
                while !flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                done.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .await
        };

        let timed_out = tokio::time::timeout(Duration::from_millis(50), caller).await;
        assert!(timed_out.is_err());
        assert!(cancel.load(Ordering::SeqCst));

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
