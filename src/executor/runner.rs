// Automation runner: playbooks through the automation tool, scripts over SSH

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{
    Connection, ConnectionPool, Credentials, HostLines, LocalConnection, Payload, RemoteRunner,
    RunOutcome, RunRequest,
};
use crate::inventory::Host;
use crate::output::errors::OpsError;
use crate::tasks::OutputSink;

/// Runs payloads with the external automation tool and plain SSH
pub struct AutomationRunner {
    playbook_binary: String,
    connect_timeout: Duration,
    default_user: Option<String>,
    private_key: Option<PathBuf>,
    forks: usize,
}

impl AutomationRunner {
    pub fn new(playbook_binary: impl Into<String>) -> Self {
        AutomationRunner {
            playbook_binary: playbook_binary.into(),
            connect_timeout: Duration::from_secs(30),
            default_user: None,
            private_key: None,
            forks: 10,
        }
    }

    /// Maximum number of hosts a command or script runs on at once
    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_default_user(mut self, user: Option<String>) -> Self {
        self.default_user = user;
        self
    }

    pub fn with_private_key(mut self, key: Option<PathBuf>) -> Self {
        self.private_key = key;
        self
    }

    fn pool(&self, credentials: &Credentials) -> ConnectionPool {
        let mut pool = ConnectionPool::new().with_connect_timeout(self.connect_timeout);
        if let Some(user) = &self.default_user {
            pool = pool.with_default_user(user.clone());
        }
        if let Some(key) = &self.private_key {
            pool = pool.with_private_key(key.clone());
        }
        pool.with_credentials(credentials)
    }

    async fn connect(
        &self,
        pool: &Arc<ConnectionPool>,
        host: &Host,
    ) -> Result<Box<dyn Connection>, OpsError> {
        if host.is_local() {
            Ok(Box::new(LocalConnection::new(&host.name)))
        } else {
            Ok(Box::new(pool.get(host).await?))
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_playbook(
        &self,
        playbook: &Path,
        inventory: &Path,
        config: Option<&Path>,
        extra_vars: &BTreeMap<String, String>,
        limit: Option<&str>,
        credentials: &Credentials,
        output: OutputSink,
    ) -> Result<RunOutcome, OpsError> {
        // Secrets go through a private vars file, never the command line
        let secrets = match &credentials.password {
            Some(password) => Some(write_secret_vars(password)?),
            None => None,
        };

        let command = playbook_command(
            &self.playbook_binary,
            playbook,
            inventory,
            extra_vars,
            limit,
            credentials,
            secrets.as_ref().map(|f| f.path()),
        )?;
        debug!(command = %command, "running playbook");

        let mut conn = LocalConnection::new("localhost").with_env("ANSIBLE_FORCE_COLOR", "0");
        if let Some(config) = config {
            conn = conn.with_env("ANSIBLE_CONFIG", config.display().to_string());
        }

        let out = Arc::clone(&output);
        let err = Arc::clone(&output);
        let result = conn
            .exec_streaming(
                &command,
                Box::new(move |line: &[u8]| out(String::from_utf8_lossy(line).into_owned())),
                Box::new(move |line: &[u8]| err(String::from_utf8_lossy(line).into_owned())),
            )
            .await?;

        info!(
            playbook = %playbook.display(),
            exit_code = result.exit_code,
            "playbook finished"
        );
        Ok(RunOutcome {
            exit_code: result.exit_code,
            host: limit.map(str::to_string),
        })
    }

    /// Run `command` on every host, at most `forks` at a time.
    ///
    /// Once a host fails no further hosts are started; hosts already
    /// running finish. The reported failure is the first one in host order.
    async fn run_on_hosts(
        &self,
        hosts: &[Host],
        command: &str,
        credentials: &Credentials,
        output: OutputSink,
    ) -> Result<RunOutcome, OpsError> {
        if hosts.is_empty() {
            return Err(OpsError::NoEligibleHost {
                role: "target".to_string(),
                requested: Some(Vec::new()),
            });
        }

        let pool = Arc::new(self.pool(credentials));
        let semaphore = Arc::new(Semaphore::new(self.forks));
        let failed = AtomicBool::new(false);

        let futures: Vec<_> = hosts
            .iter()
            .map(|host| {
                let sem = Arc::clone(&semaphore);
                let pool = Arc::clone(&pool);
                let output = Arc::clone(&output);
                let failed = &failed;

                async move {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|e| OpsError::runtime(format!("Host limiter closed: {}", e)))?;
                    if failed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }

                    let result = self.run_on_host(&pool, host, command, &output).await;
                    match &result {
                        Ok(exit_code) if *exit_code == 0 => {}
                        _ => failed.store(true, Ordering::SeqCst),
                    }
                    result.map(Some)
                }
            })
            .collect();

        let results = join_all(futures).await;
        pool.close_all();

        for (host, result) in hosts.iter().zip(results) {
            match result {
                Err(e) => return Err(e),
                Ok(Some(exit_code)) if exit_code != 0 => {
                    return Ok(RunOutcome {
                        exit_code,
                        host: Some(host.name.clone()),
                    });
                }
                _ => {}
            }
        }

        Ok(RunOutcome::success())
    }

    async fn run_on_host(
        &self,
        pool: &Arc<ConnectionPool>,
        host: &Host,
        command: &str,
        output: &OutputSink,
    ) -> Result<i32, OpsError> {
        let conn = self.connect(pool, host).await?;

        let stdout = HostLines::new(&host.name, Arc::clone(output));
        let stderr = HostLines::new(&host.name, Arc::clone(output));
        let (out, err) = (Arc::clone(&stdout), Arc::clone(&stderr));

        let result = conn
            .exec_streaming(
                command,
                Box::new(move |chunk: &[u8]| out.push(chunk)),
                Box::new(move |chunk: &[u8]| err.push(chunk)),
            )
            .await;
        stdout.flush();
        stderr.flush();
        let result = result?;

        if !result.success() {
            output(format!(
                "[{}] exited with status {}\n",
                host.name, result.exit_code
            ));
        }
        Ok(result.exit_code)
    }
}

#[async_trait]
impl RemoteRunner for AutomationRunner {
    async fn run(&self, request: RunRequest, output: OutputSink) -> Result<RunOutcome, OpsError> {
        match &request.payload {
            Payload::Playbook {
                playbook,
                inventory,
                config,
                extra_vars,
                limit,
            } => {
                self.run_playbook(
                    playbook,
                    inventory,
                    config.as_deref(),
                    extra_vars,
                    limit.as_deref(),
                    &request.credentials,
                    output,
                )
                .await
            }
            Payload::Command(command) => {
                self.run_on_hosts(&request.hosts, command, &request.credentials, output)
                    .await
            }
            Payload::Script(script) => {
                self.run_on_hosts(
                    &request.hosts,
                    &script_command(script),
                    &request.credentials,
                    output,
                )
                .await
            }
        }
    }

    async fn probe(&self, host: &Host, credentials: &Credentials) -> Result<(), OpsError> {
        let pool = Arc::new(self.pool(credentials));
        let conn = self.connect(&pool, host).await?;
        let result = conn.exec("true").await?;
        pool.close_all();

        if result.success() {
            Ok(())
        } else {
            Err(OpsError::RemoteExit {
                host: Some(host.name.clone()),
                command: "connectivity check".to_string(),
                exit_code: result.exit_code,
            })
        }
    }
}

/// Quote a string for POSIX sh
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Ship an inline script without quoting hazards
fn script_command(script: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(script.as_bytes());
    format!("printf '%s' {} | base64 -d | sh", encoded)
}

fn playbook_command(
    binary: &str,
    playbook: &Path,
    inventory: &Path,
    extra_vars: &BTreeMap<String, String>,
    limit: Option<&str>,
    credentials: &Credentials,
    secret_vars: Option<&Path>,
) -> Result<String, OpsError> {
    let mut args = vec![
        shell_quote(binary),
        "-i".to_string(),
        shell_quote(&inventory.display().to_string()),
        shell_quote(&playbook.display().to_string()),
    ];

    if !extra_vars.is_empty() {
        let json = serde_json::to_string(extra_vars)
            .map_err(|e| OpsError::runtime(format!("Failed to encode extra vars: {}", e)))?;
        args.push("--extra-vars".to_string());
        args.push(shell_quote(&json));
    }
    if let Some(path) = secret_vars {
        args.push("--extra-vars".to_string());
        args.push(shell_quote(&format!("@{}", path.display())));
    }
    if let Some(limit) = limit {
        args.push("--limit".to_string());
        args.push(shell_quote(limit));
    }
    if let Some(user) = &credentials.user {
        args.push("-u".to_string());
        args.push(shell_quote(user));
    }
    if let Some(key) = &credentials.private_key {
        args.push("--private-key".to_string());
        args.push(shell_quote(&key.display().to_string()));
    }

    Ok(args.join(" "))
}

fn write_secret_vars(password: &str) -> Result<tempfile::NamedTempFile, OpsError> {
    let mut file = tempfile::Builder::new()
        .prefix(".clusterops-vars-")
        .suffix(".json")
        .tempfile()
        .map_err(|e| OpsError::io(format!("Failed to create vars file: {}", e), std::env::temp_dir()))?;

    let vars = serde_json::json!({
        "ansible_password": password,
        "ansible_become_password": password,
    });
    file.write_all(vars.to_string().as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| OpsError::io(format!("Failed to write vars file: {}", e), file.path()))?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::HostRole;
    use parking_lot::Mutex;
    use zeroize::Zeroizing;

    fn collector() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        (Arc::new(move |chunk: String| sink_seen.lock().push(chunk)), seen)
    }

    fn local_host(name: &str) -> Host {
        Host::new(name, HostRole::AutomationTarget).with_var("ansible_connection", "local")
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("hosts.yml"), "hosts.yml");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_playbook_command_line() {
        let mut vars = BTreeMap::new();
        vars.insert("operation".to_string(), "install".to_string());

        let creds = Credentials {
            user: Some("admin".to_string()),
            ..Default::default()
        };
        let cmd = playbook_command(
            "ansible-playbook",
            Path::new("/pb/add-node.yml"),
            Path::new("/state/current/hosts.yml"),
            &vars,
            Some("wk-3"),
            &creds,
            None,
        )
        .unwrap();

        assert_eq!(
            cmd,
            r#"ansible-playbook -i /state/current/hosts.yml /pb/add-node.yml --extra-vars '{"operation":"install"}' --limit wk-3 -u admin"#
        );
    }

    #[tokio::test]
    async fn test_playbook_streams_tool_output() {
        let runner = AutomationRunner::new("echo");
        let (sink, seen) = collector();

        let request = RunRequest {
            hosts: Vec::new(),
            payload: Payload::Playbook {
                playbook: PathBuf::from("site.yml"),
                inventory: PathBuf::from("hosts.yml"),
                config: None,
                extra_vars: BTreeMap::new(),
                limit: None,
            },
            credentials: Credentials::default(),
        };

        let outcome = runner.run(request, sink).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(*seen.lock(), vec!["-i hosts.yml site.yml\n"]);
    }

    #[tokio::test]
    async fn test_password_never_on_command_line() {
        let runner = AutomationRunner::new("echo");
        let (sink, seen) = collector();

        let request = RunRequest {
            hosts: Vec::new(),
            payload: Payload::Playbook {
                playbook: PathBuf::from("site.yml"),
                inventory: PathBuf::from("hosts.yml"),
                config: None,
                extra_vars: BTreeMap::new(),
                limit: None,
            },
            credentials: Credentials {
                user: None,
                password: Some(Zeroizing::new("s3cret".to_string())),
                private_key: None,
            },
        };

        runner.run(request, sink).await.unwrap();
        let output = seen.lock().concat();
        assert!(output.contains("--extra-vars @"));
        assert!(!output.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_script_output_is_host_prefixed() {
        let runner = AutomationRunner::new("ansible-playbook");
        let (sink, seen) = collector();

        let request = RunRequest {
            hosts: vec![local_host("ctl-1")],
            payload: Payload::Script("echo 'from script'\necho done".to_string()),
            credentials: Credentials::default(),
        };

        let outcome = runner.run(request, sink).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(*seen.lock(), vec!["[ctl-1] from script\n", "[ctl-1] done\n"]);
    }

    #[tokio::test]
    async fn test_first_failure_stops_run() {
        let runner = AutomationRunner::new("ansible-playbook").with_forks(1);
        let (sink, seen) = collector();

        let request = RunRequest {
            hosts: vec![local_host("ctl-1"), local_host("ctl-2")],
            payload: Payload::Command("echo start; exit 3".to_string()),
            credentials: Credentials::default(),
        };

        let outcome = runner.run(request, sink).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome {
                exit_code: 3,
                host: Some("ctl-1".to_string()),
            }
        );
        let output = seen.lock().concat();
        assert!(output.contains("[ctl-1] exited with status 3"));
        assert!(!output.contains("ctl-2"));
    }

    #[tokio::test]
    async fn test_hosts_run_concurrently_up_to_forks() {
        let runner = AutomationRunner::new("ansible-playbook").with_forks(3);
        let (sink, seen) = collector();

        let request = RunRequest {
            hosts: vec![local_host("ctl-1"), local_host("ctl-2"), local_host("ctl-3")],
            payload: Payload::Command("sleep 0.4; echo finished".to_string()),
            credentials: Credentials::default(),
        };

        let started = std::time::Instant::now();
        let outcome = runner.run(request, sink).await.unwrap();

        assert!(outcome.is_success());
        assert!(started.elapsed() < Duration::from_millis(1000));
        let mut lines = seen.lock().clone();
        lines.sort();
        assert_eq!(
            lines,
            vec![
                "[ctl-1] finished\n",
                "[ctl-2] finished\n",
                "[ctl-3] finished\n"
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_failure_reports_first_host_in_order() {
        let runner = AutomationRunner::new("ansible-playbook").with_forks(2);
        let (sink, seen) = collector();

        let request = RunRequest {
            hosts: vec![local_host("ctl-1"), local_host("ctl-2"), local_host("ctl-3")],
            payload: Payload::Command("sleep 0.2; exit 5".to_string()),
            credentials: Credentials::default(),
        };

        let outcome = runner.run(request, sink).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome {
                exit_code: 5,
                host: Some("ctl-1".to_string()),
            }
        );

        // ctl-3 waits for a slot and is skipped once a failure is known
        let output = seen.lock().concat();
        assert!(output.contains("[ctl-1] exited with status 5"));
        assert!(output.contains("[ctl-2] exited with status 5"));
        assert!(!output.contains("ctl-3"));
    }

    #[tokio::test]
    async fn test_no_hosts_is_an_error() {
        let runner = AutomationRunner::new("ansible-playbook");
        let (sink, _) = collector();

        let request = RunRequest {
            hosts: Vec::new(),
            payload: Payload::Command("true".to_string()),
            credentials: Credentials::default(),
        };

        let err = runner.run(request, sink).await.unwrap_err();
        assert!(matches!(err, OpsError::NoEligibleHost { .. }));
    }

    #[tokio::test]
    async fn test_probe_local_host() {
        let runner = AutomationRunner::new("ansible-playbook");
        runner
            .probe(&local_host("ctl-1"), &Credentials::default())
            .await
            .unwrap();
    }
}
