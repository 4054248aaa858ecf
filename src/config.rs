// Console configuration file

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::output::errors::OpsError;
use crate::tasks::ExecutorConfig;

/// Top-level configuration; every field has a default so an empty file is valid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    /// Address the HTTP API binds to
    pub listen: String,
    /// Root of the rendered inventory generations
    pub state_dir: PathBuf,
    /// Optional YAML file seeding the host directory
    pub hosts_file: Option<PathBuf>,
    pub tool: ToolConfig,
    pub tasks: TaskSettings,
    pub ssh: SshSettings,
    pub materializer: MaterializerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub playbook_binary: String,
    pub playbook_dir: PathBuf,
    pub forks: usize,
    pub install_command: String,
    pub uninstall_command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSettings {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// `null` disables the no-progress timeout
    pub idle_timeout_secs: Option<u64>,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    pub default_user: Option<String>,
    pub private_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaterializerSettings {
    pub keep_generations: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            listen: "127.0.0.1:8080".to_string(),
            state_dir: PathBuf::from(".clusterops"),
            hosts_file: None,
            tool: ToolConfig::default(),
            tasks: TaskSettings::default(),
            ssh: SshSettings::default(),
            materializer: MaterializerSettings::default(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            playbook_binary: "ansible-playbook".to_string(),
            playbook_dir: PathBuf::from("playbooks"),
            forks: 10,
            install_command: "python3 -m pip install --user --upgrade ansible-core".to_string(),
            uninstall_command: "python3 -m pip uninstall --yes ansible-core".to_string(),
        }
    }
}

impl Default for TaskSettings {
    fn default() -> Self {
        TaskSettings {
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
            idle_timeout_secs: Some(30 * 60),
            max_concurrent: 16,
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            connect_timeout_secs: 30,
            default_user: None,
            private_key: None,
        }
    }
}

impl Default for MaterializerSettings {
    fn default() -> Self {
        MaterializerSettings {
            keep_generations: 3,
        }
    }
}

impl TaskSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_concurrent: self.max_concurrent,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ConsoleConfig {
    /// Read a YAML configuration file
    pub fn load(path: &Path) -> Result<Self, OpsError> {
        let content = std::fs::read_to_string(path).map_err(|e| OpsError::Config {
            message: format!("Failed to read configuration: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        Self::parse_str(&content).map_err(|e| match e {
            OpsError::Config { message, .. } => OpsError::Config {
                message,
                path: Some(path.to_path_buf()),
            },
            other => other,
        })
    }

    pub fn parse_str(content: &str) -> Result<Self, OpsError> {
        if content.trim().is_empty() {
            return Ok(ConsoleConfig::default());
        }

        let config: ConsoleConfig = serde_yaml::from_str(content).map_err(|e| OpsError::Config {
            message: format!("Invalid configuration: {}", e),
            path: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, OpsError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(ConsoleConfig::default()),
        }
    }

    fn validate(&self) -> Result<(), OpsError> {
        let invalid = |message: &str| {
            Err(OpsError::Config {
                message: message.to_string(),
                path: None,
            })
        };

        if self.tasks.max_concurrent == 0 {
            return invalid("tasks.max_concurrent must be at least 1");
        }
        if self.materializer.keep_generations == 0 {
            return invalid("materializer.keep_generations must be at least 1");
        }
        if self.tool.playbook_binary.trim().is_empty() {
            return invalid("tool.playbook_binary must not be empty");
        }
        if self.tasks.idle_timeout_secs == Some(0) {
            return invalid("tasks.idle_timeout_secs must be positive (use null to disable)");
        }
        Ok(())
    }
}
