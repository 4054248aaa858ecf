// Operation orchestrator: accepts operations, hands them to the executor, answers polls

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ConsoleConfig;
use crate::executor::{AutomationRunner, RemoteRunner};
use crate::inventory::{Generation, HostDirectory, InventoryMaterializer, StaticDirectory};
use crate::output::errors::{OpsError, ValidationError};
use crate::tasks::{
    ConfigLock, ExecutorConfig, Task, TaskExecutor, TaskId, TaskKind, TaskRegistry, TaskStatus,
};

mod operations;
pub mod request;

pub use request::{
    AddonParams, ComponentParams, CredentialsSpec, JoinNodeParams, OperationRequest,
    RemoveNodeParams, ScriptParams, ToolingParams,
};

/// Where operation bodies find playbooks and tooling commands
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub playbook_dir: PathBuf,
    pub install_command: String,
    pub uninstall_command: String,
}

/// Collaborators shared by every operation body
pub struct Services {
    pub directory: Arc<dyn HostDirectory>,
    pub materializer: InventoryMaterializer,
    pub runner: Arc<dyn RemoteRunner>,
    pub tool: ToolSettings,
}

/// Status as reported to pollers; `not_found` is a registry miss, not a task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Running,
    Completed,
    Failed,
    NotFound,
}

impl From<TaskStatus> for PollStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Running => PollStatus::Running,
            TaskStatus::Completed => PollStatus::Completed,
            TaskStatus::Failed => PollStatus::Failed,
        }
    }
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Running => "running",
            PollStatus::Completed => "completed",
            PollStatus::Failed => "failed",
            PollStatus::NotFound => "not_found",
        }
    }
}

/// Acknowledgement returned by `start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub task_id: TaskId,
    pub status: PollStatus,
    pub message: String,
}

/// Snapshot of a task as returned by `poll`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    pub status: PollStatus,
    pub logs: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl PollResponse {
    fn not_found(task_id: &str) -> Self {
        PollResponse {
            task_id: task_id.to_string(),
            kind: None,
            status: PollStatus::NotFound,
            logs: String::new(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }
}

impl From<Task> for PollResponse {
    fn from(task: Task) -> Self {
        PollResponse {
            logs: task.logs(),
            task_id: task.id,
            kind: Some(task.kind),
            status: task.status.into(),
            start_time: Some(task.started_at),
            end_time: task.ended_at,
            error: task.error,
        }
    }
}

/// Listing entry: a poll response without the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub status: PollStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        TaskSummary {
            task_id: task.id,
            kind: task.kind,
            status: task.status.into(),
            start_time: task.started_at,
            end_time: task.ended_at,
            error: task.error,
        }
    }
}

/// Public face of the long-running-operation core
#[derive(Clone)]
pub struct Orchestrator {
    executor: TaskExecutor,
    services: Arc<Services>,
}

impl Orchestrator {
    pub fn new(services: Services, registry: Arc<TaskRegistry>, config: ExecutorConfig) -> Self {
        Orchestrator {
            executor: TaskExecutor::new(registry, ConfigLock::new(), config),
            services: Arc::new(services),
        }
    }

    /// Wire up the production collaborators described by `config`
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, OpsError> {
        let directory = match &config.hosts_file {
            Some(path) => StaticDirectory::from_file(path)?,
            None => StaticDirectory::new(),
        };

        let runner = AutomationRunner::new(config.tool.playbook_binary.clone())
            .with_connect_timeout(config.ssh.connect_timeout())
            .with_default_user(config.ssh.default_user.clone())
            .with_private_key(config.ssh.private_key.clone())
            .with_forks(config.tool.forks);

        let services = Services {
            directory: Arc::new(directory),
            materializer: InventoryMaterializer::new(&config.state_dir)
                .with_keep_generations(config.materializer.keep_generations)
                .with_forks(config.tool.forks),
            runner: Arc::new(runner),
            tool: ToolSettings {
                playbook_dir: config.tool.playbook_dir.clone(),
                install_command: config.tool.install_command.clone(),
                uninstall_command: config.tool.uninstall_command.clone(),
            },
        };

        let registry = Arc::new(TaskRegistry::with_retention(config.tasks.retention()));
        Ok(Orchestrator::new(services, registry, config.tasks.executor_config()))
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.executor.registry()
    }

    pub fn lock(&self) -> &ConfigLock {
        self.executor.lock()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Validate `request`, create its task and schedule it.
    ///
    /// Returns as soon as the task exists; execution failures only show up
    /// through `poll`. Must be called from within a Tokio runtime.
    pub fn start(&self, request: OperationRequest) -> Result<StartResponse, ValidationError> {
        request.validate()?;

        let kind = request.kind();
        let task_id = self.registry().create(kind);
        info!(task_id = %task_id, kind = %kind, "operation accepted");

        operations::dispatch(
            &self.executor,
            Arc::clone(&self.services),
            task_id.clone(),
            request,
        );

        Ok(StartResponse {
            task_id,
            status: PollStatus::Running,
            message: format!("{} started", kind),
        })
    }

    /// Current view of a task; never mutates anything
    pub fn poll(&self, task_id: &str) -> PollResponse {
        match self.registry().get(task_id) {
            Some(task) => task.into(),
            None => PollResponse::not_found(task_id),
        }
    }

    /// Every retained task, newest first
    pub fn list(&self) -> Vec<TaskSummary> {
        self.registry().list().into_iter().map(Into::into).collect()
    }

    /// Periodically evict expired terminal tasks
    pub fn spawn_retention_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self.registry());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_expired(Utc::now());
                debug!(evicted, retained = registry.len(), "retention sweep");
            }
        })
    }

    /// Render the host directory once, outside any task
    pub async fn render(&self) -> Result<Generation, OpsError> {
        let guard = self.lock().write().await;
        let snapshot = self.services.directory.snapshot()?;
        self.services.materializer.regenerate(&snapshot, &guard)
    }
}
