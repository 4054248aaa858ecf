// Task tracking for long-running operations

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod executor;
pub mod registry;

pub use executor::{
    ConfigAccess, ConfigLock, ConfigReadGuard, ConfigWriteGuard, ExecutionClass, ExecutorConfig,
    OutputSink, TaskContext, TaskExecutor,
};
pub use registry::{TaskRegistry, DEFAULT_RETENTION};

/// Unique identifier for tasks
pub type TaskId = String;

/// Operation category a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    InstallTooling,
    UninstallTooling,
    InstallComponent,
    UninstallComponent,
    InstallAddon,
    UninstallAddon,
    JoinNode,
    RemoveNode,
    RunScript,
}

impl TaskKind {
    /// Whether this kind rewrites the rendered inventory/configuration files
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            TaskKind::InstallAddon | TaskKind::UninstallAddon | TaskKind::RunScript
        )
    }

    pub fn execution_class(&self) -> ExecutionClass {
        if self.is_mutating() {
            ExecutionClass::Mutating
        } else {
            ExecutionClass::ReadOnly
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::InstallTooling => "install-tooling",
            TaskKind::UninstallTooling => "uninstall-tooling",
            TaskKind::InstallComponent => "install-component",
            TaskKind::UninstallComponent => "uninstall-component",
            TaskKind::InstallAddon => "install-addon",
            TaskKind::UninstallAddon => "uninstall-addon",
            TaskKind::JoinNode => "join-node",
            TaskKind::RemoveNode => "remove-node",
            TaskKind::RunScript => "run-script",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// A tracked unit of asynchronous work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub log: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind) -> Self {
        Task {
            id,
            kind,
            status: TaskStatus::Running,
            log: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// The accumulated log as presented to pollers
    pub fn logs(&self) -> String {
        self.log.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_classification() {
        assert!(TaskKind::JoinNode.is_mutating());
        assert!(TaskKind::InstallComponent.is_mutating());
        assert!(!TaskKind::RunScript.is_mutating());
        assert_eq!(
            TaskKind::InstallAddon.execution_class(),
            ExecutionClass::ReadOnly
        );
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&TaskKind::UninstallComponent).unwrap();
        assert_eq!(json, "\"uninstall-component\"");
        assert_eq!(TaskKind::UninstallComponent.to_string(), "uninstall-component");
        assert_eq!(
            serde_json::to_string(&TaskStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
