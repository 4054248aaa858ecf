// In-memory task registry: the single source of truth for polling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{Task, TaskId, TaskKind, TaskStatus};

/// Terminal tasks are kept this long before eviction unless configured otherwise
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Registry of every task accepted during this process lifetime.
///
/// The id map is sharded (`DashMap`), and each task sits behind its own lock,
/// so concurrent creates, pollers and the single writer of a given task never
/// contend on one global lock. Readers always receive a cloned [`Task`].
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<RwLock<Task>>>,
    sequence: AtomicU64,
    retention: Duration,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        TaskRegistry {
            tasks: DashMap::new(),
            sequence: AtomicU64::new(0),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Allocate a fresh task in the `running` state
    pub fn create(&self, kind: TaskKind) -> TaskId {
        let id = self.next_id();
        self.tasks
            .insert(id.clone(), Arc::new(RwLock::new(Task::new(id.clone(), kind))));
        debug!(task_id = %id, kind = %kind, "task created");
        id
    }

    /// Append an output chunk; ignored once the task is terminal
    pub fn append(&self, id: &str, chunk: impl Into<String>) -> bool {
        let Some(task) = self.entry(id) else {
            return false;
        };

        let mut task = task.write();
        if task.status.is_terminal() {
            return false;
        }
        task.log.push(chunk.into());
        true
    }

    /// Mark a task completed; a second call is a no-op
    pub fn complete(&self, id: &str) -> bool {
        self.finish(id, TaskStatus::Completed, None)
    }

    /// Mark a task failed with a cause; a second call is a no-op
    pub fn fail(&self, id: &str, error: impl Into<String>) -> bool {
        self.finish(id, TaskStatus::Failed, Some(error.into()))
    }

    fn finish(&self, id: &str, status: TaskStatus, error: Option<String>) -> bool {
        let Some(task) = self.entry(id) else {
            return false;
        };

        let mut task = task.write();
        if task.status.is_terminal() {
            return false;
        }
        task.status = status;
        task.error = error;
        task.ended_at = Some(Utc::now());
        true
    }

    /// Copy of the task's current state
    pub fn get(&self, id: &str) -> Option<Task> {
        self.entry(id).map(|task| task.read().clone())
    }

    /// All retained tasks, newest first
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|entry| entry.value().read().clone())
            .collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop terminal tasks that ended more than `retention` before `now`.
    ///
    /// Running tasks are never evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };

        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            let task = task.read();
            match task.ended_at {
                Some(ended_at) => ended_at > cutoff,
                None => true,
            }
        });

        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            info!(evicted, retained = self.tasks.len(), "evicted expired tasks");
        }
        evicted
    }

    fn entry(&self, id: &str) -> Option<Arc<RwLock<Task>>> {
        self.tasks.get(id).map(|task| Arc::clone(task.value()))
    }

    fn next_id(&self) -> TaskId {
        let millis = Utc::now().timestamp_millis();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let random: u32 = rand::random();
        format!("{:x}-{:04x}-{:08x}", millis, seq, random)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
