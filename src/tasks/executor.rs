// Background execution of task bodies with configuration-lock discipline

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::TaskRegistry;
use super::TaskId;
use crate::output::errors::OpsError;

/// Whether an execution rewrites the rendered inventory/configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionClass {
    Mutating,
    ReadOnly,
}

/// Lock over the rendered inventory/configuration file set.
///
/// Mutating executions take it exclusively, read-only executions share it.
/// Holding one of the guard types is the only way to call the materializer.
#[derive(Clone, Default)]
pub struct ConfigLock {
    inner: Arc<RwLock<()>>,
}

/// Proof of exclusive access to the configuration file set
pub struct ConfigWriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Proof of shared (read) access to the configuration file set
pub struct ConfigReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

impl ConfigLock {
    pub fn new() -> Self {
        ConfigLock::default()
    }

    /// Wait for exclusive access
    pub async fn write(&self) -> ConfigWriteGuard {
        ConfigWriteGuard {
            _guard: Arc::clone(&self.inner).write_owned().await,
        }
    }

    /// Wait for shared access
    pub async fn read(&self) -> ConfigReadGuard {
        ConfigReadGuard {
            _guard: Arc::clone(&self.inner).read_owned().await,
        }
    }

    /// Exclusive access if nobody holds the lock right now
    pub fn try_write(&self) -> Option<ConfigWriteGuard> {
        Arc::clone(&self.inner)
            .try_write_owned()
            .ok()
            .map(|guard| ConfigWriteGuard { _guard: guard })
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ConfigWriteGuard {}
    impl Sealed for super::ConfigReadGuard {}
}

/// Guard types that allow reading the rendered configuration
pub trait ConfigAccess: sealed::Sealed + Send + Sync + 'static {
    const CLASS: ExecutionClass;

    fn acquire(lock: ConfigLock) -> BoxFuture<'static, Self>
    where
        Self: Sized;
}

impl ConfigAccess for ConfigWriteGuard {
    const CLASS: ExecutionClass = ExecutionClass::Mutating;

    fn acquire(lock: ConfigLock) -> BoxFuture<'static, Self> {
        async move { lock.write().await }.boxed()
    }
}

impl ConfigAccess for ConfigReadGuard {
    const CLASS: ExecutionClass = ExecutionClass::ReadOnly;

    fn acquire(lock: ConfigLock) -> BoxFuture<'static, Self> {
        async move { lock.read().await }.boxed()
    }
}

/// Callback receiving output chunks from the remote execution adapter
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

/// Messages from a worker to the registry writer for its task
#[derive(Debug)]
enum TaskEvent {
    Output(String),
    Finished(Result<(), String>),
}

/// Timestamp of the last output a task produced
#[derive(Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Activity(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

/// Handle given to a task body: where its output goes and which lock it holds
pub struct TaskContext<G> {
    task_id: TaskId,
    events: mpsc::UnboundedSender<TaskEvent>,
    activity: Activity,
    guard: Arc<G>,
}

impl<G> TaskContext<G> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The configuration lock guard held for the lifetime of this body
    pub fn guard(&self) -> &G {
        &self.guard
    }

    /// Append a chunk to the task log
    pub fn log(&self, chunk: impl Into<String>) {
        self.activity.touch();
        let _ = self.events.send(TaskEvent::Output(chunk.into()));
    }

    /// Append a line to the task log
    pub fn line(&self, line: impl AsRef<str>) {
        self.log(format!("{}\n", line.as_ref()));
    }

    /// Sink for adapter output; every chunk counts as progress.
    ///
    /// Each sink shares the body's lock guard. Adapter work that is still
    /// running after its body was dropped (idle timeout) therefore keeps
    /// the configuration lock until that work stops and drops the sink.
    pub fn sink(&self) -> OutputSink
    where
        G: Send + Sync + 'static,
    {
        let events = self.events.clone();
        let activity = self.activity.clone();
        let guard = Arc::clone(&self.guard);
        Arc::new(move |chunk: String| {
            let _held = &guard;
            activity.touch();
            let _ = events.send(TaskEvent::Output(chunk));
        })
    }
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Fail a task that produces no output for this long
    pub idle_timeout: Option<Duration>,
    /// Maximum number of bodies executing at once
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            max_concurrent: 16,
        }
    }
}

/// Runs task bodies in the background and records their outcome
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    lock: ConfigLock,
    permits: Arc<Semaphore>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, lock: ConfigLock, config: ExecutorConfig) -> Self {
        TaskExecutor {
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            lock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn lock(&self) -> &ConfigLock {
        &self.lock
    }

    /// Start `work` for an already-created task and return immediately.
    ///
    /// The guard type `G` picks the lock mode: `ConfigWriteGuard` serializes
    /// against every other execution, `ConfigReadGuard` only against
    /// mutating ones. Whatever `work` does (error, panic, stall past the idle
    /// timeout) the task ends `completed` or `failed`.
    pub fn schedule<G, F, Fut>(&self, task_id: TaskId, work: F)
    where
        G: ConfigAccess,
        F: FnOnce(TaskContext<G>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), OpsError>> + Send + 'static,
    {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(record_events(Arc::clone(&self.registry), task_id.clone(), rx));

        let lock = self.lock.clone();
        let permits = Arc::clone(&self.permits);
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            let guard = Arc::new(G::acquire(lock).await);
            debug!(task_id = %task_id, class = ?G::CLASS, "config lock acquired");

            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    let activity = Activity::new();
                    let ctx = TaskContext {
                        task_id: task_id.clone(),
                        events: events.clone(),
                        activity: activity.clone(),
                        guard: Arc::clone(&guard),
                    };
                    let body = AssertUnwindSafe(async move { work(ctx).await }).catch_unwind();
                    supervise(&task_id, body, &activity, idle_timeout).await
                }
                Err(_) => Err(OpsError::runtime("executor is shutting down")),
            };

            match &result {
                Ok(()) => info!(task_id = %task_id, "task completed"),
                Err(e) => warn!(task_id = %task_id, error = %e.summary(), "task failed"),
            }

            let _ = events.send(TaskEvent::Finished(result.map_err(|e| e.summary())));

            // Released only after the outcome is queued, and only once no
            // sink handed to the adapter is still alive
            if Arc::strong_count(&guard) > 1 {
                debug!(task_id = %task_id, "config lock held until adapter work stops");
            }
            drop(guard);
        });
    }
}

/// Single writer of one task's registry entry
async fn record_events(
    registry: Arc<TaskRegistry>,
    task_id: TaskId,
    mut rx: mpsc::UnboundedReceiver<TaskEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TaskEvent::Output(chunk) => {
                registry.append(&task_id, chunk);
            }
            TaskEvent::Finished(Ok(())) => {
                registry.complete(&task_id);
                return;
            }
            TaskEvent::Finished(Err(error)) => {
                registry.fail(&task_id, error);
                return;
            }
        }
    }

    registry.fail(&task_id, "task worker exited without reporting a result");
}

/// Drive a body to completion, converting panics and stalls into errors
async fn supervise<Fut>(
    task_id: &str,
    body: Fut,
    activity: &Activity,
    idle_timeout: Option<Duration>,
) -> Result<(), OpsError>
where
    Fut: Future<Output = Result<Result<(), OpsError>, Box<dyn Any + Send>>>,
{
    tokio::pin!(body);

    let outcome = match idle_timeout {
        None => body.await,
        Some(limit) => loop {
            let deadline = activity.last() + limit;
            tokio::select! {
                outcome = &mut body => break outcome,
                _ = tokio::time::sleep_until(deadline) => {
                    if activity.last() + limit <= Instant::now() {
                        return Err(OpsError::Timeout {
                            operation: format!("task {}", task_id),
                            duration_secs: limit.as_secs(),
                        });
                    }
                }
            }
        },
    };

    match outcome {
        Ok(result) => result,
        Err(panic) => Err(OpsError::Runtime {
            message: format!("task panicked: {}", panic_message(panic.as_ref())),
            suggestion: None,
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
