//! Persistent tasks run on this node.
//!
//! The coordination layer decides where a persistent task runs (using each
//! executor's [`PersistentTaskExecutor::select_node`]) and hands the
//! resulting [`TaskAssignment`] to the assigned node. There the
//! [`PersistentTasksNodeService`] dispatches it by task name to the
//! registered executor, tracks its status and cancels it cooperatively,
//! aborting it if it does not finish within the cancel timeout.

pub mod executors;
pub mod placement;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mlnode_id::{AllocationId, NodeId, TaskId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::error::MlError;

pub use executors::{DatafeedParams, JobParams, OpenJobExecutor, StartDatafeedExecutor};
pub use placement::{Assignment, ClusterView, DiscoveryNode, NodeLoad};

/// Task name of the open-job executor.
pub const OPEN_JOB_TASK: &str = "open-job";

/// Task name of the start-datafeed executor.
pub const START_DATAFEED_TASK: &str = "start-datafeed";

/// Default time a cancelled task gets to wind down before it is aborted.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no executor registered for task [{0}]")]
    UnknownTask(String),

    #[error("task [{0}] is already running on this node")]
    AlreadyRunning(TaskId),

    #[error("task [{0}] is not known on this node")]
    NotFound(TaskId),

    #[error("task [{task_id}] is assigned to node [{assigned}], not [{local}]")]
    WrongNode {
        task_id: TaskId,
        assigned: NodeId,
        local: NodeId,
    },

    #[error("invalid params for task [{task}]: {source}")]
    InvalidParams {
        task: &'static str,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Execution(#[from] MlError),

    /// The task's work ended unsuccessfully.
    #[error("{0}")]
    Failed(String),

    #[error("node is shutting down")]
    ShuttingDown,
}

/// Decode a task's params.
pub fn parse_params<T: DeserializeOwned>(task: &'static str, params: &Value) -> Result<T, TaskError> {
    T::deserialize(params).map_err(|source| TaskError::InvalidParams { task, source })
}

/// A persistent task the coordination layer assigned to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub allocation_id: AllocationId,
    pub task_name: String,
    pub params: Value,
    pub executor_node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Started,
    Running { detail: String },
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

/// Handed to an executor for one task instance.
pub struct TaskContext {
    task_id: TaskId,
    allocation_id: AllocationId,
    cancel: watch::Receiver<bool>,
    status: Arc<watch::Sender<TaskStatus>>,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.allocation_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the task is cancelled, or once the node service that
    /// started it is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.cancel.wait_for(|cancelled| *cancelled).await;
    }

    pub fn update_status(&self, detail: impl Into<String>) {
        self.status.send_replace(TaskStatus::Running {
            detail: detail.into(),
        });
    }
}

/// Runs one kind of persistent task.
#[async_trait]
pub trait PersistentTaskExecutor: Send + Sync {
    fn task_name(&self) -> &'static str;

    /// Choose the node a task with these params should run on.
    fn select_node(&self, params: &Value, cluster: &ClusterView) -> Assignment;

    /// Run the task until its work ends or `ctx` is cancelled.
    async fn execute(&self, params: Value, ctx: TaskContext) -> Result<(), TaskError>;

    /// Called after a task that ignored cancellation has been aborted.
    fn force_stop(&self, _params: &Value) {}
}

struct TaskEntry {
    allocation_id: AllocationId,
    task_name: &'static str,
    params: Value,
    cancel: watch::Sender<bool>,
    status: Arc<watch::Sender<TaskStatus>>,
    abort: AbortHandle,
}

impl TaskEntry {
    fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }
}

/// Dispatches persistent tasks assigned to this node.
pub struct PersistentTasksNodeService {
    node_id: NodeId,
    executors: HashMap<&'static str, Arc<dyn PersistentTaskExecutor>>,
    cancel_timeout: Duration,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    shutting_down: AtomicBool,
}

impl PersistentTasksNodeService {
    pub fn new(
        node_id: NodeId,
        executors: Vec<Arc<dyn PersistentTaskExecutor>>,
        cancel_timeout: Duration,
    ) -> Self {
        let executors = executors
            .into_iter()
            .map(|executor| (executor.task_name(), executor))
            .collect();
        Self {
            node_id,
            executors,
            cancel_timeout,
            tasks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.executors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn executor(&self, task_name: &str) -> Option<&Arc<dyn PersistentTaskExecutor>> {
        self.executors.get(task_name)
    }

    pub fn select_node(
        &self,
        task_name: &str,
        params: &Value,
        cluster: &ClusterView,
    ) -> Result<Assignment, TaskError> {
        let executor = self
            .executor(task_name)
            .ok_or_else(|| TaskError::UnknownTask(task_name.to_string()))?;
        Ok(executor.select_node(params, cluster))
    }

    /// Start an assigned task. A task id that already finished here may be
    /// started again under a newer allocation.
    ///
    /// Finished tasks stay queryable until the next task starts, which
    /// drops them.
    pub fn start_task(
        &self,
        assignment: TaskAssignment,
    ) -> Result<watch::Receiver<TaskStatus>, TaskError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TaskError::ShuttingDown);
        }
        if assignment.executor_node != self.node_id {
            return Err(TaskError::WrongNode {
                task_id: assignment.task_id,
                assigned: assignment.executor_node,
                local: self.node_id,
            });
        }
        let executor = Arc::clone(
            self.executor(&assignment.task_name)
                .ok_or_else(|| TaskError::UnknownTask(assignment.task_name.clone()))?,
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = tasks.get(&assignment.task_id) {
            if !existing.status().is_terminal() {
                return Err(TaskError::AlreadyRunning(assignment.task_id));
            }
        }
        tasks.retain(|_, entry| !entry.status().is_terminal());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let status = Arc::new(watch::channel(TaskStatus::Started).0);
        let status_rx = status.subscribe();
        let ctx = TaskContext {
            task_id: assignment.task_id,
            allocation_id: assignment.allocation_id,
            cancel: cancel_rx.clone(),
            status: Arc::clone(&status),
        };

        let task_id = assignment.task_id;
        let task_name = executor.task_name();
        let params = assignment.params.clone();
        let final_status = Arc::clone(&status);
        let execution = tokio::spawn(async move { executor.execute(params, ctx).await });
        let abort = execution.abort_handle();
        tokio::spawn(async move {
            let result = execution.await;
            let cancelled = *cancel_rx.borrow();
            let outcome = match result {
                Ok(Ok(())) if cancelled => TaskStatus::Cancelled,
                Ok(Ok(())) => TaskStatus::Completed,
                Ok(Err(e)) => {
                    warn!(task_id = %task_id, task = task_name, error = %e, "Persistent task failed");
                    TaskStatus::Failed {
                        reason: e.to_string(),
                    }
                }
                Err(e) if e.is_cancelled() => TaskStatus::Cancelled,
                Err(e) => {
                    error!(task_id = %task_id, task = task_name, error = %e, "Persistent task panicked");
                    TaskStatus::Failed {
                        reason: format!("task panicked: {e}"),
                    }
                }
            };
            info!(task_id = %task_id, task = task_name, status = ?outcome, "Persistent task finished");
            final_status.send_replace(outcome);
        });

        info!(
            task_id = %task_id,
            allocation_id = %assignment.allocation_id,
            task = task_name,
            "Persistent task started"
        );
        tasks.insert(
            task_id,
            TaskEntry {
                allocation_id: assignment.allocation_id,
                task_name,
                params: assignment.params,
                cancel: cancel_tx,
                status,
                abort,
            },
        );

        Ok(status_rx)
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .map(TaskEntry::status)
    }

    pub fn allocation(&self, task_id: &TaskId) -> Option<AllocationId> {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .map(|entry| entry.allocation_id)
    }

    pub fn subscribe(&self, task_id: &TaskId) -> Option<watch::Receiver<TaskStatus>> {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .map(|entry| entry.status.subscribe())
    }

    /// Cancel a running task and wait for it to wind down. A task still
    /// running after the cancel timeout is aborted and its executor told to
    /// force-stop whatever it started.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<TaskStatus, TaskError> {
        let (mut status_rx, status, abort, task_name, params) = {
            let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            let entry = tasks.get(task_id).ok_or(TaskError::NotFound(*task_id))?;
            if entry.status().is_terminal() {
                return Ok(entry.status());
            }
            entry.cancel.send_replace(true);
            (
                entry.status.subscribe(),
                Arc::clone(&entry.status),
                entry.abort.clone(),
                entry.task_name,
                entry.params.clone(),
            )
        };

        info!(task_id = %task_id, task = task_name, "Cancelling persistent task");
        let finished = tokio::time::timeout(
            self.cancel_timeout,
            status_rx.wait_for(TaskStatus::is_terminal),
        )
        .await;

        match finished {
            Ok(Ok(state)) => Ok(state.clone()),
            _ => {
                warn!(
                    task_id = %task_id,
                    task = task_name,
                    timeout_secs = self.cancel_timeout.as_secs(),
                    "Persistent task did not stop in time, aborting"
                );
                abort.abort();
                if let Some(executor) = self.executor(task_name) {
                    executor.force_stop(&params);
                }
                status.send_replace(TaskStatus::Cancelled);
                Ok(TaskStatus::Cancelled)
            }
        }
    }

    /// Tasks on this node that have not finished.
    pub fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|entry| !entry.status().is_terminal())
            .count()
    }

    /// Reject new tasks and cancel all running ones.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let running: Vec<TaskId> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, entry)| !entry.status().is_terminal())
            .map(|(id, _)| *id)
            .collect();

        for task_id in running {
            if let Err(e) = self.cancel_task(&task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to cancel persistent task during shutdown");
            }
        }
    }
}
