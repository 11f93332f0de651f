//! Sequential executor for top-level tasks.
//!
//! # Invariants
//! - Insertion order is execution order
//! - At most one top-level task of a queue is RUNNING at any instant
//! - No task can be added once the queue has finished

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::FutureExt;
use serde::Serialize;

use super::error::UsageError;
use super::schedule::Schedule;
use super::task::{Task, TaskContext, TaskSnapshot};

/// What a queue is for, which decides its failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueRole {
    /// Primary work; fails fast on the first error
    Tasks,
    /// Cleanup that always runs every task
    OnComplete,
    /// Cleanup that only runs if the schedule has recorded an error
    OnException,
}

impl QueueRole {
    pub fn name(&self) -> &'static str {
        match self {
            QueueRole::Tasks => "tasks",
            QueueRole::OnComplete => "onComplete",
            QueueRole::OnException => "onException",
        }
    }

    fn aborts_on_error(&self) -> bool {
        matches!(self, QueueRole::Tasks)
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Running,
    Finished,
}

struct QueueState {
    tasks: Vec<Arc<Task>>,
    /// Number of tasks handed to `Task::run` so far
    started: usize,
    status: QueueStatus,
}

/// An ordered queue of top-level tasks with a role tag.
pub struct TaskQueue {
    role: QueueRole,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub(crate) fn new(role: QueueRole) -> Arc<Self> {
        Arc::new(Self {
            role,
            state: Mutex::new(QueueState {
                tasks: Vec::new(),
                started: 0,
                status: QueueStatus::Pending,
            }),
        })
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn status(&self) -> QueueStatus {
        self.lock().status
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.lock().tasks.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks that have been started so far.
    pub fn started(&self) -> usize {
        self.lock().started
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a new WAITING top-level task.
    ///
    /// Tasks may be added while the queue is running (for example from inside
    /// one of its own tasks); they run after everything already queued.
    ///
    /// # Errors
    /// Returns `UsageError::QueueFinished` once the queue has finished.
    #[track_caller]
    pub fn schedule<F, Fut>(
        &self,
        description: impl Into<String>,
        body: F,
    ) -> Result<Arc<Task>, UsageError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let location = Location::caller();
        let mut state = self.lock();
        if state.status == QueueStatus::Finished {
            return Err(UsageError::QueueFinished { queue: self.role });
        }
        let task = Task::new(
            state.tasks.len(),
            Some(description.into()),
            self.role,
            None,
            location,
            Box::new(move |context| body(context).boxed()),
        );
        state.tasks.push(Arc::clone(&task));
        tracing::debug!(queue = %self.role, index = task.index(), task = %task.label(), "task scheduled");
        Ok(task)
    }

    fn next_task(&self) -> Option<Arc<Task>> {
        let mut state = self.lock();
        let task = state.tasks.get(state.started).cloned()?;
        state.started += 1;
        Some(task)
    }

    /// Run every queued task in order, then wait for pending out-of-band work.
    ///
    /// Task errors are recorded on the schedule as soon as they are detected,
    /// not when the task settles.
    /// The primary queue stops starting new tasks once any error has been
    /// recorded during its run; cleanup queues always run everything.
    pub(crate) async fn run(self: &Arc<Self>, schedule: &Schedule) {
        self.lock().status = QueueStatus::Running;
        schedule.enter_queue(self);
        let errors_before = schedule.error_count();
        tracing::info!(queue = %self.role, tasks = self.len(), "queue started");

        loop {
            if self.role.aborts_on_error() && schedule.error_count() > errors_before {
                let skipped = self.len().saturating_sub(self.started());
                tracing::warn!(queue = %self.role, skipped, "queue aborted after error");
                break;
            }
            let Some(task) = self.next_task() else {
                break;
            };
            schedule.enter_task(&task);
            match task.run(schedule) {
                Ok(run) => {
                    if let Err(error) = run.await {
                        schedule.record_error_once(&error);
                    }
                }
                Err(error) => {
                    schedule.record_error(error);
                }
            }
        }

        schedule.leave_task();
        schedule.wait_for_out_of_band().await;
        self.finish();
        tracing::info!(queue = %self.role, "queue finished");
    }

    /// Mark the queue finished so nothing more can be scheduled on it.
    pub(crate) fn finish(&self) {
        self.lock().status = QueueStatus::Finished;
    }

    /// Tree dump of every top-level task, highlighting `highlight` if given.
    pub fn generate_tree(&self, highlight: Option<&Task>) -> String {
        self.tasks()
            .iter()
            .map(|task| task.describe_tree(highlight))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub(crate) fn collect_unsettled(&self, out: &mut Vec<String>) {
        for task in self.tasks() {
            task.collect_unsettled(self.role.name(), out);
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            role: self.role,
            status: self.status(),
            tasks: self.tasks().iter().map(|task| task.snapshot()).collect(),
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TaskQueue")
            .field("role", &self.role)
            .field("status", &state.status)
            .field("tasks", &state.tasks.len())
            .field("started", &state.started)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub role: QueueRole,
    pub status: QueueStatus,
    pub tasks: Vec<TaskSnapshot>,
}
