//! Task: a single unit of deferred work owned by a [`TaskQueue`].
//!
//! # State Machine
//! ```text
//! Waiting -> Running -> Success
//!                   \-> Error
//! ```
//!
//! # Invariants
//! - Terminal states are immutable
//! - A task settles only after its own body and every child spawned while it
//!   was running have settled
//! - Top-level tasks are indexed by queue position, children by sibling count
//!
//! [`TaskQueue`]: super::TaskQueue

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use super::error::{ScheduleError, UsageError};
use super::queue::QueueRole;
use super::schedule::Schedule;

/// Deferred body of a task. Invoked at most once.
pub type TaskBody = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Waiting,
    Running,
    Success,
    Error,
}

impl TaskState {
    /// # Property
    /// `is_terminal() => no further transitions`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Waiting => write!(f, "WAITING"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Success => write!(f, "SUCCESS"),
            TaskState::Error => write!(f, "ERROR"),
        }
    }
}

struct TaskInner {
    state: TaskState,
    children: Vec<Arc<Task>>,
    /// First child failure, held only until the task settles
    first_child_error: Option<ScheduleError>,
}

/// A unit of work with a state machine and optional children.
pub struct Task {
    index: usize,
    description: Option<String>,
    queue: QueueRole,
    parent: Option<Weak<Task>>,
    location: &'static Location<'static>,
    body: Mutex<Option<TaskBody>>,
    inner: Mutex<TaskInner>,
    /// Number of spawned children that have not settled yet
    outstanding: watch::Sender<usize>,
}

impl Task {
    pub(crate) fn new(
        index: usize,
        description: Option<String>,
        queue: QueueRole,
        parent: Option<&Arc<Task>>,
        location: &'static Location<'static>,
        body: TaskBody,
    ) -> Arc<Self> {
        let (outstanding, _) = watch::channel(0);
        Arc::new(Self {
            index,
            description: description.filter(|d| !d.is_empty()),
            queue,
            parent: parent.map(Arc::downgrade),
            location,
            body: Mutex::new(Some(body)),
            inner: Mutex::new(TaskInner {
                state: TaskState::Waiting,
                children: Vec::new(),
                first_child_error: None,
            }),
            outstanding,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Description, or a placeholder for anonymous tasks.
    pub fn label(&self) -> &str {
        self.description().unwrap_or("anonymous task")
    }

    /// Role of the queue that owns this task (or its top-level ancestor).
    pub fn queue(&self) -> QueueRole {
        self.queue
    }

    /// Source location where the task was declared.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn parent(&self) -> Option<Arc<Task>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Task>> {
        self.lock().children.clone()
    }

    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    /// Index of the top-level task this task descends from.
    pub fn top_level_index(&self) -> usize {
        match self.parent() {
            Some(parent) => parent.top_level_index(),
            None => self.index,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition WAITING -> RUNNING, start the task, and hand back a future
    /// that resolves once the task settles.
    ///
    /// # Errors
    /// Returns `UsageError::NotWaiting` if the task has already been started.
    pub(crate) fn run(
        self: &Arc<Self>,
        schedule: &Schedule,
    ) -> Result<BoxFuture<'static, Result<(), ScheduleError>>, UsageError> {
        let body = {
            let mut inner = self.lock();
            if inner.state != TaskState::Waiting {
                return Err(UsageError::NotWaiting {
                    task: self.label().to_string(),
                    state: inner.state,
                });
            }
            let body = self
                .body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match body {
                Some(body) => {
                    inner.state = TaskState::Running;
                    body
                }
                None => {
                    return Err(UsageError::NotWaiting {
                        task: self.label().to_string(),
                        state: inner.state,
                    })
                }
            }
        };
        tracing::debug!(task = %self.label(), index = self.index, queue = %self.queue, "task running");

        // Settlement runs detached: dropping the returned future abandons the
        // task without cancelling it, and late failures are still recorded.
        let settled = tokio::spawn(Arc::clone(self).execute(body, schedule.clone()));
        let schedule = schedule.clone();
        let label = self.label().to_string();
        Ok(async move {
            match settled.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(ScheduleError::normalize(
                    &schedule,
                    anyhow::anyhow!("task \"{}\" was abandoned: {}", label, join_error),
                    None,
                )),
            }
        }
        .boxed())
    }

    async fn execute(
        self: Arc<Self>,
        body: TaskBody,
        schedule: Schedule,
    ) -> Result<(), ScheduleError> {
        let context = TaskContext {
            schedule: schedule.clone(),
            task: Arc::clone(&self),
        };

        let body_result = match tokio::spawn(body(context)).await {
            Ok(result) => result.map_err(|e| ScheduleError::normalize(&schedule, e, None)),
            Err(join_error) => Err(ScheduleError::normalize(
                &schedule,
                anyhow::anyhow!("task \"{}\" panicked: {}", self.label(), join_error),
                None,
            )),
        };
        if let Err(error) = &body_result {
            schedule.record_error_once(error);
        }

        let child_error = self.drain_children().await;

        let outcome = match (body_result, child_error) {
            (Err(error), _) => Err(error),
            (Ok(()), Some(error)) => Err(error),
            (Ok(()), None) => Ok(()),
        };
        self.settle(&outcome);
        outcome
    }

    /// Wait until every spawned child has settled and take the first child
    /// failure. The task stays RUNNING until this returns.
    async fn drain_children(&self) -> Option<ScheduleError> {
        let mut outstanding = self.outstanding.subscribe();
        loop {
            // Err means the sender was dropped, which cannot happen while `self` lives.
            let _ = outstanding.wait_for(|count| *count == 0).await;
            let mut inner = self.lock();
            // Children are only added under this lock, so the count is stable here.
            if *self.outstanding.borrow() == 0 {
                return inner.first_child_error.take();
            }
        }
    }

    fn settle(&self, outcome: &Result<(), ScheduleError>) {
        let mut inner = self.lock();
        inner.state = match outcome {
            Ok(()) => TaskState::Success,
            Err(_) => TaskState::Error,
        };
        match outcome {
            Ok(()) => tracing::debug!(task = %self.label(), index = self.index, "task succeeded"),
            Err(error) => {
                tracing::debug!(task = %self.label(), index = self.index, error = %error, "task failed")
            }
        }
    }

    /// Register a new child. Fails unless this task is RUNNING.
    fn add_child(
        self: &Arc<Self>,
        description: Option<String>,
        location: &'static Location<'static>,
        body: TaskBody,
    ) -> Result<Arc<Task>, UsageError> {
        let mut inner = self.lock();
        if inner.state != TaskState::Running {
            return Err(UsageError::NotRunning {
                task: self.label().to_string(),
                state: inner.state,
            });
        }
        let child = Task::new(
            inner.children.len(),
            description,
            self.queue,
            Some(self),
            location,
            body,
        );
        inner.children.push(Arc::clone(&child));
        self.outstanding.send_modify(|count| *count += 1);
        Ok(child)
    }

    fn child_settled(&self, outcome: &Result<(), ScheduleError>) {
        {
            let mut inner = self.lock();
            if let Err(error) = outcome {
                inner.first_child_error.get_or_insert_with(|| error.clone());
            }
        }
        self.outstanding.send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Render this task and its descendants as indented text.
    ///
    /// The highlighted task is marked with `>`, every other task with `|`.
    pub fn describe_tree(&self, highlight: Option<&Task>) -> String {
        let marker = match highlight {
            Some(task) if std::ptr::eq(task, self) => '>',
            _ => '|',
        };
        let mut out = format!("{} {}. {}", marker, self.index + 1, self.label());
        for child in self.children() {
            for line in child.describe_tree(highlight).lines() {
                out.push_str("\n  ");
                out.push_str(line);
            }
        }
        out
    }

    /// Append a breadcrumb for this task and every descendant that has not
    /// reached a terminal state.
    pub(crate) fn collect_unsettled(&self, prefix: &str, out: &mut Vec<String>) {
        let path = format!("{} > {}. {}", prefix, self.index + 1, self.label());
        let state = self.state();
        if !state.is_terminal() {
            out.push(format!("{} ({})", path, state));
        }
        for child in self.children() {
            child.collect_unsettled(&path, out);
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let (state, children) = {
            let inner = self.lock();
            (inner.state, inner.children.clone())
        };
        TaskSnapshot {
            index: self.index,
            description: self.description.clone(),
            state,
            location: self.location.to_string(),
            children: children.iter().map(|child| child.snapshot()).collect(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("index", &self.index)
            .field("description", &self.description)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .field("location", &self.location)
            .finish()
    }
}

/// Serializable view of a task tree.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub index: usize,
    pub description: Option<String>,
    pub state: TaskState,
    pub location: String,
    pub children: Vec<TaskSnapshot>,
}

/// Handle given to a running task body: the schedule it belongs to and the
/// task itself.
#[derive(Clone)]
pub struct TaskContext {
    schedule: Schedule,
    task: Arc<Task>,
}

impl TaskContext {
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Spawn a child task that starts right away, concurrently with its
    /// siblings. The parent does not settle until the child has.
    ///
    /// # Errors
    /// Returns `UsageError::NotRunning` if this context's task has already
    /// settled.
    #[track_caller]
    pub fn spawn_child<F, Fut, T>(
        &self,
        description: impl Into<String>,
        body: F,
    ) -> Result<ChildHandle<T>, UsageError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let location = Location::caller();
        let (value_tx, value_rx) = oneshot::channel();
        let body: TaskBody = Box::new(move |context| {
            async move {
                let value = body(context).await?;
                let _ = value_tx.send(value);
                anyhow::Ok(())
            }
            .boxed()
        });

        let parent = &self.task;
        let child = parent.add_child(Some(description.into()), location, body)?;
        let run = match child.run(&self.schedule) {
            Ok(run) => run,
            Err(error) => {
                // Only reachable if the fresh child was started elsewhere.
                let failed = ScheduleError::normalize(&self.schedule, error.clone(), None);
                self.schedule.record_error_once(&failed);
                parent.child_settled(&Err(failed));
                return Err(error);
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        let parent = Arc::clone(parent);
        let schedule = self.schedule.clone();
        let label = child.label().to_string();
        tokio::spawn(async move {
            let outcome = run.await;
            parent.child_settled(&outcome);
            let result = match outcome {
                Ok(()) => value_rx.await.map_err(|_| {
                    ScheduleError::normalize(
                        &schedule,
                        anyhow::anyhow!("task \"{}\" finished without a value", label),
                        None,
                    )
                }),
                Err(error) => Err(error),
            };
            let _ = result_tx.send(result);
        });

        Ok(ChildHandle {
            task: child,
            schedule: self.schedule.clone(),
            result: result_rx,
        })
    }
}

/// Eventual result of a child task. Awaiting it is optional: the parent waits
/// for the child either way.
pub struct ChildHandle<T> {
    task: Arc<Task>,
    schedule: Schedule,
    result: oneshot::Receiver<Result<T, ScheduleError>>,
}

impl<T> ChildHandle<T> {
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }
}

impl<T> Unpin for ChildHandle<T> {}

impl<T> Future for ChildHandle<T> {
    type Output = Result<T, ScheduleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.result).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                let error = anyhow::anyhow!("task \"{}\" was abandoned", self.task.label());
                Poll::Ready(Err(ScheduleError::normalize(&self.schedule, error, None)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::ScheduleConfig;

    fn schedule() -> Schedule {
        Schedule::new(ScheduleConfig::default())
    }

    fn fail(message: &'static str) -> impl Future<Output = anyhow::Result<()>> {
        async move { Err(anyhow::Error::msg(message)) }
    }

    #[tokio::test]
    async fn test_body_success_settles_success() {
        let schedule = schedule();
        let task = schedule.tasks().schedule("ok", |_| async { Ok(()) }).unwrap();

        let errors = schedule.run_all().await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(task.state(), TaskState::Success);
    }

    #[tokio::test]
    async fn test_run_twice_is_usage_error() {
        let schedule = schedule();
        let task = schedule.tasks().schedule("once", |_| async { Ok(()) }).unwrap();

        let run = task.run(&schedule).unwrap();
        let again = task.run(&schedule);
        assert!(matches!(
            again,
            Err(UsageError::NotWaiting { state: TaskState::Running, .. })
        ));

        run.await.unwrap();
        assert!(matches!(
            task.run(&schedule),
            Err(UsageError::NotWaiting { state: TaskState::Success, .. })
        ));
    }

    #[tokio::test]
    async fn test_parent_waits_for_children() {
        let schedule = schedule();
        let child_done = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&child_done);

        let task = schedule
            .tasks()
            .schedule("parent", move |ctx| async move {
                ctx.spawn_child("slow child", move |_| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    seen.store(true, Ordering::SeqCst);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        let run = task.run(&schedule).unwrap();
        run.await.unwrap();

        assert!(child_done.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Success);
        assert_eq!(task.children()[0].state(), TaskState::Success);
    }

    #[tokio::test]
    async fn test_child_error_fails_parent_after_all_children_settle() {
        let schedule = schedule();
        let sibling_done = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&sibling_done);

        let task = schedule
            .tasks()
            .schedule("parent", move |ctx| async move {
                ctx.spawn_child("fails", |_| fail("child broke"))?;
                ctx.spawn_child("slow", move |_| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    seen.store(true, Ordering::SeqCst);
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        let error = task.run(&schedule).unwrap().await.unwrap_err();
        assert_eq!(error.to_string(), "child broke");
        assert!(sibling_done.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Error);
        let children = task.children();
        assert_eq!(children[0].state(), TaskState::Error);
        assert_eq!(children[1].state(), TaskState::Success);
    }

    #[tokio::test]
    async fn test_body_error_takes_precedence_over_child_error() {
        let schedule = schedule();
        let task = schedule
            .tasks()
            .schedule("parent", |ctx| async move {
                ctx.spawn_child("fails", |_| fail("child broke"))?;
                anyhow::bail!("body broke")
            })
            .unwrap();

        let error = task.run(&schedule).unwrap().await.unwrap_err();
        assert_eq!(error.to_string(), "body broke");
    }

    #[tokio::test]
    async fn test_child_handle_yields_value() {
        let schedule = schedule();
        let task = schedule
            .tasks()
            .schedule("parent", |ctx| async move {
                let answer = ctx.spawn_child("compute", |_| async { Ok(42) })?.await?;
                anyhow::ensure!(answer == 42, "unexpected answer {}", answer);
                Ok(())
            })
            .unwrap();

        task.run(&schedule).unwrap().await.unwrap();
        assert_eq!(task.children()[0].index(), 0);
    }

    #[tokio::test]
    async fn test_awaited_child_error_is_not_rewrapped() {
        let schedule = schedule();
        let task = schedule
            .tasks()
            .schedule("parent", |ctx| async move {
                ctx.spawn_child("fails", |_| fail("child broke"))?
                    .await?;
                Ok(())
            })
            .unwrap();

        let errors = schedule.run_all().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(task.state(), TaskState::Error);
        assert_eq!(errors[0].to_string(), "child broke");
    }

    #[tokio::test]
    async fn test_spawn_child_after_settle_is_usage_error() {
        let schedule = schedule();
        let (ctx_tx, ctx_rx) = oneshot::channel();
        schedule
            .tasks()
            .schedule("leaks its context", move |ctx| async move {
                let _ = ctx_tx.send(ctx);
                Ok(())
            })
            .unwrap();

        schedule.run_all().await.unwrap();
        let ctx: TaskContext = ctx_rx.await.unwrap();
        let result = ctx.spawn_child("late", |_| async { Ok(()) });
        assert!(matches!(
            result,
            Err(UsageError::NotRunning { state: TaskState::Success, .. })
        ));
    }

    #[tokio::test]
    async fn test_panicking_body_settles_error() {
        let schedule = schedule();
        let task = schedule
            .tasks()
            .schedule("panics", |_| async { panic!("kaboom") })
            .unwrap();

        let error = task.run(&schedule).unwrap().await.unwrap_err();
        assert!(error.to_string().contains("task \"panics\" panicked"));
        assert_eq!(task.state(), TaskState::Error);
    }

    #[tokio::test]
    async fn test_describe_tree_marks_highlight() {
        let schedule = schedule();
        let task = schedule
            .tasks()
            .schedule("parent", |ctx| async move {
                ctx.spawn_child("first", |_| async { Ok(()) })?;
                ctx.spawn_child("", |ctx| async move {
                    ctx.spawn_child("nested", |_| async { Ok(()) })?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        task.run(&schedule).unwrap().await.unwrap();

        let second = task.children()[1].clone();
        assert_eq!(
            task.describe_tree(Some(&second)),
            "| 1. parent\n  | 1. first\n  > 2. anonymous task\n    | 1. nested"
        );
        assert_eq!(second.children()[0].top_level_index(), 0);
    }
}
