//! The schedule: role-tagged queues, a global phase, an error aggregator and
//! an inactivity timeout.
//!
//! # State Machine
//! ```text
//! SetUp -> Running -> Done
//! ```
//! Each transition happens exactly once. `Running` spans every queue,
//! including the waits on out-of-band work at the end of each queue.
//!
//! # Shared State
//! The current task, current queue and error list are the only mutable state
//! shared with out-of-band callers. Readers get a snapshot taken at the
//! instant of the call.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::{ErrorContext, Failure, ScheduleError, TimeoutError, UsageError};
use super::queue::{QueueRole, QueueSnapshot, TaskQueue};
use super::task::{Task, TaskContext};
use crate::config::ScheduleConfig;

/// Global phase of a schedule. Monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    SetUp,
    Running,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::SetUp => write!(f, "SET_UP"),
            Phase::Running => write!(f, "RUNNING"),
            Phase::Done => write!(f, "DONE"),
        }
    }
}

/// Position of a top-level task: which queue, and where in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPosition {
    pub queue: QueueRole,
    pub index: usize,
}

struct ScheduleState {
    phase: Phase,
    current_queue: Option<Arc<TaskQueue>>,
    current_task: Option<Arc<Task>>,
    errors: Vec<ScheduleError>,
    deadline: Option<Instant>,
}

struct ScheduleInner {
    id: Uuid,
    config: ScheduleConfig,
    tasks: Arc<TaskQueue>,
    on_complete: Arc<TaskQueue>,
    on_exception: Arc<TaskQueue>,
    state: Mutex<ScheduleState>,
    /// Number of out-of-band futures still pending
    out_of_band: watch::Sender<usize>,
}

/// Handle to a schedule. Cheap to clone; clones share the same schedule.
#[derive(Clone)]
pub struct Schedule {
    inner: Arc<ScheduleInner>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new(ScheduleConfig::default())
    }
}

impl Schedule {
    pub fn new(config: ScheduleConfig) -> Self {
        let (out_of_band, _) = watch::channel(0);
        Self {
            inner: Arc::new(ScheduleInner {
                id: Uuid::new_v4(),
                config,
                tasks: TaskQueue::new(QueueRole::Tasks),
                on_complete: TaskQueue::new(QueueRole::OnComplete),
                on_exception: TaskQueue::new(QueueRole::OnException),
                state: Mutex::new(ScheduleState {
                    phase: Phase::SetUp,
                    current_queue: None,
                    current_task: None,
                    errors: Vec::new(),
                    deadline: None,
                }),
                out_of_band,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.inner.config
    }

    /// The primary queue.
    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.inner.tasks
    }

    /// Cleanup queue that always runs.
    pub fn on_complete(&self) -> &Arc<TaskQueue> {
        &self.inner.on_complete
    }

    /// Cleanup queue that runs only when an error has been recorded.
    pub fn on_exception(&self) -> &Arc<TaskQueue> {
        &self.inner.on_exception
    }

    pub fn queue(&self, role: QueueRole) -> &Arc<TaskQueue> {
        match role {
            QueueRole::Tasks => self.tasks(),
            QueueRole::OnComplete => self.on_complete(),
            QueueRole::OnException => self.on_exception(),
        }
    }

    /// Queues in execution order.
    pub fn queues(&self) -> [&Arc<TaskQueue>; 3] {
        [self.tasks(), self.on_complete(), self.on_exception()]
    }

    /// Shorthand for scheduling on the primary queue.
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
        self.tasks().schedule(description, body)
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.lock().current_task.clone()
    }

    pub fn current_queue(&self) -> Option<Arc<TaskQueue>> {
        self.lock().current_queue.clone()
    }

    /// Position of the current top-level task, if one is running.
    pub fn current_position(&self) -> Option<TaskPosition> {
        self.lock().current_task.as_ref().map(|task| TaskPosition {
            queue: task.queue(),
            index: task.top_level_index(),
        })
    }

    /// Position that work declared right now belongs to: the current task, or
    /// else the next task of the current queue (the primary queue before the
    /// schedule starts).
    pub fn declaration_position(&self) -> TaskPosition {
        if let Some(position) = self.current_position() {
            return position;
        }
        let queue = self
            .current_queue()
            .unwrap_or_else(|| Arc::clone(self.tasks()));
        TaskPosition {
            queue: queue.role(),
            index: queue.started(),
        }
    }

    /// Errors recorded so far, in detection order.
    pub fn errors(&self) -> Vec<ScheduleError> {
        self.lock().errors.clone()
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }

    pub(crate) fn error_context(&self) -> ErrorContext {
        let state = self.lock();
        ErrorContext {
            phase: state.phase,
            queue: state.current_queue.clone(),
            task: state.current_task.clone(),
        }
    }

    /// Normalize `failure` against the current context and append it to the
    /// error list. Safe to call at any point, including after `Done`.
    pub fn record_error(&self, failure: impl Into<Failure>) -> ScheduleError {
        let error = ScheduleError::normalize(self, failure, None);
        self.lock().errors.push(error.clone());
        self.log_recorded(&error);
        error
    }

    /// Record `error` unless this very error is already in the list.
    ///
    /// A failure is recorded where it is detected; the same error then
    /// travels up to the parent task and its queue without being recorded
    /// again.
    pub(crate) fn record_error_once(&self, error: &ScheduleError) {
        {
            let mut state = self.lock();
            if state.errors.iter().any(|recorded| recorded.is_same_record(error)) {
                return;
            }
            state.errors.push(error.clone());
        }
        self.log_recorded(error);
    }

    fn log_recorded(&self, error: &ScheduleError) {
        tracing::warn!(
            schedule = %self.inner.id,
            phase = %error.phase(),
            queue = ?error.queue(),
            error = %error,
            "schedule error recorded"
        );
    }

    pub(crate) fn enter_queue(&self, queue: &Arc<TaskQueue>) {
        let mut state = self.lock();
        state.current_queue = Some(Arc::clone(queue));
        state.current_task = None;
    }

    pub(crate) fn enter_task(&self, task: &Arc<Task>) {
        self.lock().current_task = Some(Arc::clone(task));
        self.heartbeat();
    }

    pub(crate) fn leave_task(&self) {
        self.lock().current_task = None;
    }

    /// Push the timeout deadline forward by the configured timeout.
    pub fn heartbeat(&self) {
        if let Some(timeout) = self.inner.config.timeout {
            self.lock().deadline = Some(Instant::now() + timeout);
        }
    }

    /// Track a future that is not a task. The queue that is running when it
    /// is registered (and every later one) waits for it before finishing.
    /// If it fails, the error is recorded against whatever is current then.
    pub fn wrap_future<F, T>(&self, future: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.begin_out_of_band();
        let schedule = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match future.await {
                Ok(value) => Some(value),
                Err(error) => {
                    schedule.record_error(error);
                    None
                }
            }
        })
    }

    /// Count one piece of out-of-band work until the guard is dropped.
    pub(crate) fn begin_out_of_band(&self) -> OutOfBandGuard {
        self.inner.out_of_band.send_modify(|count| *count += 1);
        self.heartbeat();
        OutOfBandGuard {
            schedule: self.clone(),
        }
    }

    pub fn pending_out_of_band(&self) -> usize {
        *self.inner.out_of_band.borrow()
    }

    pub(crate) async fn wait_for_out_of_band(&self) {
        let mut pending = self.inner.out_of_band.subscribe();
        if *pending.borrow() > 0 {
            tracing::debug!(schedule = %self.inner.id, "waiting for out-of-band callbacks");
        }
        // Err means the sender was dropped, which cannot happen while `self` lives.
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    /// Run every queue: primary, then always-run cleanup, then error-triggered
    /// cleanup if any error has been recorded. Returns the final error list.
    ///
    /// # Errors
    /// Returns `UsageError::AlreadyStarted` if the schedule is not in `SetUp`.
    pub async fn run_all(&self) -> Result<Vec<ScheduleError>, UsageError> {
        self.start()?;

        self.tasks().run(self).await;
        self.on_complete().run(self).await;
        if self.error_count() > 0 {
            self.on_exception().run(self).await;
        } else {
            self.on_exception().finish();
        }

        self.finish();
        Ok(self.errors())
    }

    /// Run the schedule, enforcing the configured inactivity timeout.
    ///
    /// On expiry the schedule is forced to `Done` and a timeout error naming
    /// every unfinished task is recorded. Work still in flight is abandoned,
    /// not cancelled.
    pub async fn run(&self) -> Result<ScheduleOutcome, UsageError> {
        let Some(timeout) = self.inner.config.timeout else {
            let errors = self.run_all().await?;
            return Ok(ScheduleOutcome::new(errors));
        };

        self.heartbeat();
        tokio::select! {
            biased;
            result = self.run_all() => {
                result?;
            }
            () = self.expired() => {
                self.time_out(timeout);
            }
        }
        Ok(self.outcome())
    }

    async fn expired(&self) {
        loop {
            let deadline = self.lock().deadline;
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return,
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn time_out(&self, timeout: Duration) {
        let mut pending = Vec::new();
        for queue in self.queues() {
            queue.collect_unsettled(&mut pending);
        }
        tracing::warn!(
            schedule = %self.inner.id,
            timeout_ms = timeout.as_millis() as u64,
            unfinished = pending.len(),
            "schedule timed out"
        );
        self.record_error(TimeoutError { timeout, pending });
        self.finish();
    }

    fn start(&self) -> Result<(), UsageError> {
        {
            let mut state = self.lock();
            if state.phase != Phase::SetUp {
                return Err(UsageError::AlreadyStarted);
            }
            state.phase = Phase::Running;
        }
        self.heartbeat();
        tracing::info!(schedule = %self.inner.id, "schedule running");
        Ok(())
    }

    fn finish(&self) {
        {
            let mut state = self.lock();
            if state.phase == Phase::Done {
                return;
            }
            state.phase = Phase::Done;
            state.current_queue = None;
            state.current_task = None;
            state.deadline = None;
        }
        for queue in self.queues() {
            queue.finish();
        }
        tracing::info!(schedule = %self.inner.id, errors = self.error_count(), "schedule done");
    }

    pub fn outcome(&self) -> ScheduleOutcome {
        ScheduleOutcome::new(self.errors())
    }

    /// Full report of every error recorded so far.
    pub fn report(&self) -> String {
        self.outcome().report()
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        let (phase, current_queue, current_task, error_count) = {
            let state = self.lock();
            (
                state.phase,
                state.current_queue.as_ref().map(|queue| queue.role()),
                state.current_task.as_ref().map(|task| task.index()),
                state.errors.len(),
            )
        };
        ScheduleSnapshot {
            id: self.inner.id,
            phase,
            current_queue,
            current_task,
            error_count,
            queues: self.queues().iter().map(|queue| queue.snapshot()).collect(),
        }
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .field("errors", &self.error_count())
            .finish()
    }
}

/// Keeps one unit of out-of-band work pending until dropped.
pub(crate) struct OutOfBandGuard {
    schedule: Schedule,
}

impl Drop for OutOfBandGuard {
    fn drop(&mut self) {
        self.schedule
            .inner
            .out_of_band
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Result of a finished schedule.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    errors: Vec<ScheduleError>,
}

impl ScheduleOutcome {
    fn new(errors: Vec<ScheduleError>) -> Self {
        Self { errors }
    }

    /// Failure if and only if any error was recorded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ScheduleError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<ScheduleError> {
        self.errors
    }

    /// Concatenated renders, with repeated wraps of the same underlying error
    /// collapsed.
    pub fn report(&self) -> String {
        let mut unique: Vec<&ScheduleError> = Vec::new();
        for error in &self.errors {
            if !unique.iter().any(|seen| seen.shares_payload(error)) {
                unique.push(error);
            }
        }
        unique
            .iter()
            .map(|error| error.render())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Serializable view of a schedule and its task trees.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSnapshot {
    pub id: Uuid,
    pub phase: Phase,
    pub current_queue: Option<QueueRole>,
    pub current_task: Option<usize>,
    pub error_count: usize,
    pub queues: Vec<QueueSnapshot>,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::schedule::TaskState;

    fn untimed() -> Schedule {
        Schedule::new(ScheduleConfig {
            timeout: None,
            ..ScheduleConfig::default()
        })
    }

    #[tokio::test]
    async fn test_phase_progresses_through_every_queue() {
        let schedule = untimed();
        let seen: Arc<StdMutex<Vec<(QueueRole, Phase)>>> = Arc::default();

        for role in [QueueRole::Tasks, QueueRole::OnComplete] {
            let seen = Arc::clone(&seen);
            schedule
                .queue(role)
                .schedule("observe", move |ctx| async move {
                    seen.lock().unwrap().push((role, ctx.schedule().phase()));
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(schedule.phase(), Phase::SetUp);
        let errors = assert_ok!(schedule.run_all().await);
        assert!(errors.is_empty());
        assert_eq!(schedule.phase(), Phase::Done);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (QueueRole::Tasks, Phase::Running),
                (QueueRole::OnComplete, Phase::Running)
            ]
        );
    }

    #[tokio::test]
    async fn test_run_all_twice_is_usage_error() {
        let schedule = untimed();
        assert_ok!(schedule.run_all().await);
        let second = assert_err!(schedule.run_all().await);
        assert_eq!(second, UsageError::AlreadyStarted);
        assert_eq!(schedule.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn test_current_task_tracks_execution() {
        let schedule = untimed();
        let first = schedule
            .schedule("first", |ctx| async move {
                let current = ctx.schedule().current_task().unwrap();
                anyhow::ensure!(Arc::ptr_eq(&current, ctx.task()), "wrong current task");
                anyhow::ensure!(
                    ctx.schedule().current_queue().map(|q| q.role()) == Some(QueueRole::Tasks),
                    "wrong current queue"
                );
                Ok(())
            })
            .unwrap();

        assert!(schedule.current_task().is_none());
        assert_ok!(schedule.run_all().await);
        assert_eq!(first.state(), TaskState::Success);
        assert!(schedule.current_task().is_none());
        assert!(schedule.current_queue().is_none());
    }

    #[tokio::test]
    async fn test_error_context_is_snapshotted() {
        let schedule = untimed();
        schedule
            .schedule("fails", |_| async { anyhow::bail!("broke") })
            .unwrap();
        let errors = assert_ok!(schedule.run_all().await);

        let error = &errors[0];
        assert_eq!(error.phase(), Phase::Running);
        assert_eq!(error.queue(), Some(QueueRole::Tasks));
        assert_eq!(error.task().unwrap().label(), "fails");
        assert_eq!(schedule.phase(), Phase::Done);

        let report = error.render();
        assert!(report.starts_with("broke"));
        assert!(report.ends_with("Error detected during task in queue \"tasks\":\n> 1. fails"));
    }

    #[tokio::test]
    async fn test_errors_recorded_outside_tasks_render_their_phase() {
        let schedule = untimed();
        let before = schedule.record_error(anyhow::anyhow!("early"));
        assert_ok!(schedule.run_all().await);
        let after = schedule.record_error(anyhow::anyhow!("late"));

        assert!(before
            .render()
            .ends_with("Error detected before the schedule started running."));
        assert!(after
            .render()
            .ends_with("Error detected after all tasks in the schedule had finished."));
        assert_eq!(schedule.errors(), vec![before, after]);
    }

    #[tokio::test]
    async fn test_queue_waits_for_out_of_band_work() {
        let schedule = untimed();
        let flag = Arc::new(StdMutex::new(false));
        let set = Arc::clone(&flag);

        schedule
            .schedule("kick off", move |ctx| async move {
                ctx.schedule().wrap_future(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    *set.lock().unwrap() = true;
                    Err::<(), _>(anyhow::anyhow!("callback broke"))
                });
                Ok::<(), anyhow::Error>(())
            })
            .unwrap();
        let cleanup_saw = Arc::new(StdMutex::new(false));
        let saw = Arc::clone(&cleanup_saw);
        let observed = Arc::clone(&flag);
        schedule
            .on_complete()
            .schedule("cleanup", move |_| async move {
                *saw.lock().unwrap() = *observed.lock().unwrap();
                Ok(())
            })
            .unwrap();

        let errors = assert_ok!(schedule.run_all().await);
        assert!(*cleanup_saw.lock().unwrap());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].task().is_none());
        assert!(errors[0].render().ends_with(
            "Error detected when waiting for out-of-band callbacks in queue \"tasks\"."
        ));
        assert_eq!(schedule.pending_out_of_band(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_unfinished_tasks() {
        let schedule = Schedule::new(ScheduleConfig {
            timeout: Some(Duration::from_secs(1)),
            ..ScheduleConfig::default()
        });
        schedule
            .schedule("quick", |_| async { Ok(()) })
            .unwrap();
        schedule
            .schedule("stuck", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();
        schedule
            .schedule("never started", |_| async { Ok(()) })
            .unwrap();

        let outcome = assert_ok!(schedule.run().await);
        assert!(!outcome.is_success());
        assert_eq!(schedule.phase(), Phase::Done);

        let error = &outcome.errors()[0];
        assert!(matches!(error.kind(), crate::schedule::ErrorKind::Timeout(_)));
        assert_eq!(
            error.to_string(),
            "The schedule timed out after 1000ms of inactivity.\nUnfinished tasks:\n- tasks > 2. stuck (RUNNING)\n- tasks > 3. never started (WAITING)"
        );
        assert!(schedule
            .tasks()
            .schedule("after timeout", |_| async { Ok(()) })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_task_keeps_running_and_late_failure_is_recorded() {
        let schedule = Schedule::new(ScheduleConfig {
            timeout: Some(Duration::from_secs(1)),
            ..ScheduleConfig::default()
        });
        let task = schedule
            .schedule("slow then fails", |_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                anyhow::bail!("late failure")
            })
            .unwrap();

        let outcome = assert_ok!(schedule.run().await);
        assert_eq!(outcome.errors().len(), 1);
        assert_eq!(task.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(task.state(), TaskState::Error);

        let errors = schedule.errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0].kind(), crate::schedule::ErrorKind::Timeout(_)));
        assert_eq!(errors[1].to_string(), "late failure");
        assert_eq!(errors[1].phase(), Phase::Done);
        assert!(errors[1]
            .render()
            .ends_with("Error detected after all tasks in the schedule had finished."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_failure_survives_a_hanging_sibling() {
        let schedule = Schedule::new(ScheduleConfig {
            timeout: Some(Duration::from_secs(1)),
            ..ScheduleConfig::default()
        });
        schedule
            .schedule("parent", |ctx| async move {
                ctx.spawn_child("fails", |_| async {
                    Err::<(), _>(anyhow::anyhow!("child root cause"))
                })?;
                ctx.spawn_child("hangs", |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        let outcome = assert_ok!(schedule.run().await);
        let errors = outcome.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "child root cause");
        assert!(errors[0]
            .render()
            .ends_with("Error detected during task in queue \"tasks\":\n> 1. parent\n  | 1. fails\n  | 2. hangs"));
        assert_eq!(
            errors[1].to_string(),
            "The schedule timed out after 1000ms of inactivity.\nUnfinished tasks:\n- tasks > 1. parent (RUNNING)\n- tasks > 1. parent > 2. hangs (RUNNING)"
        );
        assert!(outcome.report().contains("child root cause"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_errors_are_recorded_in_detection_order() {
        let schedule = untimed();
        let parent = schedule
            .schedule("parent", |ctx| async move {
                ctx.schedule().wrap_future(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<(), _>(anyhow::anyhow!("out-of-band at t1"))
                });
                ctx.spawn_child("fails first", |_| async {
                    Err::<(), _>(anyhow::anyhow!("child at t0"))
                })?;
                ctx.spawn_child("outlives both", |_| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        let errors = assert_ok!(schedule.run_all().await);
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["child at t0", "out-of-band at t1"]);
        assert_eq!(parent.state(), TaskState::Error);
    }

    #[tokio::test]
    async fn test_error_before_first_queue_names_primary_queue() {
        let schedule = untimed();
        assert_ok!(schedule.start());
        let error = schedule.record_error(anyhow::anyhow!("between start and queue"));
        assert!(error.render().ends_with(
            "Error detected when waiting for out-of-band callbacks in queue \"tasks\"."
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_deadline() {
        let schedule = Schedule::new(ScheduleConfig {
            timeout: Some(Duration::from_millis(500)),
            ..ScheduleConfig::default()
        });
        schedule
            .schedule("keeps beating", |ctx| async move {
                for _ in 0..4 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    ctx.schedule().heartbeat();
                }
                Ok(())
            })
            .unwrap();

        let outcome = assert_ok!(schedule.run().await);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_report_collapses_duplicate_wraps() {
        let schedule = untimed();
        let error = schedule.record_error(anyhow::anyhow!("first marker"));
        schedule.record_error(error.clone());
        schedule.record_error(anyhow::anyhow!("second marker"));

        let outcome = schedule.outcome();
        assert_eq!(outcome.errors().len(), 3);
        let report = outcome.report();
        assert_eq!(report.matches("first marker").count(), 1);
        assert_eq!(report.matches("second marker").count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_serializes_tree() {
        let schedule = untimed();
        schedule
            .schedule("parent", |ctx| async move {
                ctx.spawn_child("child", |_| async { Ok(()) })?;
                Ok(())
            })
            .unwrap();
        assert_ok!(schedule.run_all().await);

        let json = serde_json::to_value(schedule.snapshot()).unwrap();
        assert_eq!(json["phase"], "DONE");
        assert_eq!(json["queues"][0]["role"], "tasks");
        assert_eq!(json["queues"][0]["status"], "FINISHED");
        let parent = &json["queues"][0]["tasks"][0];
        assert_eq!(parent["state"], "SUCCESS");
        assert_eq!(parent["children"][0]["description"], "child");
    }
}
