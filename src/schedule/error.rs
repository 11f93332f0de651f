//! Schedule-wide error model.
//!
//! Every failure observed while a schedule runs is normalized into a
//! [`ScheduleError`], which snapshots where the schedule was at the moment the
//! failure was detected.
//!
//! # Invariants
//! - Once constructed, a `ScheduleError` never changes, even if the schedule
//!   moves on to other tasks or phases
//! - Normalizing an error that is already a `ScheduleError` returns it as is

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use thiserror::Error;

use super::queue::{QueueRole, TaskQueue};
use super::schedule::{Phase, Schedule};
use super::task::{Task, TaskState};

/// API misuse. Surfaced immediately at the call site, never queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("cannot schedule a task in queue \"{queue}\" after it has finished running")]
    QueueFinished { queue: QueueRole },

    #[error("cannot run task \"{task}\": it is {state}, not WAITING")]
    NotWaiting { task: String, state: TaskState },

    #[error("cannot spawn a child of task \"{task}\": it is {state}, not RUNNING")]
    NotRunning { task: String, state: TaskState },

    #[error("the schedule has already started running")]
    AlreadyStarted,
}

/// An out-of-band request arrived out of order or with the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimingError {
    #[error("received {method} {path} when no more requests were expected.")]
    Unexpected { method: Method, path: String },

    #[error("received {method} {path} earlier than expected.")]
    TooEarly { method: Method, path: String },

    #[error("expected {expected_method} {expected_path}, but got {method} {path}.")]
    Mismatch {
        expected_method: Method,
        expected_path: String,
        method: Method,
        path: String,
    },
}

/// The schedule went longer than its timeout without making progress.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "The schedule timed out after {}ms of inactivity.{}",
    .timeout.as_millis(),
    render_pending(.pending)
)]
pub struct TimeoutError {
    /// Configured inactivity timeout
    pub timeout: Duration,
    /// Every task that was still non-terminal when the deadline passed
    pub pending: Vec<String>,
}

fn render_pending(pending: &[String]) -> String {
    if pending.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nUnfinished tasks:");
    for task in pending {
        out.push_str("\n- ");
        out.push_str(task);
    }
    out
}

/// Tagged payload of a [`ScheduleError`].
#[derive(Debug, Clone)]
pub enum ErrorKind {
    /// A task body, child, handler or wrapped future failed
    Body(Arc<anyhow::Error>),
    Timing(TimingError),
    Timeout(TimeoutError),
    Usage(UsageError),
}

impl ErrorKind {
    fn carried_backtrace(&self) -> Option<String> {
        match self {
            ErrorKind::Body(error) => captured(error.backtrace()),
            _ => None,
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ErrorKind::Body(a), ErrorKind::Body(b)) => Arc::ptr_eq(a, b),
            (ErrorKind::Timing(a), ErrorKind::Timing(b)) => a == b,
            (ErrorKind::Timeout(a), ErrorKind::Timeout(b)) => a == b,
            (ErrorKind::Usage(a), ErrorKind::Usage(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Body(error) => write!(f, "{:#}", error),
            ErrorKind::Timing(error) => write!(f, "{}", error),
            ErrorKind::Timeout(error) => write!(f, "{}", error),
            ErrorKind::Usage(error) => write!(f, "{}", error),
        }
    }
}

/// Anything that can be normalized into a [`ScheduleError`].
#[derive(Debug)]
pub enum Failure {
    /// Already wrapped; normalization keeps its original context
    Scheduled(ScheduleError),
    Kind(ErrorKind),
}

impl From<ScheduleError> for Failure {
    fn from(error: ScheduleError) -> Self {
        Failure::Scheduled(error)
    }
}

impl From<ErrorKind> for Failure {
    fn from(kind: ErrorKind) -> Self {
        Failure::Kind(kind)
    }
}

impl From<anyhow::Error> for Failure {
    /// A `ScheduleError` that travelled through `?` inside a body is unwrapped
    /// back out so its original context survives.
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ScheduleError>() {
            Ok(wrapped) => Failure::Scheduled(wrapped),
            Err(other) => Failure::Kind(ErrorKind::Body(Arc::new(other))),
        }
    }
}

impl From<TimingError> for Failure {
    fn from(error: TimingError) -> Self {
        Failure::Kind(ErrorKind::Timing(error))
    }
}

impl From<TimeoutError> for Failure {
    fn from(error: TimeoutError) -> Self {
        Failure::Kind(ErrorKind::Timeout(error))
    }
}

impl From<UsageError> for Failure {
    fn from(error: UsageError) -> Self {
        Failure::Kind(ErrorKind::Usage(error))
    }
}

/// Where the schedule was when an error was detected.
#[derive(Clone)]
pub(crate) struct ErrorContext {
    pub phase: Phase,
    pub queue: Option<Arc<TaskQueue>>,
    pub task: Option<Arc<Task>>,
}

struct ErrorRecord {
    kind: ErrorKind,
    stack_trace: Option<String>,
    context: ErrorContext,
}

/// A normalized, context-stamped error.
///
/// Cloning is cheap and clones compare equal. Equality is structural over
/// (task, queue, phase at detection, payload), where body payloads compare
/// by identity.
#[derive(Clone)]
pub struct ScheduleError {
    inner: Arc<ErrorRecord>,
}

impl ScheduleError {
    /// Wrap `failure`, snapshotting the schedule's current task, queue and phase.
    ///
    /// # Postconditions
    /// - If `failure` is already a `ScheduleError`, it is returned unchanged
    /// - Otherwise the stack trace is `stack_trace`, else the one carried by
    ///   the error, else a freshly captured one (if backtraces are enabled)
    pub fn normalize(
        schedule: &Schedule,
        failure: impl Into<Failure>,
        stack_trace: Option<String>,
    ) -> Self {
        let kind = match failure.into() {
            Failure::Scheduled(error) => return error,
            Failure::Kind(kind) => kind,
        };
        let stack_trace = stack_trace
            .or_else(|| kind.carried_backtrace())
            .or_else(|| captured(&Backtrace::capture()));
        Self {
            inner: Arc::new(ErrorRecord {
                kind,
                stack_trace,
                context: schedule.error_context(),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.inner.stack_trace.as_deref()
    }

    /// Phase of the schedule when the error was detected.
    pub fn phase(&self) -> Phase {
        self.inner.context.phase
    }

    /// Task that was current when the error was detected.
    pub fn task(&self) -> Option<&Arc<Task>> {
        self.inner.context.task.as_ref()
    }

    /// Queue that was current when the error was detected.
    pub fn queue(&self) -> Option<QueueRole> {
        self.inner.context.queue.as_ref().map(|queue| queue.role())
    }

    /// Whether both handles point at the same recorded error.
    pub(crate) fn is_same_record(&self, other: &ScheduleError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether both errors wrap the same underlying failure.
    pub fn shares_payload(&self, other: &ScheduleError) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        matches!(
            (&self.inner.kind, &other.inner.kind),
            (ErrorKind::Body(a), ErrorKind::Body(b)) if Arc::ptr_eq(a, b)
        )
    }

    /// Multi-line report: message, indented stack trace, and where the
    /// schedule was when the error was detected.
    pub fn render(&self) -> String {
        let mut out = self.inner.kind.to_string();

        if let Some(trace) = self.stack_trace().map(str::trim_end) {
            if !trace.is_empty() {
                out.push_str("\n\nStack trace:");
                for line in trace.lines() {
                    out.push_str("\n| ");
                    out.push_str(line);
                }
            }
        }

        out.push_str("\n\n");
        let context = &self.inner.context;
        match (&context.task, &context.queue, context.phase) {
            (Some(task), queue, _) => {
                let role = queue.as_ref().map(|q| q.role()).unwrap_or(task.queue());
                out.push_str(&format!(
                    "Error detected during task in queue \"{}\":\n",
                    role
                ));
                let tree = match queue {
                    Some(queue) => queue.generate_tree(Some(task)),
                    None => task.describe_tree(Some(task)),
                };
                out.push_str(&tree);
            }
            (None, _, Phase::Done) => {
                out.push_str("Error detected after all tasks in the schedule had finished.");
            }
            (None, queue, Phase::Running) => {
                // Between start and the first queue, the primary queue is the one pending.
                let role = queue.as_ref().map_or(QueueRole::Tasks, |q| q.role());
                out.push_str(&format!(
                    "Error detected when waiting for out-of-band callbacks in queue \"{}\".",
                    role
                ));
            }
            (None, _, Phase::SetUp) => {
                out.push_str("Error detected before the schedule started running.");
            }
        }
        out
    }
}

fn captured(backtrace: &Backtrace) -> Option<String> {
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

impl PartialEq for ScheduleError {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (a, b) = (&self.inner.context, &other.inner.context);
        let same_task = match (&a.task, &b.task) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            (None, None) => true,
            _ => false,
        };
        same_task
            && self.queue() == other.queue()
            && a.phase == b.phase
            && self.inner.kind == other.inner.kind
    }
}

impl fmt::Debug for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleError")
            .field("kind", &self.inner.kind)
            .field("phase", &self.phase())
            .field("queue", &self.queue())
            .field("task", &self.task().map(|task| task.label()))
            .finish()
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.kind, f)
    }
}

impl std::error::Error for ScheduleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner.kind {
            ErrorKind::Body(error) => {
                let source: &(dyn std::error::Error + Send + Sync + 'static) =
                    (**error).as_ref();
                Some(source)
            }
            ErrorKind::Timing(error) => Some(error),
            ErrorKind::Timeout(error) => Some(error),
            ErrorKind::Usage(error) => Some(error),
        }
    }
}
