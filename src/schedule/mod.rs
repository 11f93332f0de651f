//! Scheduling kernel - tasks, queues, the schedule and its error model.
//!
//! This module is designed around a few explicit state machines:
//! - `Task`: Waiting -> Running -> {Success, Error}
//! - `TaskQueue`: Pending -> Running -> Finished
//! - `Schedule`: SetUp -> Running -> Done
//!
//! Concurrency is cooperative: top-level tasks of a queue run strictly one
//! after another, children of a task run concurrently with each other, and a
//! parent never settles before its children.

mod error;
mod queue;
#[allow(clippy::module_inception)]
mod schedule;
mod task;

pub use error::{ErrorKind, Failure, ScheduleError, TimeoutError, TimingError, UsageError};
pub use queue::{QueueRole, QueueSnapshot, QueueStatus, TaskQueue};
pub use schedule::{Phase, Schedule, ScheduleOutcome, ScheduleSnapshot, TaskPosition};
pub use task::{ChildHandle, Task, TaskBody, TaskContext, TaskSnapshot, TaskState};
