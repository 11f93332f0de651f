//! # step_schedule
//!
//! Deterministic scheduler for composing and diagnosing asynchronous test steps.
//!
//! This library provides:
//! - Ordered task queues with controlled, cooperative concurrency
//! - A schedule-wide error aggregator that stamps every failure with context
//! - An out-of-band request validator that checks inbound requests against
//!   the order the schedule declared them in
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────────────┐
//!        │                Schedule                  │
//!        │  phase · current task · errors · timeout │
//!        └───────┬──────────────┬───────────────┬───┘
//!                │              │               │
//!                ▼              ▼               ▼
//!        ┌────────────┐ ┌──────────────┐ ┌───────────────┐
//!        │   tasks    │ │  onComplete  │ │  onException  │
//!        │ fail-fast  │ │  always run  │ │  on error     │
//!        └─────┬──────┘ └──────────────┘ └───────────────┘
//!              ▼
//!        Task ─┬─ child
//!              └─ child ── grandchild
//!
//!        RequestValidator ──(current task?)──▶ Schedule
//!                         ──(ScheduleError)──▶ Schedule::record_error
//! ```
//!
//! ## Modules
//! - `schedule`: tasks, queues, the schedule and its error model
//! - `validator`: ordered validation of out-of-band requests
//! - `config`: environment-driven configuration
//! - `logging`: tracing subscriber setup

pub mod config;
pub mod logging;
pub mod schedule;
pub mod validator;

pub use config::ScheduleConfig;
pub use schedule::{
    Phase, QueueRole, Schedule, ScheduleError, ScheduleOutcome, Task, TaskContext, TaskState,
};
pub use validator::{PathPattern, RequestValidator};
