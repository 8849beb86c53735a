//! Run domain model: statuses, replay logs, tasks, transition requests, and
//! the transition table.

pub mod request;
pub mod state;
pub mod table;
pub mod task;

pub use request::{Concurrency, TransitionRequest};
pub use state::{
    ChildWaitEntry, ChildWaitOutcome, EventWaitEntry, EventWaitOutcome, RunOptions, RunStatus,
    ScheduleReason, SerializableError, SleepEntry, SleepOutcome, StatusKind, TransitionRecord,
    TriggerStrategy, WorkflowRun,
};
pub use table::is_allowed;
pub use task::{task_path, TaskState};
