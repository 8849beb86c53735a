//! Workflow run model
//!
//! The run is the unit of durable execution: one instance of a workflow
//! version, owned exclusively by the state machine. Workers hold read-only
//! snapshots plus the revision they last observed.
//!
//! Sleep, event-wait, and child-wait histories are *named, append-only
//! replay logs*: the Nth time a handler reaches the call site for name `x`
//! during replay, it consults the Nth entry of log `x`. If the entry is
//! absent the handler suspends and the engine appends one. Re-running the
//! handler from the top therefore reproduces the same wait sequence, which
//! is what makes suspension crash-safe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryStrategy;
use crate::run::task::TaskState;

/// The bare status discriminant, without per-status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Scheduled,
    Queued,
    Running,
    Paused,
    Sleeping,
    AwaitingEvent,
    AwaitingRetry,
    AwaitingChildWorkflow,
    Cancelled,
    Completed,
    Failed,
}

impl StatusKind {
    /// Terminal statuses admit no transitions except an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Sleeping => "sleeping",
            Self::AwaitingEvent => "awaiting_event",
            Self::AwaitingRetry => "awaiting_retry",
            Self::AwaitingChildWorkflow => "awaiting_child_workflow",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a run was (re-)scheduled.
///
/// The transition table refines `scheduled` destinations by reason: a run
/// leaving `sleeping` may only re-enter `scheduled` with `new`, `awake`, or
/// `awake_early`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleReason {
    /// Fresh creation, or an explicit restart of a paused/terminal run.
    New,
    /// Operator resume of a paused run.
    Resume,
    /// A run-level retry delay elapsed.
    Retry,
    /// A task-level retry delay elapsed inside a running run.
    TaskRetry,
    /// A sleep elapsed.
    Awake,
    /// A sleep was interrupted before its deadline.
    AwakeEarly,
    /// An awaited event arrived or timed out.
    Event,
    /// An awaited child workflow settled or timed out.
    ChildWorkflow,
}

impl std::fmt::Display for ScheduleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::TaskRetry => "task_retry",
            Self::Awake => "awake",
            Self::AwakeEarly => "awake_early",
            Self::Event => "event",
            Self::ChildWorkflow => "child_workflow",
        };
        write!(f, "{s}")
    }
}

/// Structured capture of a handler or task failure.
///
/// Handler exceptions never cross the suspend boundary raw; they are carried
/// as values and drive the retry/failed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableError {
    /// Error classification (e.g. the source error type name).
    pub kind: String,

    /// Human-readable message.
    pub message: String,

    /// Optional stack or cause chain, for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializableError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for SerializableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Run status with per-status payloads.
///
/// All timestamps are absolute: duration-relative request fields are
/// converted before a status is stored (see [`crate::run::request`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for `scheduled_at` to elapse, then eligible for the queue.
    Scheduled {
        scheduled_at: DateTime<Utc>,
        reason: ScheduleReason,
    },

    /// Published to the broker, waiting for a worker.
    Queued { queued_at: DateTime<Utc> },

    /// A worker is executing the handler.
    Running { started_at: DateTime<Utc> },

    /// Operator-paused; only resume or cancel applies.
    Paused { paused_at: DateTime<Utc> },

    /// Suspended on a named sleep.
    Sleeping {
        name: String,
        awake_at: DateTime<Utc>,
    },

    /// Suspended waiting for a named event.
    AwaitingEvent {
        event_name: String,
        timeout_at: Option<DateTime<Utc>>,
    },

    /// Suspended until the run-level retry delay elapses.
    AwaitingRetry {
        next_attempt_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializableError>,
    },

    /// Suspended waiting for a child run to reach an expected status.
    AwaitingChildWorkflow {
        child_workflow_run_id: Uuid,
        child_name: String,
        expected_status: StatusKind,
        timeout_at: Option<DateTime<Utc>>,
    },

    /// Terminal: cancelled by an operator or a cascading parent cancel.
    Cancelled {
        cancelled_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Terminal: handler returned successfully.
    Completed {
        completed_at: DateTime<Utc>,
        output: serde_json::Value,
    },

    /// Terminal: retries exhausted or a non-retryable failure.
    Failed {
        failed_at: DateTime<Utc>,
        error: SerializableError,
    },
}

impl RunStatus {
    /// The status discriminant.
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Scheduled { .. } => StatusKind::Scheduled,
            Self::Queued { .. } => StatusKind::Queued,
            Self::Running { .. } => StatusKind::Running,
            Self::Paused { .. } => StatusKind::Paused,
            Self::Sleeping { .. } => StatusKind::Sleeping,
            Self::AwaitingEvent { .. } => StatusKind::AwaitingEvent,
            Self::AwaitingRetry { .. } => StatusKind::AwaitingRetry,
            Self::AwaitingChildWorkflow { .. } => StatusKind::AwaitingChildWorkflow,
            Self::Cancelled { .. } => StatusKind::Cancelled,
            Self::Completed { .. } => StatusKind::Completed,
            Self::Failed { .. } => StatusKind::Failed,
        }
    }

    /// The schedule reason, when the status is `scheduled`.
    pub fn schedule_reason(&self) -> Option<ScheduleReason> {
        match self {
            Self::Scheduled { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// One entry of a named sleep log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepEntry {
    pub started_at: DateTime<Utc>,
    pub awake_at: DateTime<Utc>,
    pub outcome: SleepOutcome,
}

/// Resolution of a sleep entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SleepOutcome {
    /// The run is still sleeping on this entry.
    Open,

    /// The sleep elapsed; `duration_ms` is the measured wall-clock time
    /// between entering and leaving the sleep.
    Completed { duration_ms: u64 },

    /// The run left the sleep for another reason (cancel, early wake).
    Cancelled,
}

impl SleepEntry {
    pub fn is_open(&self) -> bool {
        matches!(self.outcome, SleepOutcome::Open)
    }
}

/// One entry of a named event-wait log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWaitEntry {
    pub started_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub outcome: EventWaitOutcome,
}

/// Resolution of an event wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventWaitOutcome {
    /// Still waiting.
    Open,

    /// The event arrived with this payload.
    Received {
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    },

    /// The wait deadline elapsed with no event.
    Timeout { timed_out_at: DateTime<Utc> },

    /// The run left the wait for another reason.
    Cancelled,
}

impl EventWaitEntry {
    pub fn is_open(&self) -> bool {
        matches!(self.outcome, EventWaitOutcome::Open)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, EventWaitOutcome::Timeout { .. })
    }
}

/// One entry of a named child-workflow wait log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWaitEntry {
    pub child_workflow_run_id: Uuid,
    pub expected_status: StatusKind,
    pub started_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub outcome: ChildWaitOutcome,
}

/// Resolution of a child-workflow wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildWaitOutcome {
    /// Still waiting on the child.
    Open,

    /// The child reached the expected status.
    Satisfied { status: StatusKind },

    /// The wait deadline elapsed first.
    Timeout { timed_out_at: DateTime<Utc> },

    /// The wait was abandoned (cancel, restart).
    Cancelled,
}

impl ChildWaitEntry {
    pub fn is_open(&self) -> bool {
        matches!(self.outcome, ChildWaitOutcome::Open)
    }
}

/// When a newly created run first becomes eligible for the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerStrategy {
    /// Eligible immediately.
    Immediate,

    /// Eligible after a relative delay.
    Delayed { delay_ms: u64 },

    /// Eligible at an absolute instant.
    StartAt { at: DateTime<Utc> },
}

impl Default for TriggerStrategy {
    fn default() -> Self {
        Self::Immediate
    }
}

impl TriggerStrategy {
    /// Resolve the initial `scheduled_at` against server time.
    pub fn scheduled_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Immediate => now,
            Self::Delayed { delay_ms } => now + chrono::Duration::milliseconds(*delay_ms as i64),
            Self::StartAt { at } => *at,
        }
    }
}

/// Options fixed at run creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Deduplication key, scoped by workflow name + version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// When the run first becomes eligible.
    #[serde(default)]
    pub trigger: TriggerStrategy,

    /// Routes the run to a sharded broker stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,

    /// The recurring schedule that created this run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,

    /// Run-level retry strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
}

/// Immutable record of one applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: StatusKind,
    pub to: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ScheduleReason>,
    pub at: DateTime<Utc>,
    /// Revision after this transition was applied.
    pub revision: u64,
}

/// One execution instance of a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_name: String,
    pub version_id: String,

    /// Monotonic per-run counter; every mutation bumps it by one.
    pub revision: u64,

    /// Execution attempts (entries into `running`), distinct from revision.
    pub attempts: u32,

    pub status: RunStatus,
    pub input: serde_json::Value,
    pub options: RunOptions,

    /// Task state keyed by content-addressed task path.
    #[serde(default)]
    pub tasks: HashMap<String, TaskState>,

    /// Named sleep replay logs.
    #[serde(default)]
    pub sleeps: HashMap<String, Vec<SleepEntry>>,

    /// Named event-wait replay logs.
    #[serde(default)]
    pub event_waits: HashMap<String, Vec<EventWaitEntry>>,

    /// Named child-workflow wait logs.
    #[serde(default)]
    pub child_workflow_runs: HashMap<String, Vec<ChildWaitEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workflow_run_id: Option<Uuid>,

    /// Append-only transition history.
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Create a fresh run in `scheduled(new)`.
    pub fn new(
        workflow_name: impl Into<String>,
        version_id: impl Into<String>,
        input: serde_json::Value,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let scheduled_at = options.trigger.scheduled_at(now);
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            version_id: version_id.into(),
            revision: 0,
            attempts: 0,
            status: RunStatus::Scheduled {
                scheduled_at,
                reason: ScheduleReason::New,
            },
            input,
            options,
            tasks: HashMap::new(),
            sleeps: HashMap::new(),
            event_waits: HashMap::new(),
            child_workflow_runs: HashMap::new(),
            parent_workflow_run_id: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status_kind(&self) -> StatusKind {
        self.status.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The open entry of a named sleep log, if any.
    pub fn open_sleep_mut(&mut self, name: &str) -> Option<&mut SleepEntry> {
        self.sleeps
            .get_mut(name)
            .and_then(|entries| entries.iter_mut().rev().find(|e| e.is_open()))
    }

    /// The open entry of a named event-wait log, if any.
    pub fn open_event_wait_mut(&mut self, name: &str) -> Option<&mut EventWaitEntry> {
        self.event_waits
            .get_mut(name)
            .and_then(|entries| entries.iter_mut().rev().find(|e| e.is_open()))
    }

    /// The open child-wait entry for a given child run, if any.
    pub fn open_child_wait_mut(&mut self, child_id: Uuid) -> Option<&mut ChildWaitEntry> {
        self.child_workflow_runs.values_mut().find_map(|entries| {
            entries
                .iter_mut()
                .rev()
                .find(|e| e.is_open() && e.child_workflow_run_id == child_id)
        })
    }

    /// Child run ids with a still-open wait entry.
    pub fn open_child_run_ids(&self) -> Vec<Uuid> {
        self.child_workflow_runs
            .values()
            .flatten()
            .filter(|e| e.is_open())
            .map(|e| e.child_workflow_run_id)
            .collect()
    }
}
