//! Transition requests
//!
//! Callers describe the transition they want with duration-relative fields
//! (`scheduled_in_ms`, `duration_ms`, `next_attempt_in_ms`, `timeout_in_ms`).
//! The pure [`TransitionRequest::to_absolute`] step converts each variant to
//! a stored [`RunStatus`] against server time, keeping the conversion out of
//! the transition handler and individually testable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{RunStatus, ScheduleReason, SerializableError, StatusKind};

/// Concurrency control for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Concurrency {
    /// Compare-and-swap against the revision the caller last observed.
    /// Stale revisions fail with a conflict; the caller re-fetches.
    Optimistic { expected_revision: u64 },

    /// Unconditional, for operator intervention (pause, cancel, resume).
    /// Wins over racing workers; only the status table can reject it.
    Pessimistic,
}

/// A requested status change, with duration-relative timing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum TransitionRequest {
    /// Re-schedule the run.
    Scheduled {
        reason: ScheduleReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_in_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_at: Option<DateTime<Utc>>,
    },

    /// Move an elapsed scheduled run into the queue.
    Queued,

    /// A worker picked the run up.
    Running,

    /// Operator pause.
    Paused,

    /// Suspend on a named sleep.
    Sleeping { name: String, duration_ms: u64 },

    /// Suspend waiting for a named event.
    AwaitingEvent {
        event_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_in_ms: Option<u64>,
    },

    /// Suspend until the run-level retry delay elapses.
    AwaitingRetry {
        next_attempt_in_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializableError>,
    },

    /// Suspend waiting for a child run to reach `expected_status`.
    AwaitingChildWorkflow {
        child_workflow_run_id: Uuid,
        child_name: String,
        expected_status: StatusKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_in_ms: Option<u64>,
    },

    /// Cancel the run (cascades to open children).
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Terminal success.
    Completed { output: serde_json::Value },

    /// Terminal failure.
    Failed { error: SerializableError },
}

impl TransitionRequest {
    /// The status kind this request targets.
    pub fn target_kind(&self) -> StatusKind {
        match self {
            Self::Scheduled { .. } => StatusKind::Scheduled,
            Self::Queued => StatusKind::Queued,
            Self::Running => StatusKind::Running,
            Self::Paused => StatusKind::Paused,
            Self::Sleeping { .. } => StatusKind::Sleeping,
            Self::AwaitingEvent { .. } => StatusKind::AwaitingEvent,
            Self::AwaitingRetry { .. } => StatusKind::AwaitingRetry,
            Self::AwaitingChildWorkflow { .. } => StatusKind::AwaitingChildWorkflow,
            Self::Cancelled { .. } => StatusKind::Cancelled,
            Self::Completed { .. } => StatusKind::Completed,
            Self::Failed { .. } => StatusKind::Failed,
        }
    }

    /// The schedule reason, when this is a `scheduled` request.
    pub fn schedule_reason(&self) -> Option<ScheduleReason> {
        match self {
            Self::Scheduled { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Convert duration-relative fields into an absolute stored status.
    ///
    /// Pure: the only input besides the request is `now`.
    pub fn to_absolute(&self, now: DateTime<Utc>) -> RunStatus {
        match self {
            Self::Scheduled {
                reason,
                scheduled_in_ms,
                scheduled_at,
            } => {
                let at = scheduled_at.unwrap_or_else(|| {
                    now + Duration::milliseconds(scheduled_in_ms.unwrap_or(0) as i64)
                });
                RunStatus::Scheduled {
                    scheduled_at: at,
                    reason: *reason,
                }
            }

            Self::Queued => RunStatus::Queued { queued_at: now },

            Self::Running => RunStatus::Running { started_at: now },

            Self::Paused => RunStatus::Paused { paused_at: now },

            Self::Sleeping { name, duration_ms } => RunStatus::Sleeping {
                name: name.clone(),
                awake_at: now + Duration::milliseconds(*duration_ms as i64),
            },

            Self::AwaitingEvent {
                event_name,
                timeout_in_ms,
            } => RunStatus::AwaitingEvent {
                event_name: event_name.clone(),
                timeout_at: timeout_in_ms.map(|ms| now + Duration::milliseconds(ms as i64)),
            },

            Self::AwaitingRetry {
                next_attempt_in_ms,
                error,
            } => RunStatus::AwaitingRetry {
                next_attempt_at: now + Duration::milliseconds(*next_attempt_in_ms as i64),
                error: error.clone(),
            },

            Self::AwaitingChildWorkflow {
                child_workflow_run_id,
                child_name,
                expected_status,
                timeout_in_ms,
            } => RunStatus::AwaitingChildWorkflow {
                child_workflow_run_id: *child_workflow_run_id,
                child_name: child_name.clone(),
                expected_status: *expected_status,
                timeout_at: timeout_in_ms.map(|ms| now + Duration::milliseconds(ms as i64)),
            },

            Self::Cancelled { reason } => RunStatus::Cancelled {
                cancelled_at: now,
                reason: reason.clone(),
            },

            Self::Completed { output } => RunStatus::Completed {
                completed_at: now,
                output: output.clone(),
            },

            Self::Failed { error } => RunStatus::Failed {
                failed_at: now,
                error: error.clone(),
            },
        }
    }

    /// Shorthand for an immediate re-schedule.
    pub fn reschedule_now(reason: ScheduleReason) -> Self {
        Self::Scheduled {
            reason,
            scheduled_in_ms: None,
            scheduled_at: None,
        }
    }

    /// Shorthand for a cancel request.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: Some(reason.into()),
        }
    }
}
