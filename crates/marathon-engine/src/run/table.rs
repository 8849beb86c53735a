//! Run status transition table
//!
//! The single source of truth for which status changes are legal.
//! Destinations of kind `scheduled` are refined by reason: each waiting
//! status may only be left for the reasons that name its wake condition
//! (plus `new`, the explicit restart).

use super::state::{ScheduleReason, StatusKind};

/// Whether `from → to` is a legal transition.
///
/// `reason` applies only when `to` is `scheduled`; it is ignored otherwise.
pub fn is_allowed(from: StatusKind, to: StatusKind, reason: Option<ScheduleReason>) -> bool {
    use ScheduleReason as R;
    use StatusKind::*;

    match (from, to) {
        // Duplicate create is the only scheduled self-loop.
        (Scheduled, Scheduled) => reason == Some(R::New),
        (Scheduled, Queued) | (Scheduled, Paused) | (Scheduled, Cancelled) => true,

        (Queued, Running) | (Queued, Paused) | (Queued, Cancelled) | (Queued, Failed) => true,

        // A task-level retry pushes the whole run back to scheduled.
        (Running, Scheduled) => reason == Some(R::TaskRetry),
        (Running, Running)
        | (Running, Paused)
        | (Running, Sleeping)
        | (Running, AwaitingEvent)
        | (Running, AwaitingRetry)
        | (Running, AwaitingChildWorkflow)
        | (Running, Cancelled)
        | (Running, Completed)
        | (Running, Failed) => true,

        (Paused, Scheduled) => matches!(reason, Some(R::New) | Some(R::Resume)),
        (Paused, Cancelled) => true,

        (Sleeping, Scheduled) => {
            matches!(reason, Some(R::New) | Some(R::Awake) | Some(R::AwakeEarly))
        }
        (Sleeping, Cancelled) => true,

        (AwaitingEvent, Scheduled) => matches!(reason, Some(R::New) | Some(R::Event)),
        (AwaitingEvent, Cancelled) => true,

        (AwaitingRetry, Scheduled) => matches!(reason, Some(R::New) | Some(R::Retry)),
        (AwaitingRetry, Cancelled) => true,

        (AwaitingChildWorkflow, Scheduled) => {
            matches!(reason, Some(R::New) | Some(R::ChildWorkflow))
        }
        (AwaitingChildWorkflow, Cancelled) => true,

        // Terminal statuses admit only an explicit restart.
        (Cancelled, Scheduled) | (Completed, Scheduled) | (Failed, Scheduled) => {
            reason == Some(R::New)
        }

        _ => false,
    }
}
