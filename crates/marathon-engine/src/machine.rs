//! Workflow run state machine
//!
//! Validates and applies status transitions for runs and their tasks. Every
//! state-changing call is a single compare-and-swap against the run store:
//! optimistic callers supply the revision they last observed and lose with a
//! [`TransitionError::RevisionConflict`] when stale; pessimistic (operator)
//! calls retry the swap internally and can only be rejected by the
//! transition table itself.
//!
//! Cascading cancel and parent wake are expressed as notification messages
//! drained from a queue after each committed transition, never as recursive
//! calls back into the machine, so deep child trees cannot grow the call
//! stack and each cascade step is independently retryable.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::run::state::{
    ChildWaitEntry, ChildWaitOutcome, EventWaitEntry, EventWaitOutcome, RunOptions, RunStatus,
    ScheduleReason, SleepEntry, SleepOutcome, StatusKind, TransitionRecord, WorkflowRun,
};
use crate::run::table::is_allowed;
use crate::run::task::TaskState;
use crate::run::{Concurrency, TransitionRequest};
use crate::store::{RunFilter, RunStore, StoreError};

/// Bound on internal compare-and-swap retries for pessimistic transitions.
/// Contention on a single run is a handful of actors at most.
const MAX_CAS_RETRIES: u32 = 16;

/// Errors from state machine operations
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// Unknown run
    #[error("workflow run not found: {0}")]
    NotFound(Uuid),

    /// The transition table rejects this status change. A programmer or
    /// infrastructure error, never retried automatically.
    #[error("invalid state transition on run {run_id}: {from} -> {to} (reason: {reason:?})")]
    InvalidStateTransition {
        run_id: Uuid,
        from: StatusKind,
        to: StatusKind,
        reason: Option<ScheduleReason>,
    },

    /// Expected optimistic-concurrency loss; the caller re-fetches and
    /// re-decides.
    #[error("revision conflict on run {run_id}: expected {expected}, got {actual}")]
    RevisionConflict {
        run_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// The task transition table rejects this change.
    #[error("invalid task transition on run {run_id}, task {task_path}: {message}")]
    InvalidTaskTransition {
        run_id: Uuid,
        task_path: String,
        message: String,
    },

    /// A task reference collided with prior state (e.g. starting a task
    /// whose path already completed).
    #[error("task conflict on run {run_id}, task {task_path}: {message}")]
    TaskConflict {
        run_id: Uuid,
        task_path: String,
        message: String,
    },

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotFound(id) => Self::NotFound(id),
            StoreError::RevisionConflict {
                run_id,
                expected,
                actual,
            } => Self::RevisionConflict {
                run_id,
                expected,
                actual,
            },
            other => Self::Store(other),
        }
    }
}

impl TransitionError {
    /// Failures a concurrent scan treats as "someone else got there first".
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            Self::InvalidStateTransition { .. } | Self::RevisionConflict { .. }
        )
    }
}

/// Requested task state change. Task transitions share the run's revision
/// counter and are always optimistic.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum TaskTransitionRequest {
    /// `none | awaiting_retry -> running`
    Running,

    /// `running -> completed`
    Completed { output: serde_json::Value },

    /// `running -> failed`
    Failed {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<crate::run::SerializableError>,
    },

    /// `running -> awaiting_retry`
    AwaitingRetry {
        reason: String,
        next_attempt_in_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<crate::run::SerializableError>,
    },
}

/// Follow-up work emitted by a committed transition.
#[derive(Debug)]
enum Notification {
    /// Cascade: cancel every non-terminal child of a cancelled run.
    CancelChildrenOf { parent_id: Uuid },

    /// Cascade: cancel one child run.
    CancelChild { child_id: Uuid },

    /// A run with a parent changed status; wake the parent if it is waiting
    /// for exactly this child and exactly this status.
    ChildChanged {
        parent_id: Uuid,
        child_id: Uuid,
        status: StatusKind,
    },
}

/// Per-call context threaded into transition application.
#[derive(Debug, Default)]
struct TransitionContext {
    /// Payload when the transition is driven by a received event.
    event_payload: Option<serde_json::Value>,

    /// The child's current status, pre-fetched when the request enters or
    /// leaves a child wait.
    child_status: Option<StatusKind>,
}

/// The run state machine. Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct WorkflowRunStateMachine {
    store: Arc<dyn RunStore>,
}

impl WorkflowRunStateMachine {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    // =========================================================================
    // Creation and reads
    // =========================================================================

    /// Create a run, or return the existing one on an idempotency-key hit.
    ///
    /// The key lookup is scoped by workflow name + version. A duplicate
    /// create returns the existing run unchanged, input from the first call
    /// only.
    #[instrument(skip(self, input, options), fields(workflow = %workflow_name))]
    pub async fn create(
        &self,
        workflow_name: &str,
        version_id: &str,
        input: serde_json::Value,
        options: RunOptions,
    ) -> Result<WorkflowRun, TransitionError> {
        self.create_inner(workflow_name, version_id, input, options, None)
            .await
    }

    /// Create a run owned by a parent run (for child-workflow waits).
    pub async fn create_child(
        &self,
        workflow_name: &str,
        version_id: &str,
        input: serde_json::Value,
        options: RunOptions,
        parent_workflow_run_id: Uuid,
    ) -> Result<WorkflowRun, TransitionError> {
        self.create_inner(
            workflow_name,
            version_id,
            input,
            options,
            Some(parent_workflow_run_id),
        )
        .await
    }

    async fn create_inner(
        &self,
        workflow_name: &str,
        version_id: &str,
        input: serde_json::Value,
        options: RunOptions,
        parent: Option<Uuid>,
    ) -> Result<WorkflowRun, TransitionError> {
        if let Some(ref key) = options.idempotency_key {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(workflow_name, version_id, key)
                .await?
            {
                debug!(run_id = %existing.id, key = %key, "idempotency hit, returning existing run");
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let mut run = WorkflowRun::new(workflow_name, version_id, input, options, now);
        run.parent_workflow_run_id = parent;

        match self.store.insert_run(run.clone()).await {
            Ok(()) => {
                debug!(run_id = %run.id, "created workflow run");
                Ok(run)
            }
            // Lost an insert race on the idempotency key; the winner is the
            // run of record.
            Err(StoreError::DuplicateRun(existing_id)) => {
                Ok(self.store.get_run(existing_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a run snapshot.
    pub async fn get(&self, run_id: Uuid) -> Result<WorkflowRun, TransitionError> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Fetch just the status.
    pub async fn get_status(&self, run_id: Uuid) -> Result<RunStatus, TransitionError> {
        Ok(self.store.get_run(run_id).await?.status)
    }

    /// The run's transition history, oldest first.
    pub async fn list_transitions(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<TransitionRecord>, TransitionError> {
        Ok(self.store.get_run(run_id).await?.transitions)
    }

    // =========================================================================
    // Run transitions
    // =========================================================================

    /// Apply a status transition and drain its follow-up notifications.
    #[instrument(skip(self, request), fields(run_id = %run_id))]
    pub async fn transition(
        &self,
        run_id: Uuid,
        request: TransitionRequest,
        concurrency: Concurrency,
    ) -> Result<WorkflowRun, TransitionError> {
        let mut ctx = TransitionContext::default();
        self.prefetch_child_status(&request, run_id, &mut ctx).await?;

        let (run, notifications) = self.transition_inner(run_id, &request, concurrency, ctx).await?;
        self.drain_notifications(notifications).await;
        Ok(run)
    }

    /// Deliver an event to a run.
    ///
    /// If the run is awaiting this event name, the open wait entry resolves
    /// with the payload and the run re-schedules (`reason=event`). Otherwise
    /// the event is dropped with a debug log; the wait's timeout path is the
    /// at-least-once fallback.
    #[instrument(skip(self, payload), fields(run_id = %run_id, event = %event_name))]
    pub async fn send_event(
        &self,
        run_id: Uuid,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<bool, TransitionError> {
        let run = self.store.get_run(run_id).await?;
        match &run.status {
            RunStatus::AwaitingEvent { event_name: waiting, .. } if waiting == event_name => {}
            _ => {
                debug!("run is not awaiting this event, dropping");
                return Ok(false);
            }
        }

        let ctx = TransitionContext {
            event_payload: Some(payload),
            ..Default::default()
        };
        let request = TransitionRequest::reschedule_now(ScheduleReason::Event);
        match self
            .transition_inner(run_id, &request, Concurrency::Pessimistic, ctx)
            .await
        {
            Ok((_, notifications)) => {
                self.drain_notifications(notifications).await;
                Ok(true)
            }
            // Raced with another promotion; the run already moved on.
            Err(e) if e.is_benign_race() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deliver an event to every run currently awaiting it. Returns the
    /// number of runs woken.
    pub async fn multicast_event(
        &self,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<usize, TransitionError> {
        let waiting = self
            .store
            .scan_runs(&RunFilter::by_status(StatusKind::AwaitingEvent))
            .await?;

        let mut woken = 0;
        for run in waiting {
            let matches = matches!(
                &run.status,
                RunStatus::AwaitingEvent { event_name: waiting, .. } if waiting == event_name
            );
            if matches && self.send_event(run.id, event_name, payload.clone()).await? {
                woken += 1;
            }
        }
        Ok(woken)
    }

    // =========================================================================
    // Task transitions
    // =========================================================================

    /// Apply a task state change. Shares the run's revision counter, so a
    /// stale `expected_revision` fails exactly like a stale run transition.
    #[instrument(skip(self, request), fields(run_id = %run_id, task = %task_path))]
    pub async fn transition_task(
        &self,
        run_id: Uuid,
        task_path: &str,
        request: TaskTransitionRequest,
        expected_revision: u64,
    ) -> Result<WorkflowRun, TransitionError> {
        let mut run = self.store.get_run(run_id).await?;
        if run.revision != expected_revision {
            return Err(TransitionError::RevisionConflict {
                run_id,
                expected: expected_revision,
                actual: run.revision,
            });
        }

        let now = Utc::now();
        let next = Self::apply_task_transition(
            run_id,
            task_path,
            run.tasks.get(task_path),
            &request,
            now,
        )?;
        run.tasks.insert(task_path.to_string(), next);
        run.revision += 1;
        run.updated_at = now;

        Ok(self.store.update_run(run, expected_revision).await?)
    }

    fn apply_task_transition(
        run_id: Uuid,
        task_path: &str,
        current: Option<&TaskState>,
        request: &TaskTransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<TaskState, TransitionError> {
        let invalid = |message: &str| TransitionError::InvalidTaskTransition {
            run_id,
            task_path: task_path.to_string(),
            message: message.to_string(),
        };

        match request {
            TaskTransitionRequest::Running => match current {
                None => Ok(TaskState::Running { attempts: 1 }),
                Some(TaskState::AwaitingRetry { attempts, .. }) => Ok(TaskState::Running {
                    attempts: attempts + 1,
                }),
                Some(TaskState::Completed { .. }) => Err(TransitionError::TaskConflict {
                    run_id,
                    task_path: task_path.to_string(),
                    message: "task already completed at this path".to_string(),
                }),
                Some(TaskState::Running { .. }) => {
                    Err(invalid("task is already running"))
                }
                Some(TaskState::Failed { .. }) => {
                    Err(invalid("task already failed terminally"))
                }
            },

            TaskTransitionRequest::Completed { output } => match current {
                Some(TaskState::Running { .. }) => Ok(TaskState::Completed {
                    output: output.clone(),
                }),
                _ => Err(invalid("only a running task can complete")),
            },

            TaskTransitionRequest::Failed { reason, error } => match current {
                Some(TaskState::Running { attempts }) => Ok(TaskState::Failed {
                    reason: reason.clone(),
                    attempts: *attempts,
                    attempted_at: now,
                    error: error.clone(),
                }),
                _ => Err(invalid("only a running task can fail")),
            },

            TaskTransitionRequest::AwaitingRetry {
                reason,
                next_attempt_in_ms,
                error,
            } => match current {
                Some(TaskState::Running { attempts }) => Ok(TaskState::AwaitingRetry {
                    reason: reason.clone(),
                    attempts: *attempts,
                    attempted_at: now,
                    next_attempt_at: now
                        + chrono::Duration::milliseconds(*next_attempt_in_ms as i64),
                    error: error.clone(),
                }),
                _ => Err(invalid("only a running task can await retry")),
            },
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Pre-fetch the child's status when the request enters or leaves a
    /// child wait, so the application step stays store-free.
    async fn prefetch_child_status(
        &self,
        request: &TransitionRequest,
        run_id: Uuid,
        ctx: &mut TransitionContext,
    ) -> Result<(), TransitionError> {
        let child_id = match request {
            TransitionRequest::AwaitingChildWorkflow {
                child_workflow_run_id,
                ..
            } => Some(*child_workflow_run_id),
            TransitionRequest::Scheduled {
                reason: ScheduleReason::ChildWorkflow,
                ..
            } => match self.store.get_run(run_id).await?.status {
                RunStatus::AwaitingChildWorkflow {
                    child_workflow_run_id,
                    ..
                } => Some(child_workflow_run_id),
                _ => None,
            },
            _ => None,
        };

        if let Some(child_id) = child_id {
            match self.store.get_run(child_id).await {
                Ok(child) => ctx.child_status = Some(child.status_kind()),
                Err(StoreError::RunNotFound(_)) => {
                    warn!(child_id = %child_id, "child run missing during child-wait transition");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// One compare-and-swap transition. Optimistic calls surface conflicts;
    /// pessimistic calls retry against the fresh revision until the table
    /// check itself decides.
    async fn transition_inner(
        &self,
        run_id: Uuid,
        request: &TransitionRequest,
        concurrency: Concurrency,
        ctx: TransitionContext,
    ) -> Result<(WorkflowRun, Vec<Notification>), TransitionError> {
        let mut attempts = 0;
        loop {
            let run = self.store.get_run(run_id).await?;
            let expected = run.revision;

            if let Concurrency::Optimistic { expected_revision } = concurrency {
                if expected_revision != run.revision {
                    return Err(TransitionError::RevisionConflict {
                        run_id,
                        expected: expected_revision,
                        actual: run.revision,
                    });
                }
            }

            let now = Utc::now();
            let (next, notifications) = Self::apply(run, request, &ctx, now)?;

            match self.store.update_run(next, expected).await {
                Ok(stored) => {
                    debug!(
                        run_id = %run_id,
                        status = %stored.status_kind(),
                        revision = stored.revision,
                        "transition applied"
                    );
                    return Ok((stored, notifications));
                }
                Err(StoreError::RevisionConflict { .. })
                    if matches!(concurrency, Concurrency::Pessimistic)
                        && attempts < MAX_CAS_RETRIES =>
                {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Validate and apply one transition to an owned run snapshot. Pure with
    /// respect to the store.
    fn apply(
        mut run: WorkflowRun,
        request: &TransitionRequest,
        ctx: &TransitionContext,
        now: DateTime<Utc>,
    ) -> Result<(WorkflowRun, Vec<Notification>), TransitionError> {
        let from = run.status_kind();
        let to = request.target_kind();
        let reason = request.schedule_reason();

        if !is_allowed(from, to, reason) {
            return Err(TransitionError::InvalidStateTransition {
                run_id: run.id,
                from,
                to,
                reason,
            });
        }

        let mut status = request.to_absolute(now);

        // Child-settled downgrade: entering a child wait whose child already
        // satisfies the expected status becomes an immediate re-schedule,
        // avoiding a dead suspend/resume round-trip.
        let mut settled_child_wait = None;
        if let RunStatus::AwaitingChildWorkflow {
            child_workflow_run_id,
            child_name,
            expected_status,
            timeout_at,
        } = &status
        {
            if ctx.child_status == Some(*expected_status) {
                settled_child_wait = Some((
                    child_name.clone(),
                    ChildWaitEntry {
                        child_workflow_run_id: *child_workflow_run_id,
                        expected_status: *expected_status,
                        started_at: now,
                        timeout_at: *timeout_at,
                        outcome: ChildWaitOutcome::Satisfied {
                            status: *expected_status,
                        },
                    },
                ));
            }
        }
        if let Some((name, entry)) = settled_child_wait {
            run.child_workflow_runs.entry(name).or_default().push(entry);
            status = RunStatus::Scheduled {
                scheduled_at: now,
                reason: ScheduleReason::ChildWorkflow,
            };
        }

        Self::close_wait_entries(&mut run, reason, ctx, now);
        Self::open_wait_entries(&mut run, &status, now);

        let mut notifications = Vec::new();

        // Entering cancelled closes every open child wait and cascades to
        // all live children, waited-on or not.
        if matches!(status, RunStatus::Cancelled { .. }) {
            for entries in run.child_workflow_runs.values_mut() {
                for entry in entries.iter_mut().filter(|e| e.is_open()) {
                    entry.outcome = ChildWaitOutcome::Cancelled;
                }
            }
            notifications.push(Notification::CancelChildrenOf { parent_id: run.id });
        }

        // Attempts count entries into running, not revisions.
        if from == StatusKind::Queued && status.kind() == StatusKind::Running {
            run.attempts += 1;
        }

        // A run-level retry restart discards stale per-attempt task state so
        // tasks can re-run from scratch.
        if reason == Some(ScheduleReason::Retry) {
            run.tasks.retain(|_, task| !task.is_awaiting_retry());
        }

        // Explicit restart of a terminal run: fresh replay logs and tasks,
        // same id, cumulative attempts.
        if from.is_terminal() && reason == Some(ScheduleReason::New) {
            run.tasks.clear();
            run.sleeps.clear();
            run.event_waits.clear();
            run.child_workflow_runs.clear();
        }

        let effective_to = status.kind();
        run.revision += 1;
        run.transitions.push(TransitionRecord {
            from,
            to: effective_to,
            reason: status.schedule_reason().or(reason),
            at: now,
            revision: run.revision,
        });
        run.status = status;
        run.updated_at = now;

        if let Some(parent_id) = run.parent_workflow_run_id {
            if effective_to != from {
                notifications.push(Notification::ChildChanged {
                    parent_id,
                    child_id: run.id,
                    status: effective_to,
                });
            }
        }

        Ok((run, notifications))
    }

    /// Resolve the open replay-log entry of the status being left, as
    /// dictated by the previous status and the transition reason.
    fn close_wait_entries(
        run: &mut WorkflowRun,
        reason: Option<ScheduleReason>,
        ctx: &TransitionContext,
        now: DateTime<Utc>,
    ) {
        match run.status.clone() {
            RunStatus::Sleeping { name, .. } => {
                if let Some(entry) = run.open_sleep_mut(&name) {
                    entry.outcome = if reason == Some(ScheduleReason::Awake) {
                        let elapsed = (now - entry.started_at).num_milliseconds().max(0) as u64;
                        SleepOutcome::Completed {
                            duration_ms: elapsed,
                        }
                    } else {
                        SleepOutcome::Cancelled
                    };
                }
            }

            RunStatus::AwaitingEvent { event_name, .. } => {
                if let Some(entry) = run.open_event_wait_mut(&event_name) {
                    entry.outcome = match (reason, &ctx.event_payload) {
                        (Some(ScheduleReason::Event), Some(payload)) => {
                            EventWaitOutcome::Received {
                                payload: payload.clone(),
                                received_at: now,
                            }
                        }
                        // Leaving on reason=event with no payload is the
                        // timeout path.
                        (Some(ScheduleReason::Event), None) => EventWaitOutcome::Timeout {
                            timed_out_at: now,
                        },
                        _ => EventWaitOutcome::Cancelled,
                    };
                }
            }

            RunStatus::AwaitingChildWorkflow {
                child_workflow_run_id,
                expected_status,
                ..
            } => {
                if let Some(entry) = run.open_child_wait_mut(child_workflow_run_id) {
                    entry.outcome = match reason {
                        Some(ScheduleReason::ChildWorkflow) => {
                            if ctx.child_status == Some(expected_status) {
                                ChildWaitOutcome::Satisfied {
                                    status: expected_status,
                                }
                            } else {
                                ChildWaitOutcome::Timeout { timed_out_at: now }
                            }
                        }
                        _ => ChildWaitOutcome::Cancelled,
                    };
                }
            }

            _ => {}
        }
    }

    /// Append the open replay-log entry for the status being entered.
    fn open_wait_entries(run: &mut WorkflowRun, status: &RunStatus, now: DateTime<Utc>) {
        match status {
            RunStatus::Sleeping { name, awake_at } => {
                run.sleeps.entry(name.clone()).or_default().push(SleepEntry {
                    started_at: now,
                    awake_at: *awake_at,
                    outcome: SleepOutcome::Open,
                });
            }

            RunStatus::AwaitingEvent {
                event_name,
                timeout_at,
            } => {
                run.event_waits
                    .entry(event_name.clone())
                    .or_default()
                    .push(EventWaitEntry {
                        started_at: now,
                        timeout_at: *timeout_at,
                        outcome: EventWaitOutcome::Open,
                    });
            }

            RunStatus::AwaitingChildWorkflow {
                child_workflow_run_id,
                child_name,
                expected_status,
                timeout_at,
            } => {
                run.child_workflow_runs
                    .entry(child_name.clone())
                    .or_default()
                    .push(ChildWaitEntry {
                        child_workflow_run_id: *child_workflow_run_id,
                        expected_status: *expected_status,
                        started_at: now,
                        timeout_at: *timeout_at,
                        outcome: ChildWaitOutcome::Open,
                    });
            }

            _ => {}
        }
    }

    /// Process follow-up notifications iteratively. Failures here are either
    /// benign races (skip) or logged for the next scan to pick up.
    async fn drain_notifications(&self, initial: Vec<Notification>) {
        let mut queue: VecDeque<Notification> = initial.into();

        while let Some(notification) = queue.pop_front() {
            match notification {
                Notification::CancelChildrenOf { parent_id } => {
                    match self.store.scan_runs(&RunFilter::by_parent(parent_id)).await {
                        Ok(children) => {
                            for child in children.into_iter().filter(|c| !c.is_terminal()) {
                                queue.push_back(Notification::CancelChild {
                                    child_id: child.id,
                                });
                            }
                        }
                        Err(e) => {
                            warn!(parent_id = %parent_id, error = %e, "child scan failed");
                        }
                    }
                }

                Notification::CancelChild { child_id } => {
                    let request = TransitionRequest::cancel("parent cancelled");
                    match self
                        .transition_inner(
                            child_id,
                            &request,
                            Concurrency::Pessimistic,
                            TransitionContext::default(),
                        )
                        .await
                    {
                        Ok((_, more)) => queue.extend(more),
                        Err(e) if e.is_benign_race() => {
                            debug!(child_id = %child_id, "child already settled, cascade skip");
                        }
                        Err(e) => {
                            warn!(child_id = %child_id, error = %e, "cascading cancel failed");
                        }
                    }
                }

                Notification::ChildChanged {
                    parent_id,
                    child_id,
                    status,
                } => {
                    let parent = match self.store.get_run(parent_id).await {
                        Ok(parent) => parent,
                        Err(e) => {
                            warn!(parent_id = %parent_id, error = %e, "parent fetch failed");
                            continue;
                        }
                    };

                    // Wake only if the parent waits for exactly this child
                    // and exactly this resulting status.
                    let should_wake = matches!(
                        &parent.status,
                        RunStatus::AwaitingChildWorkflow {
                            child_workflow_run_id,
                            expected_status,
                            ..
                        } if *child_workflow_run_id == child_id && *expected_status == status
                    );
                    if !should_wake {
                        continue;
                    }

                    let ctx = TransitionContext {
                        child_status: Some(status),
                        ..Default::default()
                    };
                    let request =
                        TransitionRequest::reschedule_now(ScheduleReason::ChildWorkflow);
                    match self
                        .transition_inner(parent_id, &request, Concurrency::Pessimistic, ctx)
                        .await
                    {
                        Ok((_, more)) => queue.extend(more),
                        Err(e) if e.is_benign_race() => {
                            debug!(parent_id = %parent_id, "parent already promoted, wake skip");
                        }
                        Err(e) => {
                            warn!(parent_id = %parent_id, error = %e, "parent wake failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::state::TriggerStrategy;
    use crate::store::InMemoryRunStore;
    use serde_json::json;

    fn machine() -> WorkflowRunStateMachine {
        WorkflowRunStateMachine::new(Arc::new(InMemoryRunStore::new()))
    }

    async fn created(machine: &WorkflowRunStateMachine) -> WorkflowRun {
        machine
            .create("billing", "v1", json!({"order": 1}), RunOptions::default())
            .await
            .unwrap()
    }

    /// Drive a run into `running` through the legal path.
    async fn start_running(machine: &WorkflowRunStateMachine, run: &WorkflowRun) -> WorkflowRun {
        let queued = machine
            .transition(
                run.id,
                TransitionRequest::Queued,
                Concurrency::Optimistic {
                    expected_revision: run.revision,
                },
            )
            .await
            .unwrap();
        machine
            .transition(
                run.id,
                TransitionRequest::Running,
                Concurrency::Optimistic {
                    expected_revision: queued.revision,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_key() {
        let machine = machine();
        let options = RunOptions {
            idempotency_key: Some("k1".to_string()),
            ..Default::default()
        };

        let first = machine
            .create("billing", "v1", json!({"order": 1}), options.clone())
            .await
            .unwrap();
        let second = machine
            .create("billing", "v1", json!({"order": 999}), options)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        // Input from the first call only.
        assert_eq!(second.input, json!({"order": 1}));
    }

    #[tokio::test]
    async fn test_create_with_delayed_trigger() {
        let machine = machine();
        let before = Utc::now();
        let run = machine
            .create(
                "billing",
                "v1",
                json!({}),
                RunOptions {
                    trigger: TriggerStrategy::Delayed { delay_ms: 60_000 },
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match run.status {
            RunStatus::Scheduled { scheduled_at, .. } => {
                assert!(scheduled_at >= before + chrono::Duration::milliseconds(60_000));
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_transition_mutates_nothing() {
        let machine = machine();
        let run = created(&machine).await;

        // scheduled -> completed is not in the table.
        let err = machine
            .transition(
                run.id,
                TransitionRequest::Completed { output: json!({}) },
                Concurrency::Pessimistic,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransitionError::InvalidStateTransition { .. }));
        let after = machine.get(run.id).await.unwrap();
        assert_eq!(after.revision, 0);
        assert_eq!(after.status_kind(), StatusKind::Scheduled);
        assert!(after.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_optimistic_conflict_mutates_nothing() {
        let machine = machine();
        let run = created(&machine).await;

        let err = machine
            .transition(
                run.id,
                TransitionRequest::Queued,
                Concurrency::Optimistic {
                    expected_revision: 7,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransitionError::RevisionConflict {
                expected: 7,
                actual: 0,
                ..
            }
        ));
        assert_eq!(machine.get(run.id).await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn test_matching_revision_increments_by_one() {
        let machine = machine();
        let run = created(&machine).await;

        let queued = machine
            .transition(
                run.id,
                TransitionRequest::Queued,
                Concurrency::Optimistic {
                    expected_revision: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(queued.revision, 1);
        assert_eq!(queued.status_kind(), StatusKind::Queued);
        assert_eq!(queued.transitions.len(), 1);
        assert_eq!(queued.transitions[0].from, StatusKind::Scheduled);
        assert_eq!(queued.transitions[0].to, StatusKind::Queued);
    }

    #[tokio::test]
    async fn test_attempts_increment_on_queued_to_running_only() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;
        assert_eq!(running.attempts, 1);

        // Suspend and resume; attempts unchanged until running again.
        let sleeping = machine
            .transition(
                run.id,
                TransitionRequest::Sleeping {
                    name: "nap".to_string(),
                    duration_ms: 10,
                },
                Concurrency::Optimistic {
                    expected_revision: running.revision,
                },
            )
            .await
            .unwrap();
        assert_eq!(sleeping.attempts, 1);

        let rescheduled = machine
            .transition(
                run.id,
                TransitionRequest::reschedule_now(ScheduleReason::Awake),
                Concurrency::Pessimistic,
            )
            .await
            .unwrap();
        assert_eq!(rescheduled.attempts, 1);

        let running_again = start_running(&machine, &rescheduled).await;
        assert_eq!(running_again.attempts, 2);
    }

    #[tokio::test]
    async fn test_sleep_awake_records_completed_entry_with_duration() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;

        machine
            .transition(
                run.id,
                TransitionRequest::Sleeping {
                    name: "cooldown".to_string(),
                    duration_ms: 0,
                },
                Concurrency::Optimistic {
                    expected_revision: running.revision,
                },
            )
            .await
            .unwrap();

        let awake = machine
            .transition(
                run.id,
                TransitionRequest::reschedule_now(ScheduleReason::Awake),
                Concurrency::Pessimistic,
            )
            .await
            .unwrap();

        let entries = &awake.sleeps["cooldown"];
        assert_eq!(entries.len(), 1);
        match entries[0].outcome {
            SleepOutcome::Completed { duration_ms } => assert!(duration_ms < 5_000),
            ref other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sleep_cancel_marks_entry_cancelled() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;

        machine
            .transition(
                run.id,
                TransitionRequest::Sleeping {
                    name: "cooldown".to_string(),
                    duration_ms: 60_000,
                },
                Concurrency::Optimistic {
                    expected_revision: running.revision,
                },
            )
            .await
            .unwrap();

        let cancelled = machine
            .transition(
                run.id,
                TransitionRequest::cancel("operator"),
                Concurrency::Pessimistic,
            )
            .await
            .unwrap();

        assert_eq!(
            cancelled.sleeps["cooldown"][0].outcome,
            SleepOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_send_event_resolves_wait_and_reschedules() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;

        machine
            .transition(
                run.id,
                TransitionRequest::AwaitingEvent {
                    event_name: "approval".to_string(),
                    timeout_in_ms: Some(60_000),
                },
                Concurrency::Optimistic {
                    expected_revision: running.revision,
                },
            )
            .await
            .unwrap();

        let delivered = machine
            .send_event(run.id, "approval", json!({"approved": true}))
            .await
            .unwrap();
        assert!(delivered);

        let after = machine.get(run.id).await.unwrap();
        assert_eq!(after.status_kind(), StatusKind::Scheduled);
        assert_eq!(after.status.schedule_reason(), Some(ScheduleReason::Event));
        match &after.event_waits["approval"][0].outcome {
            EventWaitOutcome::Received { payload, .. } => {
                assert_eq!(payload, &json!({"approved": true}));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_event_wrong_name_is_dropped() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;

        machine
            .transition(
                run.id,
                TransitionRequest::AwaitingEvent {
                    event_name: "approval".to_string(),
                    timeout_in_ms: None,
                },
                Concurrency::Optimistic {
                    expected_revision: running.revision,
                },
            )
            .await
            .unwrap();

        let delivered = machine
            .send_event(run.id, "payment", json!({}))
            .await
            .unwrap();
        assert!(!delivered);
        assert_eq!(
            machine.get(run.id).await.unwrap().status_kind(),
            StatusKind::AwaitingEvent
        );
    }

    #[tokio::test]
    async fn test_cascading_cancel_closes_children() {
        let machine = machine();
        let parent = created(&machine).await;
        let parent_running = start_running(&machine, &parent).await;

        let child_a = machine
            .create_child("child", "v1", json!({}), RunOptions::default(), parent.id)
            .await
            .unwrap();
        let child_b = machine
            .create_child("child", "v1", json!({}), RunOptions::default(), parent.id)
            .await
            .unwrap();

        // Parent suspends on child A; child B is live but not waited on.
        machine
            .transition(
                parent.id,
                TransitionRequest::AwaitingChildWorkflow {
                    child_workflow_run_id: child_a.id,
                    child_name: "child-a".to_string(),
                    expected_status: StatusKind::Completed,
                    timeout_in_ms: None,
                },
                Concurrency::Optimistic {
                    expected_revision: parent_running.revision,
                },
            )
            .await
            .unwrap();

        machine
            .transition(
                parent.id,
                TransitionRequest::cancel("operator"),
                Concurrency::Pessimistic,
            )
            .await
            .unwrap();

        // Both children cancelled; parent's child map shows no open waits.
        assert_eq!(
            machine.get(child_a.id).await.unwrap().status_kind(),
            StatusKind::Cancelled
        );
        assert_eq!(
            machine.get(child_b.id).await.unwrap().status_kind(),
            StatusKind::Cancelled
        );
        let parent_after = machine.get(parent.id).await.unwrap();
        assert!(parent_after.open_child_run_ids().is_empty());
    }

    #[tokio::test]
    async fn test_parent_woken_when_child_reaches_expected_status() {
        let machine = machine();
        let parent = created(&machine).await;
        let parent_running = start_running(&machine, &parent).await;

        let child = machine
            .create_child("child", "v1", json!({}), RunOptions::default(), parent.id)
            .await
            .unwrap();

        machine
            .transition(
                parent.id,
                TransitionRequest::AwaitingChildWorkflow {
                    child_workflow_run_id: child.id,
                    child_name: "child".to_string(),
                    expected_status: StatusKind::Completed,
                    timeout_in_ms: None,
                },
                Concurrency::Optimistic {
                    expected_revision: parent_running.revision,
                },
            )
            .await
            .unwrap();

        // Drive the child to completed; the final transition must wake the
        // parent.
        let child_running = start_running(&machine, &child).await;
        machine
            .transition(
                child.id,
                TransitionRequest::Completed { output: json!(42) },
                Concurrency::Optimistic {
                    expected_revision: child_running.revision,
                },
            )
            .await
            .unwrap();

        let parent_after = machine.get(parent.id).await.unwrap();
        assert_eq!(parent_after.status_kind(), StatusKind::Scheduled);
        assert_eq!(
            parent_after.status.schedule_reason(),
            Some(ScheduleReason::ChildWorkflow)
        );
        let entry = &parent_after.child_workflow_runs["child"][0];
        assert_eq!(
            entry.outcome,
            ChildWaitOutcome::Satisfied {
                status: StatusKind::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_child_wait_downgrade_when_child_already_settled() {
        let machine = machine();
        let parent = created(&machine).await;
        let parent_running = start_running(&machine, &parent).await;

        // Child completes before the parent suspends on it.
        let child = machine
            .create_child("child", "v1", json!({}), RunOptions::default(), parent.id)
            .await
            .unwrap();
        let child_running = start_running(&machine, &child).await;
        machine
            .transition(
                child.id,
                TransitionRequest::Completed { output: json!({}) },
                Concurrency::Optimistic {
                    expected_revision: child_running.revision,
                },
            )
            .await
            .unwrap();

        let parent_after = machine
            .transition(
                parent.id,
                TransitionRequest::AwaitingChildWorkflow {
                    child_workflow_run_id: child.id,
                    child_name: "child".to_string(),
                    expected_status: StatusKind::Completed,
                    timeout_in_ms: Some(60_000),
                },
                Concurrency::Optimistic {
                    expected_revision: parent_running.revision,
                },
            )
            .await
            .unwrap();

        // Downgraded to an immediate re-schedule instead of suspending.
        assert_eq!(parent_after.status_kind(), StatusKind::Scheduled);
        assert_eq!(
            parent_after.status.schedule_reason(),
            Some(ScheduleReason::ChildWorkflow)
        );
        let entry = &parent_after.child_workflow_runs["child"][0];
        assert_eq!(
            entry.outcome,
            ChildWaitOutcome::Satisfied {
                status: StatusKind::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_task_lifecycle_shares_run_revision() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;

        let path = crate::run::task_path(run.id, "charge", &json!({"cents": 100}), None);

        let after_start = machine
            .transition_task(run.id, &path, TaskTransitionRequest::Running, running.revision)
            .await
            .unwrap();
        assert_eq!(after_start.revision, running.revision + 1);
        assert_eq!(after_start.tasks[&path], TaskState::Running { attempts: 1 });

        let after_complete = machine
            .transition_task(
                run.id,
                &path,
                TaskTransitionRequest::Completed {
                    output: json!({"receipt": "r1"}),
                },
                after_start.revision,
            )
            .await
            .unwrap();
        assert!(after_complete.tasks[&path].is_completed());

        // Stale revision fails like a stale run transition.
        let err = machine
            .transition_task(
                run.id,
                &path,
                TaskTransitionRequest::Running,
                running.revision,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::RevisionConflict { .. }));
    }

    #[tokio::test]
    async fn test_starting_completed_task_is_a_conflict() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;
        let path = crate::run::task_path(run.id, "charge", &json!({}), None);

        let r1 = machine
            .transition_task(run.id, &path, TaskTransitionRequest::Running, running.revision)
            .await
            .unwrap();
        let r2 = machine
            .transition_task(
                run.id,
                &path,
                TaskTransitionRequest::Completed { output: json!({}) },
                r1.revision,
            )
            .await
            .unwrap();

        let err = machine
            .transition_task(run.id, &path, TaskTransitionRequest::Running, r2.revision)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::TaskConflict { .. }));
    }

    #[tokio::test]
    async fn test_retry_restart_clears_awaiting_retry_tasks() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;
        let path = crate::run::task_path(run.id, "charge", &json!({}), None);

        let r1 = machine
            .transition_task(run.id, &path, TaskTransitionRequest::Running, running.revision)
            .await
            .unwrap();
        let r2 = machine
            .transition_task(
                run.id,
                &path,
                TaskTransitionRequest::AwaitingRetry {
                    reason: "flaky".to_string(),
                    next_attempt_in_ms: 50,
                    error: None,
                },
                r1.revision,
            )
            .await
            .unwrap();

        // Run-level retry restart: awaiting_retry task state is discarded.
        let r3 = machine
            .transition(
                run.id,
                TransitionRequest::AwaitingRetry {
                    next_attempt_in_ms: 0,
                    error: None,
                },
                Concurrency::Optimistic {
                    expected_revision: r2.revision,
                },
            )
            .await
            .unwrap();
        let restarted = machine
            .transition(
                run.id,
                TransitionRequest::reschedule_now(ScheduleReason::Retry),
                Concurrency::Optimistic {
                    expected_revision: r3.revision,
                },
            )
            .await
            .unwrap();

        assert!(!restarted.tasks.contains_key(&path));
    }

    #[tokio::test]
    async fn test_terminal_restart_reuses_id_and_clears_logs() {
        let machine = machine();
        let run = created(&machine).await;
        let running = start_running(&machine, &run).await;

        let failed = machine
            .transition(
                run.id,
                TransitionRequest::Failed {
                    error: crate::run::SerializableError::new("Boom", "exploded"),
                },
                Concurrency::Optimistic {
                    expected_revision: running.revision,
                },
            )
            .await;
        // running -> failed is legal
        let failed = failed.unwrap();

        let restarted = machine
            .transition(
                run.id,
                TransitionRequest::reschedule_now(ScheduleReason::New),
                Concurrency::Optimistic {
                    expected_revision: failed.revision,
                },
            )
            .await
            .unwrap();

        assert_eq!(restarted.id, run.id);
        assert_eq!(restarted.status_kind(), StatusKind::Scheduled);
        assert!(restarted.tasks.is_empty());
        assert!(restarted.sleeps.is_empty());
        // History survives the restart.
        assert_eq!(restarted.transitions.len(), failed.transitions.len() + 1);
    }

    #[tokio::test]
    async fn test_multicast_wakes_all_waiters() {
        let machine = machine();
        let mut waiting_ids = Vec::new();
        for _ in 0..3 {
            let run = created(&machine).await;
            let running = start_running(&machine, &run).await;
            machine
                .transition(
                    run.id,
                    TransitionRequest::AwaitingEvent {
                        event_name: "deploy".to_string(),
                        timeout_in_ms: None,
                    },
                    Concurrency::Optimistic {
                        expected_revision: running.revision,
                    },
                )
                .await
                .unwrap();
            waiting_ids.push(run.id);
        }

        let woken = machine
            .multicast_event("deploy", json!({"version": "1.2.3"}))
            .await
            .unwrap();
        assert_eq!(woken, 3);

        for id in waiting_ids {
            assert_eq!(
                machine.get(id).await.unwrap().status_kind(),
                StatusKind::Scheduled
            );
        }
    }
}
