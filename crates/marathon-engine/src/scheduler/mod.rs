//! Promotion scheduling
//!
//! Everything time-driven lives here: a periodic scan promotes runs whose
//! deadline passed (elapsed schedules, sleeps, retry delays, event and
//! child-wait timeouts) and expands due recurring schedules. Scans are
//! stateless over store snapshots and every promotion is an optimistic
//! transition, so any number of scheduler instances can run concurrently;
//! losers of a race skip the run and move on.

pub mod expander;
pub mod schedule;

pub use expander::{ScheduleError, ScheduleExpander};
pub use schedule::{OverlapPolicy, Schedule, ScheduleSpec, ScheduleStatus};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::distributor::broker::{stream_name, Broker, RunMessage};
use crate::machine::WorkflowRunStateMachine;
use crate::run::{
    Concurrency, RunStatus, ScheduleReason, StatusKind, TransitionRequest, WorkflowRun,
};
use crate::store::{RunFilter, RunStore};

/// Configuration for [`PromotionScheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the run promotion scans.
    pub scan_interval: Duration,

    /// Cadence of recurring-schedule expansion.
    pub schedule_scan_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(500),
            schedule_scan_interval: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_schedule_scan_interval(mut self, interval: Duration) -> Self {
        self.schedule_scan_interval = interval;
        self
    }
}

/// Timer-driven promotion of suspended runs.
pub struct PromotionScheduler {
    machine: WorkflowRunStateMachine,
    store: Arc<dyn RunStore>,
    expander: ScheduleExpander,
    /// When set, promoted runs are announced on their stream.
    broker: Option<Arc<dyn Broker>>,
    config: SchedulerConfig,
}

impl PromotionScheduler {
    pub fn new(machine: WorkflowRunStateMachine, config: SchedulerConfig) -> Self {
        let store = machine.store().clone();
        let expander = ScheduleExpander::new(machine.clone());
        Self {
            machine,
            store,
            expander,
            broker: None,
            config,
        }
    }

    /// Publish run-ready messages to this broker on promotion to `queued`.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn expander(&self) -> &ScheduleExpander {
        &self.expander
    }

    /// Run scan loops until shutdown is signalled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut scan_tick = tokio::time::interval(self.config.scan_interval);
        let mut schedule_tick = tokio::time::interval(self.config.schedule_scan_interval);
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            "promotion scheduler started"
        );

        loop {
            tokio::select! {
                _ = scan_tick.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = schedule_tick.tick() => {
                    if let Err(e) = self.expander.expand_due(Utc::now()).await {
                        warn!(error = %e, "schedule expansion scan failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("promotion scheduler stopped");
    }

    /// One full promotion pass over the store snapshot.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.scan_scheduled(now).await;
        self.scan_awaiting_retry(now).await;
        self.scan_task_retries(now).await;
        self.scan_sleeping(now).await;
        self.scan_event_timeouts(now).await;
        self.scan_child_timeouts(now).await;
    }

    /// `scheduled` runs whose `scheduled_at` elapsed move to `queued` and
    /// are announced to workers.
    pub async fn scan_scheduled(&self, now: DateTime<Utc>) {
        for run in self.due_runs(StatusKind::Scheduled, now).await {
            let promoted = self
                .promote(&run, TransitionRequest::Queued, "scheduled promotion")
                .await;
            if promoted {
                self.announce(&run).await;
            }
        }
    }

    /// `awaiting_retry` runs whose delay elapsed re-schedule with
    /// `reason=retry`.
    pub async fn scan_awaiting_retry(&self, now: DateTime<Utc>) {
        for run in self.due_runs(StatusKind::AwaitingRetry, now).await {
            self.promote(
                &run,
                TransitionRequest::reschedule_now(ScheduleReason::Retry),
                "retry promotion",
            )
            .await;
        }
    }

    /// `running` runs holding a task whose retry delay elapsed re-schedule
    /// with `reason=task_retry`, re-queueing the handler for another pass.
    pub async fn scan_task_retries(&self, now: DateTime<Utc>) {
        let runs = match self
            .store
            .scan_runs(&RunFilter::by_status(StatusKind::Running))
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "task-retry scan failed");
                return;
            }
        };

        for run in runs {
            let due = run.tasks.values().any(|task| {
                task.next_attempt_at()
                    .is_some_and(|at| at <= now)
            });
            if due {
                self.promote(
                    &run,
                    TransitionRequest::reschedule_now(ScheduleReason::TaskRetry),
                    "task-retry promotion",
                )
                .await;
            }
        }
    }

    /// `sleeping` runs whose `awake_at` elapsed re-schedule with
    /// `reason=awake`.
    pub async fn scan_sleeping(&self, now: DateTime<Utc>) {
        for run in self.due_runs(StatusKind::Sleeping, now).await {
            self.promote(
                &run,
                TransitionRequest::reschedule_now(ScheduleReason::Awake),
                "sleep promotion",
            )
            .await;
        }
    }

    /// `awaiting_event` runs whose timeout elapsed re-schedule with
    /// `reason=event`; the open wait entry resolves as a timeout.
    pub async fn scan_event_timeouts(&self, now: DateTime<Utc>) {
        for run in self.due_runs(StatusKind::AwaitingEvent, now).await {
            self.promote(
                &run,
                TransitionRequest::reschedule_now(ScheduleReason::Event),
                "event timeout",
            )
            .await;
        }
    }

    /// `awaiting_child_workflow` runs whose timeout elapsed re-schedule with
    /// `reason=child_workflow`; the wait entry records whether the child
    /// made it in time.
    pub async fn scan_child_timeouts(&self, now: DateTime<Utc>) {
        for run in self.due_runs(StatusKind::AwaitingChildWorkflow, now).await {
            self.promote(
                &run,
                TransitionRequest::reschedule_now(ScheduleReason::ChildWorkflow),
                "child-wait timeout",
            )
            .await;
        }
    }

    /// Runs in `status` whose deadline is at or before `now`.
    async fn due_runs(&self, status: StatusKind, now: DateTime<Utc>) -> Vec<WorkflowRun> {
        let runs = match self.store.scan_runs(&RunFilter::by_status(status)).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(status = %status, error = %e, "promotion scan failed");
                return Vec::new();
            }
        };
        runs.into_iter()
            .filter(|run| due_at(&run.status).is_some_and(|at| at <= now))
            .collect()
    }

    /// Apply one optimistic promotion; races and stale snapshots are
    /// expected and skipped.
    async fn promote(&self, run: &WorkflowRun, request: TransitionRequest, what: &str) -> bool {
        match self
            .machine
            .transition(
                run.id,
                request,
                Concurrency::Optimistic {
                    expected_revision: run.revision,
                },
            )
            .await
        {
            Ok(_) => {
                debug!(run_id = %run.id, what, "promoted");
                true
            }
            Err(e) if e.is_benign_race() => {
                debug!(run_id = %run.id, what, "promotion lost race, skipping");
                false
            }
            Err(e) => {
                warn!(run_id = %run.id, what, error = %e, "promotion failed");
                false
            }
        }
    }

    async fn announce(&self, run: &WorkflowRun) {
        let Some(broker) = &self.broker else {
            return;
        };
        let stream = stream_name(&run.workflow_name, run.options.shard_key.as_deref());
        let message = RunMessage::WorkflowRunReady {
            workflow_run_id: run.id,
        };
        match serde_json::to_value(&message) {
            Ok(payload) => {
                if let Err(e) = broker.publish(&stream, payload).await {
                    // The polling fallback and idle claim still deliver it.
                    warn!(run_id = %run.id, stream = %stream, error = %e, "run-ready publish failed");
                }
            }
            Err(e) => warn!(run_id = %run.id, error = %e, "run-ready encode failed"),
        }
    }
}

/// The deadline that makes a suspended status promotable, if any.
fn due_at(status: &RunStatus) -> Option<DateTime<Utc>> {
    match status {
        RunStatus::Scheduled { scheduled_at, .. } => Some(*scheduled_at),
        RunStatus::Sleeping { awake_at, .. } => Some(*awake_at),
        RunStatus::AwaitingRetry {
            next_attempt_at, ..
        } => Some(*next_attempt_at),
        RunStatus::AwaitingEvent { timeout_at, .. } => *timeout_at,
        RunStatus::AwaitingChildWorkflow { timeout_at, .. } => *timeout_at,
        _ => None,
    }
}
