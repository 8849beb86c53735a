//! Schedule expansion
//!
//! Turns due schedules into workflow runs. Each fired occurrence creates a
//! run whose idempotency key is the schedule's occurrence key, so a crash
//! between "create run" and "advance schedule" re-expands into a no-op on
//! the next scan instead of a duplicate run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::schedule::{
    OverlapPolicy, Schedule, ScheduleSpec, ScheduleSpecError, ScheduleStatus,
};
use crate::machine::{TransitionError, WorkflowRunStateMachine};
use crate::run::{Concurrency, RunOptions, TransitionRequest, TriggerStrategy};
use crate::store::{RunFilter, RunStore, StoreError};

/// Errors from schedule management and expansion
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Spec(#[from] ScheduleSpecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Lifecycle operation against a soft-deleted schedule.
    #[error("schedule {0} is deleted")]
    Deleted(Uuid),
}

/// Manages schedule lifecycle and expands due occurrences into runs.
#[derive(Clone)]
pub struct ScheduleExpander {
    machine: WorkflowRunStateMachine,
    store: Arc<dyn RunStore>,
}

impl ScheduleExpander {
    pub fn new(machine: WorkflowRunStateMachine) -> Self {
        let store = machine.store().clone();
        Self { machine, store }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create an active schedule.
    #[instrument(skip(self, spec, input), fields(workflow = %workflow_name))]
    pub async fn create(
        &self,
        workflow_name: &str,
        version_id: &str,
        spec: ScheduleSpec,
        overlap: OverlapPolicy,
        input: serde_json::Value,
    ) -> Result<Schedule, ScheduleError> {
        let schedule = Schedule::new(workflow_name, version_id, spec, overlap, input, Utc::now())?;
        self.store.insert_schedule(schedule.clone()).await?;
        info!(schedule_id = %schedule.id, "schedule created");
        Ok(schedule)
    }

    pub async fn get(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        Ok(self.store.get_schedule(schedule_id).await?)
    }

    /// All schedules except soft-deleted ones.
    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(self
            .store
            .list_schedules()
            .await?
            .into_iter()
            .filter(|s| s.status != ScheduleStatus::Deleted)
            .collect())
    }

    /// Pause firing; occurrences falling due while paused are not
    /// retroactively fired on resume.
    pub async fn pause(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        self.set_status(schedule_id, ScheduleStatus::Paused).await
    }

    /// Resume an active cadence; `next_run_at` moves to the next future
    /// occurrence so the pause window is skipped.
    pub async fn resume(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.store.get_schedule(schedule_id).await?;
        if schedule.status == ScheduleStatus::Deleted {
            return Err(ScheduleError::Deleted(schedule_id));
        }
        let now = Utc::now();
        schedule.status = ScheduleStatus::Active;
        schedule.next_run_at = schedule.spec.next_occurrence(now)?;
        schedule.updated_at = now;
        self.store.update_schedule(schedule.clone()).await?;
        Ok(schedule)
    }

    /// Soft delete: the schedule stops firing but its id and history remain
    /// resolvable.
    pub async fn delete(&self, schedule_id: Uuid) -> Result<Schedule, ScheduleError> {
        self.set_status(schedule_id, ScheduleStatus::Deleted).await
    }

    async fn set_status(
        &self,
        schedule_id: Uuid,
        status: ScheduleStatus,
    ) -> Result<Schedule, ScheduleError> {
        let mut schedule = self.store.get_schedule(schedule_id).await?;
        if schedule.status == ScheduleStatus::Deleted && status != ScheduleStatus::Deleted {
            return Err(ScheduleError::Deleted(schedule_id));
        }
        schedule.status = status;
        schedule.updated_at = Utc::now();
        self.store.update_schedule(schedule.clone()).await?;
        Ok(schedule)
    }

    // =========================================================================
    // Expansion
    // =========================================================================

    /// Expand every due schedule. Returns the number of runs created.
    #[instrument(skip(self))]
    pub async fn expand_due(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let mut created = 0;
        for schedule in self.store.list_schedules().await? {
            if !schedule.is_due(now) {
                continue;
            }
            match self.expand_one(schedule, now).await {
                Ok(count) => created += count,
                // One broken schedule must not block the rest.
                Err(e) => warn!(error = %e, "schedule expansion failed"),
            }
        }
        Ok(created)
    }

    async fn expand_one(
        &self,
        mut schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<usize, ScheduleError> {
        // The due occurrence itself plus any further ones that fell due
        // (bounded catch-up after downtime).
        let Some(first) = schedule.next_run_at else {
            return Ok(0);
        };
        let mut occurrences = vec![first];
        occurrences.extend(schedule.spec.occurrences_between(first, now)?);

        let mut created = 0;
        for occurrence in &occurrences {
            if self.fire_occurrence(&schedule, *occurrence).await? {
                created += 1;
            }
        }

        let last = *occurrences.last().unwrap_or(&first);
        schedule.last_occurrence = Some(last);
        schedule.next_run_at = schedule.spec.next_occurrence(last)?;
        schedule.run_count += created as u64;
        schedule.updated_at = now;
        self.store.update_schedule(schedule).await?;
        Ok(created)
    }

    /// Fire one occurrence under the schedule's overlap policy. Returns
    /// whether a new run was created.
    async fn fire_occurrence(
        &self,
        schedule: &Schedule,
        occurrence: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        // Already fired (crash between run creation and schedule advance).
        let key = schedule.occurrence_key(occurrence);
        if self
            .store
            .find_by_idempotency_key(&schedule.workflow_name, &schedule.version_id, &key)
            .await?
            .is_some()
        {
            debug!(schedule_id = %schedule.id, "occurrence already expanded");
            return Ok(false);
        }

        match schedule.overlap {
            OverlapPolicy::Allow => {}
            OverlapPolicy::Skip => {
                if !self.open_runs(schedule.id).await?.is_empty() {
                    debug!(schedule_id = %schedule.id, "previous run still open, skipping occurrence");
                    return Ok(false);
                }
            }
            OverlapPolicy::CancelPrevious => {
                for run in self.open_runs(schedule.id).await? {
                    match self
                        .machine
                        .transition(
                            run.id,
                            TransitionRequest::cancel("superseded by newer occurrence"),
                            Concurrency::Pessimistic,
                        )
                        .await
                    {
                        Ok(_) => debug!(run_id = %run.id, "cancelled superseded run"),
                        Err(e) if e.is_benign_race() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        let options = RunOptions {
            idempotency_key: Some(key),
            trigger: TriggerStrategy::StartAt { at: occurrence },
            schedule_id: Some(schedule.id),
            ..Default::default()
        };
        self.machine
            .create(
                &schedule.workflow_name,
                &schedule.version_id,
                schedule.input.clone(),
                options,
            )
            .await?;
        Ok(true)
    }

    async fn open_runs(&self, schedule_id: Uuid) -> Result<Vec<crate::run::WorkflowRun>, ScheduleError> {
        let runs = self
            .store
            .scan_runs(&RunFilter::default().with_schedule_id(schedule_id))
            .await?;
        Ok(runs.into_iter().filter(|run| !run.is_terminal()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::StatusKind;
    use crate::store::InMemoryRunStore;
    use chrono::Duration;
    use serde_json::json;

    fn expander() -> ScheduleExpander {
        let machine = WorkflowRunStateMachine::new(Arc::new(InMemoryRunStore::new()));
        ScheduleExpander::new(machine)
    }

    async fn interval_schedule(
        expander: &ScheduleExpander,
        every_ms: u64,
        overlap: OverlapPolicy,
    ) -> Schedule {
        expander
            .create(
                "report",
                "v1",
                ScheduleSpec::Interval { every_ms },
                overlap,
                json!({"kind": "daily"}),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_due_schedule_creates_run() {
        let expander = expander();
        let schedule = interval_schedule(&expander, 60_000, OverlapPolicy::Allow).await;

        let later = Utc::now() + Duration::milliseconds(61_000);
        let created = expander.expand_due(later).await.unwrap();
        assert_eq!(created, 1);

        let runs = expander
            .store
            .scan_runs(&RunFilter::default().with_schedule_id(schedule.id))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].workflow_name, "report");
        assert_eq!(runs[0].input, json!({"kind": "daily"}));

        let after = expander.get(schedule.id).await.unwrap();
        assert_eq!(after.run_count, 1);
        assert!(after.next_run_at.unwrap() > later - Duration::milliseconds(60_000));
    }

    #[tokio::test]
    async fn test_expansion_is_idempotent() {
        let expander = expander();
        let schedule = interval_schedule(&expander, 60_000, OverlapPolicy::Allow).await;
        let later = Utc::now() + Duration::milliseconds(61_000);

        expander.expand_due(later).await.unwrap();

        // Rewind next_run_at to simulate a crash before the schedule
        // advanced; re-expansion must not duplicate the run.
        let mut rewound = expander.get(schedule.id).await.unwrap();
        rewound.next_run_at = schedule.next_run_at;
        rewound.run_count = 0;
        expander.store.update_schedule(rewound).await.unwrap();

        let created = expander.expand_due(later).await.unwrap();
        assert_eq!(created, 0);

        let runs = expander
            .store
            .scan_runs(&RunFilter::default().with_schedule_id(schedule.id))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_policy_skips_while_run_open() {
        let expander = expander();
        let schedule = interval_schedule(&expander, 1_000, OverlapPolicy::Skip).await;

        let t1 = Utc::now() + Duration::milliseconds(1_001);
        assert_eq!(expander.expand_due(t1).await.unwrap(), 1);

        // First run still open at the next occurrence.
        let t2 = t1 + Duration::milliseconds(1_001);
        assert_eq!(expander.expand_due(t2).await.unwrap(), 0);

        // next_run_at advanced despite skipping.
        let after = expander.get(schedule.id).await.unwrap();
        assert!(after.next_run_at.unwrap() > t2 - Duration::milliseconds(1_000));
    }

    #[tokio::test]
    async fn test_cancel_previous_policy() {
        let expander = expander();
        let schedule = interval_schedule(&expander, 1_000, OverlapPolicy::CancelPrevious).await;

        let t1 = Utc::now() + Duration::milliseconds(1_001);
        expander.expand_due(t1).await.unwrap();
        let t2 = t1 + Duration::milliseconds(1_001);
        expander.expand_due(t2).await.unwrap();

        let runs = expander
            .store
            .scan_runs(&RunFilter::default().with_schedule_id(schedule.id))
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        let cancelled = runs
            .iter()
            .filter(|r| r.status_kind() == StatusKind::Cancelled)
            .count();
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn test_paused_and_deleted_schedules_do_not_fire() {
        let expander = expander();
        let schedule = interval_schedule(&expander, 1_000, OverlapPolicy::Allow).await;
        expander.pause(schedule.id).await.unwrap();

        let later = Utc::now() + Duration::seconds(10);
        assert_eq!(expander.expand_due(later).await.unwrap(), 0);

        expander.delete(schedule.id).await.unwrap();
        assert_eq!(expander.expand_due(later).await.unwrap(), 0);

        // Deleted schedules stay resolvable but disappear from listings.
        assert!(expander.get(schedule.id).await.is_ok());
        assert!(expander.list().await.unwrap().is_empty());

        // And cannot be resumed.
        assert!(matches!(
            expander.resume(schedule.id).await,
            Err(ScheduleError::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn test_catch_up_is_bounded() {
        let expander = expander();
        interval_schedule(&expander, 10, OverlapPolicy::Allow).await;

        // Far in the future: far more occurrences than the cap.
        let later = Utc::now() + Duration::seconds(60);
        let created = expander.expand_due(later).await.unwrap();
        assert!(created <= super::super::schedule::MAX_OCCURRENCES_PER_EXPANSION + 1);
    }
}
