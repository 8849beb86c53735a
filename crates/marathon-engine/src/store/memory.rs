//! In-memory implementation of RunStore
//!
//! The reference implementation. It provides the same semantics a durable
//! transactional backend must provide: per-run compare-and-swap on revision,
//! atomic idempotency-key uniqueness at insert, snapshot scans.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{RunFilter, RunStore, StoreError};
use crate::run::WorkflowRun;
use crate::scheduler::schedule::Schedule;

/// In-memory implementation of [`RunStore`]
///
/// # Example
///
/// ```
/// use marathon_engine::store::InMemoryRunStore;
///
/// let store = InMemoryRunStore::new();
/// ```
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
    // (workflow_name, version_id, idempotency_key) -> run id
    idempotency_index: RwLock<HashMap<(String, String, String), Uuid>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl InMemoryRunStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            idempotency_index: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Get the number of schedules
    pub fn schedule_count(&self) -> usize {
        self.schedules.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
        self.idempotency_index.write().clear();
        self.schedules.write().clear();
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: WorkflowRun) -> Result<(), StoreError> {
        // Take both locks in a fixed order; insert and index update must be
        // atomic with respect to other inserts.
        let mut runs = self.runs.write();
        let mut index = self.idempotency_index.write();

        if runs.contains_key(&run.id) {
            return Err(StoreError::DuplicateRun(run.id));
        }

        if let Some(ref key) = run.options.idempotency_key {
            let index_key = (
                run.workflow_name.clone(),
                run.version_id.clone(),
                key.clone(),
            );
            if let Some(existing) = index.get(&index_key) {
                return Err(StoreError::DuplicateRun(*existing));
            }
            index.insert(index_key, run.id);
        }

        runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn find_by_idempotency_key(
        &self,
        workflow_name: &str,
        version_id: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        // Copy the id out so the index lock is released before `runs` is
        // taken; insert_run acquires the two locks in the opposite order.
        let run_id = self
            .idempotency_index
            .read()
            .get(&(
                workflow_name.to_string(),
                version_id.to_string(),
                key.to_string(),
            ))
            .copied();

        match run_id {
            Some(id) => Ok(self.runs.read().get(&id).cloned()),
            None => Ok(None),
        }
    }

    async fn update_run(
        &self,
        run: WorkflowRun,
        expected_revision: u64,
    ) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        let stored = runs
            .get_mut(&run.id)
            .ok_or(StoreError::RunNotFound(run.id))?;

        if stored.revision != expected_revision {
            return Err(StoreError::RevisionConflict {
                run_id: run.id,
                expected: expected_revision,
                actual: stored.revision,
            });
        }

        *stored = run;
        Ok(stored.clone())
    }

    async fn scan_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect())
    }

    async fn insert_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.write().insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule, StoreError> {
        self.schedules
            .read()
            .get(&schedule_id)
            .cloned()
            .ok_or(StoreError::ScheduleNotFound(schedule_id))
    }

    async fn update_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&schedule.id) {
            return Err(StoreError::ScheduleNotFound(schedule.id));
        }
        schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut schedules: Vec<_> = self.schedules.read().values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunOptions, StatusKind};
    use chrono::Utc;
    use serde_json::json;

    fn make_run(options: RunOptions) -> WorkflowRun {
        WorkflowRun::new("billing", "v1", json!({}), options, Utc::now())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryRunStore::new();
        let run = make_run(RunOptions::default());
        let id = run.id;

        store.insert_run(run).await.unwrap();
        let fetched = store.get_run(id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.revision, 0);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_reports_existing_id() {
        let store = InMemoryRunStore::new();
        let options = RunOptions {
            idempotency_key: Some("k1".to_string()),
            ..Default::default()
        };

        let first = make_run(options.clone());
        let first_id = first.id;
        store.insert_run(first).await.unwrap();

        let second = make_run(options);
        let err = store.insert_run(second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRun(id) if id == first_id));
        assert_eq!(store.run_count(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_scoped_by_name_and_version() {
        let store = InMemoryRunStore::new();
        let options = RunOptions {
            idempotency_key: Some("k1".to_string()),
            ..Default::default()
        };

        store.insert_run(make_run(options.clone())).await.unwrap();

        // Same key, different workflow version: no collision.
        let mut other = make_run(options);
        other.version_id = "v2".to_string();
        store.insert_run(other).await.unwrap();

        assert_eq!(store.run_count(), 2);
    }

    #[tokio::test]
    async fn test_update_run_revision_conflict() {
        let store = InMemoryRunStore::new();
        let run = make_run(RunOptions::default());
        store.insert_run(run.clone()).await.unwrap();

        let mut updated = run.clone();
        updated.revision = 1;

        // Stale expected revision.
        let err = store.update_run(updated.clone(), 3).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RevisionConflict {
                expected: 3,
                actual: 0,
                ..
            }
        ));

        // Matching expected revision succeeds and the new revision sticks.
        let stored = store.update_run(updated, 0).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.get_run(run.id).await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_scan_by_status() {
        let store = InMemoryRunStore::new();
        store.insert_run(make_run(RunOptions::default())).await.unwrap();
        store.insert_run(make_run(RunOptions::default())).await.unwrap();

        let scheduled = store
            .scan_runs(&RunFilter::by_status(StatusKind::Scheduled))
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 2);

        let running = store
            .scan_runs(&RunFilter::by_status(StatusKind::Running))
            .await
            .unwrap();
        assert!(running.is_empty());
    }
}
