//! Run store trait definition
//!
//! The run store is the only shared mutable resource in the engine: all
//! cross-actor coordination is expressed as compare-and-swap on
//! `(run_id, revision)`. Implementations must serialize concurrent updates
//! for the same run; updates for different runs are independent.
//!
//! There is no process-wide singleton; the store is passed as a constructed
//! dependency (`Arc<dyn RunStore>`).

mod memory;

pub use memory::InMemoryRunStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::run::{StatusKind, WorkflowRun};
use crate::scheduler::schedule::Schedule;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Schedule not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// Optimistic concurrency failure
    #[error("revision conflict on run {run_id}: expected {expected}, got {actual}")]
    RevisionConflict {
        run_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// An insert collided with an existing run (id or idempotency key);
    /// carries the existing run's id.
    #[error("run already exists: {0}")]
    DuplicateRun(Uuid),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),
}

/// Predicate for scanning runs.
///
/// Scans are snapshot reads; promotion scans filter by status kind and apply
/// due-time checks on the snapshot. Durable backends are free to push the
/// whole filter down.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<StatusKind>,
    pub workflow_name: Option<String>,
    pub schedule_id: Option<Uuid>,
    pub parent_workflow_run_id: Option<Uuid>,
}

impl RunFilter {
    pub fn by_status(status: StatusKind) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn by_parent(parent_id: Uuid) -> Self {
        Self {
            parent_workflow_run_id: Some(parent_id),
            ..Default::default()
        }
    }

    pub fn with_workflow_name(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = Some(name.into());
        self
    }

    pub fn with_schedule_id(mut self, id: Uuid) -> Self {
        self.schedule_id = Some(id);
        self
    }

    /// Whether a run matches this filter.
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        if let Some(status) = self.status {
            if run.status_kind() != status {
                return false;
            }
        }
        if let Some(ref name) = self.workflow_name {
            if &run.workflow_name != name {
                return false;
            }
        }
        if let Some(schedule_id) = self.schedule_id {
            if run.options.schedule_id != Some(schedule_id) {
                return false;
            }
        }
        if let Some(parent_id) = self.parent_workflow_run_id {
            if run.parent_workflow_run_id != Some(parent_id) {
                return false;
            }
        }
        true
    }
}

/// Store for workflow runs and schedules
///
/// Implementations must be thread-safe and give linearizable per-run
/// updates through the expected-revision check.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Insert a new run.
    ///
    /// Fails with [`StoreError::DuplicateRun`] if the id or the
    /// `(workflow_name, version_id, idempotency_key)` triple already exists;
    /// the error carries the existing run's id.
    async fn insert_run(&self, run: WorkflowRun) -> Result<(), StoreError>;

    /// Fetch a run snapshot.
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;

    /// Look up a run by idempotency key, scoped by workflow name + version.
    async fn find_by_idempotency_key(
        &self,
        workflow_name: &str,
        version_id: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    /// Replace a run, compare-and-swap on revision.
    ///
    /// `run` carries the already-bumped revision; the swap succeeds only if
    /// the stored revision still equals `expected_revision`. Returns the
    /// stored snapshot.
    async fn update_run(
        &self,
        run: WorkflowRun,
        expected_revision: u64,
    ) -> Result<WorkflowRun, StoreError>;

    /// Snapshot scan of runs matching a filter.
    async fn scan_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError>;

    // =========================================================================
    // Schedule Operations
    // =========================================================================

    /// Insert a new schedule.
    async fn insert_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;

    /// Fetch a schedule.
    async fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule, StoreError>;

    /// Replace a schedule.
    async fn update_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;

    /// All schedules, including paused and soft-deleted ones.
    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;
}
