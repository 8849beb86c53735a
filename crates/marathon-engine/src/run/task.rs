//! Task state and content-addressed task identity
//!
//! Tasks are keyed by a deterministic path derived from the owning run, the
//! task name, a hash of the input, and an optional idempotency key. The same
//! logical task invocation always resolves to the same key, so re-entry
//! after a crash finds the prior result instead of re-executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::state::SerializableError;

/// Per-task execution state, stored on the owning run.
///
/// Task transitions share the run's revision counter; a task state change is
/// itself a run mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    /// A worker is executing the task.
    Running { attempts: u32 },

    /// The task finished; `output` is what replay returns on re-entry.
    Completed { output: serde_json::Value },

    /// The task failed with no retry planned.
    Failed {
        reason: String,
        attempts: u32,
        attempted_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializableError>,
    },

    /// The task failed and a retry is planned for `next_attempt_at`.
    AwaitingRetry {
        reason: String,
        attempts: u32,
        attempted_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializableError>,
    },
}

impl TaskState {
    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Running { attempts }
            | Self::Failed { attempts, .. }
            | Self::AwaitingRetry { attempts, .. } => *attempts,
            Self::Completed { .. } => 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_awaiting_retry(&self) -> bool {
        matches!(self, Self::AwaitingRetry { .. })
    }

    /// The planned retry time, when one exists.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::AwaitingRetry {
                next_attempt_at, ..
            } => Some(*next_attempt_at),
            _ => None,
        }
    }
}

/// Compute the content-addressed path for a task invocation.
///
/// The path is stable across replays of the same run: it depends only on the
/// run id, the task name, the input, and an optional caller-supplied
/// idempotency key.
pub fn task_path(
    run_id: Uuid,
    task_name: &str,
    input: &serde_json::Value,
    idempotency_key: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(task_name.as_bytes());
    // serde_json preserves map insertion order, so the serialization of an
    // identical Value is identical.
    hasher.update(input.to_string().as_bytes());
    if let Some(key) = idempotency_key {
        hasher.update(key.as_bytes());
    }
    let digest = hasher.finalize();
    format!("{}/{}", task_name, &hex::encode(digest)[..16])
}
