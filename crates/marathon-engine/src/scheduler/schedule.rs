//! Recurring schedule model
//!
//! A schedule turns a cron or interval spec into run creations. Occurrence
//! math lives here as pure functions; the expander applies overlap policy
//! and drives the state machine.
//!
//! Note: cron specs accept standard 5-field Unix expressions (minute, hour,
//! day-of-month, month, day-of-week); they are normalized to the 6-field
//! format (with seconds) the `cron` crate expects.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cap on occurrences computed in one expansion pass. A schedule that fell
/// far behind catches up across successive scans instead of enumerating
/// unboundedly.
pub const MAX_OCCURRENCES_PER_EXPANSION: usize = 32;

/// Errors from schedule spec handling
#[derive(Debug, thiserror::Error)]
pub enum ScheduleSpecError {
    /// Cron expression failed to parse
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    /// Interval must be positive
    #[error("interval must be positive, got {0}ms")]
    NonPositiveInterval(i64),
}

/// What happens when an occurrence fires while a previous run is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// One run per occurrence, regardless of open runs.
    Allow,

    /// Skip the occurrence (still advances `next_run_at`).
    Skip,

    /// Cancel the open run, then create the new one.
    CancelPrevious,
}

/// Schedule lifecycle status; deletion is a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Deleted,
}

/// Recurrence specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Standard 5-field Unix cron expression (6-field accepted).
    Cron { expr: String },

    /// Fixed interval between occurrences.
    Interval { every_ms: u64 },
}

impl ScheduleSpec {
    /// Validate the spec without computing occurrences.
    pub fn validate(&self) -> Result<(), ScheduleSpecError> {
        match self {
            Self::Cron { expr } => {
                parse_cron(expr)?;
                Ok(())
            }
            Self::Interval { every_ms } => {
                if *every_ms == 0 {
                    Err(ScheduleSpecError::NonPositiveInterval(0))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The first occurrence strictly after `after`.
    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleSpecError> {
        match self {
            Self::Cron { expr } => {
                let schedule = parse_cron(expr)?;
                Ok(schedule.after(&after).next())
            }
            Self::Interval { every_ms } => {
                if *every_ms == 0 {
                    return Err(ScheduleSpecError::NonPositiveInterval(0));
                }
                Ok(Some(after + Duration::milliseconds(*every_ms as i64)))
            }
        }
    }

    /// Occurrences strictly after `after` and at or before `until`, capped
    /// at [`MAX_OCCURRENCES_PER_EXPANSION`].
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleSpecError> {
        match self {
            Self::Cron { expr } => {
                let schedule = parse_cron(expr)?;
                Ok(schedule
                    .after(&after)
                    .take_while(|at| *at <= until)
                    .take(MAX_OCCURRENCES_PER_EXPANSION)
                    .collect())
            }
            Self::Interval { every_ms } => {
                if *every_ms == 0 {
                    return Err(ScheduleSpecError::NonPositiveInterval(0));
                }
                let step = Duration::milliseconds(*every_ms as i64);
                let mut occurrences = Vec::new();
                let mut at = after + step;
                while at <= until && occurrences.len() < MAX_OCCURRENCES_PER_EXPANSION {
                    occurrences.push(at);
                    at += step;
                }
                Ok(occurrences)
            }
        }
    }
}

/// Convert a 5-field Unix cron expression to the 6-field format the `cron`
/// crate requires, prepending second 0.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleSpecError> {
    cron::Schedule::from_str(&normalize_cron_expr(expr)).map_err(|e| {
        ScheduleSpecError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        }
    })
}

/// A recurring trigger definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub workflow_name: String,
    pub version_id: String,
    pub spec: ScheduleSpec,
    pub overlap: OverlapPolicy,
    pub status: ScheduleStatus,

    /// Input for each created run.
    pub input: serde_json::Value,

    /// Next due firing; `None` once the spec yields no further occurrences.
    pub next_run_at: Option<DateTime<Utc>>,

    /// The most recent occurrence that was expanded.
    pub last_occurrence: Option<DateTime<Utc>>,

    /// Runs created by this schedule.
    pub run_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create an active schedule, resolving the first `next_run_at`.
    pub fn new(
        workflow_name: impl Into<String>,
        version_id: impl Into<String>,
        spec: ScheduleSpec,
        overlap: OverlapPolicy,
        input: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleSpecError> {
        spec.validate()?;
        let next_run_at = spec.next_occurrence(now)?;
        Ok(Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            version_id: version_id.into(),
            spec,
            overlap,
            status: ScheduleStatus::Active,
            input,
            next_run_at,
            last_occurrence: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Due when active and `next_run_at <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active
            && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Deterministic per-occurrence reference, used as the created run's
    /// idempotency key so re-expansion after a crash is a no-op.
    pub fn occurrence_key(&self, occurrence: DateTime<Utc>) -> String {
        format!("schedule:{}:{}", self.id, occurrence.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_cron_expr() {
        // 5-field gets second 0 prepended
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("30 4 * * 1"), "0 30 4 * * 1");

        // 6-field unchanged
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn test_cron_validation() {
        assert!(ScheduleSpec::Cron {
            expr: "*/5 * * * *".to_string()
        }
        .validate()
        .is_ok());

        assert!(matches!(
            ScheduleSpec::Cron {
                expr: "not a cron".to_string()
            }
            .validate(),
            Err(ScheduleSpecError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_interval_occurrences() {
        let spec = ScheduleSpec::Interval { every_ms: 60_000 };
        let after = Utc::now();
        let until = after + Duration::milliseconds(180_000);

        let occurrences = spec.occurrences_between(after, until).unwrap();
        assert_eq!(occurrences.len(), 3);
        assert_eq!(occurrences[0], after + Duration::milliseconds(60_000));
        assert_eq!(occurrences[2], after + Duration::milliseconds(180_000));
    }

    #[test]
    fn test_occurrences_are_bounded() {
        let spec = ScheduleSpec::Interval { every_ms: 1 };
        let after = Utc::now();
        let until = after + Duration::seconds(10);

        let occurrences = spec.occurrences_between(after, until).unwrap();
        assert_eq!(occurrences.len(), MAX_OCCURRENCES_PER_EXPANSION);
    }

    #[test]
    fn test_cron_occurrences_every_minute() {
        let spec = ScheduleSpec::Cron {
            expr: "* * * * *".to_string(),
        };
        let after = Utc::now();
        let until = after + Duration::minutes(3);

        let occurrences = spec.occurrences_between(after, until).unwrap();
        assert!(occurrences.len() >= 2 && occurrences.len() <= 3);
        for window in occurrences.windows(2) {
            assert_eq!(window[1] - window[0], Duration::minutes(1));
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let spec = ScheduleSpec::Interval { every_ms: 0 };
        assert!(matches!(
            spec.validate(),
            Err(ScheduleSpecError::NonPositiveInterval(0))
        ));
    }

    #[test]
    fn test_schedule_due_and_occurrence_key() {
        let now = Utc::now();
        let mut schedule = Schedule::new(
            "report",
            "v1",
            ScheduleSpec::Interval { every_ms: 1_000 },
            OverlapPolicy::Allow,
            json!({}),
            now,
        )
        .unwrap();

        assert!(!schedule.is_due(now));
        assert!(schedule.is_due(now + Duration::seconds(2)));

        schedule.status = ScheduleStatus::Paused;
        assert!(!schedule.is_due(now + Duration::seconds(2)));

        let occurrence = now + Duration::seconds(1);
        assert_eq!(
            schedule.occurrence_key(occurrence),
            schedule.occurrence_key(occurrence)
        );
    }
}
