//! # Marathon Engine
//!
//! A durable workflow execution engine: runs survive process crashes by
//! replaying handler code against append-only wait logs, and every status
//! change is a revision-gated compare-and-swap.
//!
//! ## Features
//!
//! - **Revision-gated transitions**: a validated transition table plus
//!   optimistic concurrency; stale writers lose cleanly
//! - **Crash-safe suspension**: named sleep, event, and child-workflow wait
//!   logs make handler replay deterministic
//! - **Timer-driven promotion**: stateless scans wake elapsed sleeps,
//!   retries, timeouts, and recurring schedules
//! - **Work distribution**: consumer-group streams with idle claim, or plain
//!   store polling with adaptive backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 WorkflowRunStateMachine                      │
//! │  (validates transitions, resolves wait logs, cascades)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RunStore                              │
//! │  (compare-and-swap on (run_id, revision), idempotent insert)│
//! └─────────────────────────────────────────────────────────────┘
//!                  ▲                          ▲
//!                  │                          │
//! ┌────────────────────────────┐ ┌────────────────────────────┐
//! │     PromotionScheduler     │ │        RunConsumer          │
//! │ (promotes elapsed waits,   │ │ (claims queued runs via a  │
//! │  expands schedules)        │ │  DispatchStrategy)          │
//! └────────────────────────────┘ └────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use marathon_engine::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryRunStore::new());
//! let machine = WorkflowRunStateMachine::new(store);
//!
//! let run = machine
//!     .create("billing", "v1", json!({"order": 42}), RunOptions::default())
//!     .await
//!     .unwrap();
//!
//! // The promotion scheduler queues it once its trigger elapses.
//! let scheduler = PromotionScheduler::new(machine.clone(), SchedulerConfig::default());
//! scheduler.tick(chrono::Utc::now()).await;
//!
//! assert_eq!(
//!     machine.get(run.id).await.unwrap().status_kind(),
//!     StatusKind::Queued
//! );
//! # }
//! ```

pub mod distributor;
pub mod machine;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod store;

/// Prelude for common imports
pub mod prelude {
    pub use crate::distributor::{
        AdaptivePollingStrategy, Broker, ConsumerConfig, DispatchStrategy, InMemoryBroker,
        PollerConfig, PollingStrategy, RunConsumer, RunHandler, StreamingConfig,
        StreamingStrategy, WorkItem,
    };
    pub use crate::machine::{TaskTransitionRequest, TransitionError, WorkflowRunStateMachine};
    pub use crate::retry::{plan, RetryDecision, RetryStrategy};
    pub use crate::run::{
        Concurrency, RunOptions, RunStatus, ScheduleReason, SerializableError, StatusKind,
        TransitionRequest, TriggerStrategy, WorkflowRun,
    };
    pub use crate::scheduler::{
        OverlapPolicy, PromotionScheduler, Schedule, ScheduleExpander, ScheduleSpec,
        SchedulerConfig,
    };
    pub use crate::store::{InMemoryRunStore, RunFilter, RunStore, StoreError};
}

// Re-export key types at crate root
pub use machine::{TaskTransitionRequest, TransitionError, WorkflowRunStateMachine};
pub use retry::{RetryDecision, RetryStrategy};
pub use run::{
    Concurrency, RunOptions, RunStatus, ScheduleReason, StatusKind, TransitionRequest,
    WorkflowRun,
};
pub use scheduler::{PromotionScheduler, ScheduleExpander, SchedulerConfig};
pub use store::{InMemoryRunStore, RunStore, StoreError};
