//! Work distribution
//!
//! Moves queued runs into workers. A [`DispatchStrategy`] decides where
//! ready work comes from (store polling or broker consumer groups) and how
//! long to sleep between polls; the [`RunConsumer`] owns the worker loop:
//! batch sizes follow spare semaphore capacity, runs are claimed with an
//! optimistic `queued -> running` transition, and broker messages are
//! acknowledged only after the handler finishes.

pub mod broker;
pub mod memory;
pub mod poller;
pub mod polling;
pub mod streaming;

pub use broker::{stream_name, Broker, BrokerError, RunMessage};
pub use memory::InMemoryBroker;
pub use poller::{AdaptivePoller, PollerConfig};
pub use polling::{AdaptivePollingStrategy, PollingStrategy};
pub use streaming::{StreamingConfig, StreamingStrategy};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::machine::WorkflowRunStateMachine;
use crate::retry::{plan, RetryDecision};
use crate::run::{Concurrency, SerializableError, StatusKind, TransitionRequest, WorkflowRun};

/// Broker receipt for a delivered message; absent for store-polled work.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub stream: String,
    pub message_id: u64,
}

/// One ready run handed to the consumer.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub workflow_run_id: Uuid,
    pub receipt: Option<Receipt>,
}

impl WorkItem {
    pub fn polled(workflow_run_id: Uuid) -> Self {
        Self {
            workflow_run_id,
            receipt: None,
        }
    }
}

/// Why the consumer is about to sleep; strategies pace each case
/// differently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayContext {
    /// A poll just finished.
    Polled { found_work: bool },

    /// A source error occurred; `attempt` counts consecutive failures.
    Retry { attempt: u32 },

    /// Periodic liveness work (claim scans, group upkeep).
    Heartbeat,

    /// All worker slots are busy; polling would be wasted.
    AtCapacity,
}

/// Source of ready work plus its pacing policy.
///
/// `next_batch` must never return more items than `capacity` and must
/// swallow source errors (log, slow down, return what it has); the consumer
/// loop treats an empty batch and a failed poll identically.
#[async_trait]
pub trait DispatchStrategy: Send + 'static {
    async fn next_batch(&mut self, capacity: usize) -> Vec<WorkItem>;

    fn next_delay(&mut self, context: DelayContext) -> Duration;

    /// Mark an item fully processed. A no-op for unreceipted work.
    async fn acknowledge(&mut self, item: &WorkItem);
}

/// Handler invoked with a claimed (running) run snapshot. The handler drives
/// the run onward through the state machine; an `Err` return means an
/// unhandled failure and triggers the run-level retry path.
pub type RunHandler =
    Arc<dyn Fn(WorkflowRun) -> BoxFuture<'static, Result<(), SerializableError>> + Send + Sync>;

/// Configuration for [`RunConsumer`]
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Worker slots; also the upper bound on one poll's batch size.
    pub max_concurrency: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

impl ConsumerConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

/// The worker loop: polls a strategy for ready runs and executes them with
/// bounded concurrency.
pub struct RunConsumer<S: DispatchStrategy> {
    machine: WorkflowRunStateMachine,
    strategy: S,
    handler: RunHandler,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S: DispatchStrategy> RunConsumer<S> {
    pub fn new(
        machine: WorkflowRunStateMachine,
        strategy: S,
        handler: RunHandler,
        config: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            machine,
            strategy,
            handler,
            config,
            shutdown,
        }
    }

    /// Run until shutdown is signalled, then drain in-flight work.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<WorkItem>();

        info!(max_concurrency = self.config.max_concurrency, "consumer started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Acknowledge work finished since the last iteration.
            while let Ok(item) = ack_rx.try_recv() {
                self.strategy.acknowledge(&item).await;
            }

            let capacity = semaphore.available_permits();
            let delay = if capacity == 0 {
                self.strategy.next_delay(DelayContext::AtCapacity)
            } else {
                let batch = self.strategy.next_batch(capacity).await;
                let found_work = !batch.is_empty();

                for item in batch {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let machine = self.machine.clone();
                    let handler = self.handler.clone();
                    let ack_tx = ack_tx.clone();
                    tokio::spawn(async move {
                        if let Some(done) = execute_one(&machine, &handler, item).await {
                            let _ = ack_tx.send(done);
                        }
                        drop(permit);
                    });
                }

                self.strategy.next_delay(DelayContext::Polled { found_work })
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        // Wait for in-flight runs, then flush remaining acknowledgements.
        let _ = semaphore
            .acquire_many(self.config.max_concurrency as u32)
            .await;
        while let Ok(item) = ack_rx.try_recv() {
            self.strategy.acknowledge(&item).await;
        }
        info!("consumer stopped");
    }
}

/// Claim and execute one ready run. Returns the item when it should be
/// acknowledged; `None` leaves the broker entry pending for idle claim.
async fn execute_one(
    machine: &WorkflowRunStateMachine,
    handler: &RunHandler,
    item: WorkItem,
) -> Option<WorkItem> {
    let run_id = item.workflow_run_id;

    let run = match machine.get(run_id).await {
        Ok(run) => run,
        Err(crate::machine::TransitionError::NotFound(_)) => {
            // A message for a deleted run never becomes processable.
            warn!(run_id = %run_id, "ready message for unknown run, dropping");
            return Some(item);
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "run fetch failed, leaving pending");
            return None;
        }
    };

    if run.status_kind() != StatusKind::Queued {
        debug!(run_id = %run_id, status = %run.status_kind(), "run no longer queued, skipping");
        return Some(item);
    }

    // Optimistic claim: the losing worker gets a conflict and moves on.
    let running = match machine
        .transition(
            run_id,
            TransitionRequest::Running,
            Concurrency::Optimistic {
                expected_revision: run.revision,
            },
        )
        .await
    {
        Ok(running) => running,
        Err(e) if e.is_benign_race() => {
            debug!(run_id = %run_id, "lost claim race");
            return Some(item);
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "claim failed, leaving pending");
            return None;
        }
    };

    match (handler)(running.clone()).await {
        Ok(()) => Some(item),
        Err(error) => {
            settle_handler_failure(machine, &running, error).await;
            Some(item)
        }
    }
}

/// Route an unhandled handler failure through the run's retry strategy.
async fn settle_handler_failure(
    machine: &WorkflowRunStateMachine,
    running: &WorkflowRun,
    error: SerializableError,
) {
    let strategy = running.options.retry.clone().unwrap_or_default();
    let request = match plan(running.attempts, &strategy) {
        RetryDecision::Delay(delay) => TransitionRequest::AwaitingRetry {
            next_attempt_in_ms: delay.as_millis() as u64,
            error: Some(error),
        },
        RetryDecision::Exhausted => TransitionRequest::Failed { error },
    };

    match machine
        .transition(
            running.id,
            request,
            Concurrency::Optimistic {
                expected_revision: running.revision,
            },
        )
        .await
    {
        Ok(after) => {
            debug!(run_id = %running.id, status = %after.status_kind(), "handler failure settled");
        }
        // The handler already moved the run before failing; its transition
        // wins.
        Err(e) if e.is_benign_race() => {
            debug!(run_id = %running.id, "run moved during failure handling");
        }
        Err(e) => {
            warn!(run_id = %running.id, error = %e, "failed to settle handler failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunOptions;
    use crate::store::InMemoryRunStore;
    use serde_json::json;

    fn machine() -> WorkflowRunStateMachine {
        WorkflowRunStateMachine::new(Arc::new(InMemoryRunStore::new()))
    }

    fn completing_handler() -> RunHandler {
        Arc::new(|_run: WorkflowRun| Box::pin(async { Ok(()) }))
    }

    async fn queued_run(machine: &WorkflowRunStateMachine) -> WorkflowRun {
        let run = machine
            .create("billing", "v1", json!({}), RunOptions::default())
            .await
            .unwrap();
        machine
            .transition(
                run.id,
                TransitionRequest::Queued,
                Concurrency::Optimistic {
                    expected_revision: run.revision,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_one_claims_and_acks() {
        let machine = machine();
        let run = queued_run(&machine).await;

        let item = WorkItem::polled(run.id);
        let acked = execute_one(&machine, &completing_handler(), item).await;

        assert!(acked.is_some());
        let after = machine.get(run.id).await.unwrap();
        assert_eq!(after.status_kind(), StatusKind::Running);
        assert_eq!(after.attempts, 1);
    }

    #[tokio::test]
    async fn test_execute_one_acks_stale_message() {
        let machine = machine();
        let run = machine
            .create("billing", "v1", json!({}), RunOptions::default())
            .await
            .unwrap();

        // Still scheduled, not queued: the message is stale, acked, and the
        // run untouched.
        let acked = execute_one(&machine, &completing_handler(), WorkItem::polled(run.id)).await;
        assert!(acked.is_some());
        assert_eq!(
            machine.get(run.id).await.unwrap().status_kind(),
            StatusKind::Scheduled
        );
    }

    #[tokio::test]
    async fn test_execute_one_acks_unknown_run() {
        let machine = machine();
        let acked =
            execute_one(&machine, &completing_handler(), WorkItem::polled(Uuid::now_v7())).await;
        assert!(acked.is_some());
    }

    #[tokio::test]
    async fn test_handler_failure_goes_to_awaiting_retry() {
        let machine = machine();
        let run = queued_run(&machine).await;

        let failing: RunHandler = Arc::new(|_| {
            Box::pin(async { Err(SerializableError::new("Boom", "handler exploded")) })
        });
        execute_one(&machine, &failing, WorkItem::polled(run.id)).await;

        let after = machine.get(run.id).await.unwrap();
        assert_eq!(after.status_kind(), StatusKind::AwaitingRetry);
    }

    #[tokio::test]
    async fn test_handler_failure_exhausted_goes_to_failed() {
        let machine = machine();
        let run = machine
            .create(
                "billing",
                "v1",
                json!({}),
                RunOptions {
                    retry: Some(crate::retry::RetryStrategy::Never),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
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

        let failing: RunHandler =
            Arc::new(|_| Box::pin(async { Err(SerializableError::new("Boom", "fatal")) }));
        execute_one(&machine, &failing, WorkItem::polled(queued.id)).await;

        let after = machine.get(run.id).await.unwrap();
        assert_eq!(after.status_kind(), StatusKind::Failed);
    }
}
