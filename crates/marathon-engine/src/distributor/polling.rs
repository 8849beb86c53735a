//! Store-polling dispatch strategies
//!
//! The broker-free path: scan the run store for queued runs and hand their
//! ids out without claiming anything. Duplicate hand-outs are harmless, the
//! losing worker's `queued -> running` swap fails with a revision conflict.
//! Suited to single-process deployments and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::poller::{AdaptivePoller, PollerConfig};
use super::{DelayContext, DispatchStrategy, WorkItem};
use crate::run::StatusKind;
use crate::store::{RunFilter, RunStore};

/// Fixed-interval store polling.
pub struct PollingStrategy {
    store: Arc<dyn RunStore>,
    interval: Duration,
}

impl PollingStrategy {
    pub fn new(store: Arc<dyn RunStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

#[async_trait]
impl DispatchStrategy for PollingStrategy {
    async fn next_batch(&mut self, capacity: usize) -> Vec<WorkItem> {
        poll_queued(&self.store, capacity).await
    }

    fn next_delay(&mut self, _context: DelayContext) -> Duration {
        self.interval
    }

    async fn acknowledge(&mut self, _item: &WorkItem) {}
}

/// Store polling paced by an [`AdaptivePoller`].
pub struct AdaptivePollingStrategy {
    store: Arc<dyn RunStore>,
    poller: AdaptivePoller,
    min_interval: Duration,
}

impl AdaptivePollingStrategy {
    pub fn new(store: Arc<dyn RunStore>, config: PollerConfig) -> Self {
        let min_interval = config.min_interval;
        Self {
            store,
            poller: AdaptivePoller::new(config),
            min_interval,
        }
    }
}

#[async_trait]
impl DispatchStrategy for AdaptivePollingStrategy {
    async fn next_batch(&mut self, capacity: usize) -> Vec<WorkItem> {
        let batch = poll_queued(&self.store, capacity).await;
        if batch.is_empty() {
            self.poller.record_no_work();
        } else {
            self.poller.record_work_found();
        }
        batch
    }

    fn next_delay(&mut self, context: DelayContext) -> Duration {
        match context {
            // Full slots drain on their own; check back at the floor rate.
            DelayContext::AtCapacity => self.min_interval,
            _ => self.poller.next_interval(),
        }
    }

    async fn acknowledge(&mut self, _item: &WorkItem) {}
}

async fn poll_queued(store: &Arc<dyn RunStore>, capacity: usize) -> Vec<WorkItem> {
    match store
        .scan_runs(&RunFilter::by_status(StatusKind::Queued))
        .await
    {
        Ok(mut runs) => {
            // Oldest first so no queued run starves behind newer arrivals.
            runs.sort_by_key(|run| run.updated_at);
            runs.into_iter()
                .take(capacity)
                .map(|run| WorkItem::polled(run.id))
                .collect()
        }
        Err(e) => {
            warn!(error = %e, "queued-run scan failed");
            Vec::new()
        }
    }
}
