//! Consumer-group dispatch strategy
//!
//! Reads run-ready messages from per-(workflow, shard) broker streams
//! through a shared consumer group. Streams are discovered by prefix and
//! shuffled each poll so no stream is systematically favored; spare
//! capacity is split across them round-robin. A second pass reclaims
//! entries other consumers left pending past the idle threshold, which is
//! how work survives a worker crash.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, warn};
use uuid::Uuid;

use super::broker::{Broker, DeliveredMessage, RunMessage, STREAM_PREFIX};
use super::poller::{AdaptivePoller, PollerConfig};
use super::{DelayContext, DispatchStrategy, Receipt, WorkItem};

/// Configuration for [`StreamingStrategy`]
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Consumer group shared by all workers of a deployment.
    pub group: String,

    /// This worker's consumer name, unique within the group.
    pub consumer: String,

    /// How long a pending entry must sit idle before another consumer may
    /// claim it. Must comfortably exceed the longest expected handler run.
    pub claim_min_idle: Duration,

    /// Poll pacing.
    pub poller: PollerConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            group: "marathon-workers".to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            claim_min_idle: Duration::from_secs(30),
            poller: PollerConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle = idle;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }
}

/// [`DispatchStrategy`] backed by a stream broker with consumer groups.
pub struct StreamingStrategy {
    broker: Arc<dyn Broker>,
    config: StreamingConfig,
    poller: AdaptivePoller,
    /// Streams whose group registration already happened; groups are created
    /// lazily the first time a stream is seen.
    ensured: HashSet<String>,
}

impl StreamingStrategy {
    pub fn new(broker: Arc<dyn Broker>, config: StreamingConfig) -> Self {
        let poller = AdaptivePoller::new(config.poller.clone());
        Self {
            broker,
            config,
            poller,
            ensured: HashSet::new(),
        }
    }

    async fn ensure_group(&mut self, stream: &str) -> bool {
        if self.ensured.contains(stream) {
            return true;
        }
        match self.broker.ensure_group(stream, &self.config.group).await {
            Ok(()) => {
                self.ensured.insert(stream.to_string());
                true
            }
            Err(e) => {
                warn!(stream = %stream, error = %e, "group registration failed");
                false
            }
        }
    }

    /// Decode deliveries into work items, acknowledging poison messages so
    /// they never redeliver.
    async fn collect(&self, stream: &str, messages: Vec<DeliveredMessage>, out: &mut Vec<WorkItem>) {
        for message in messages {
            match serde_json::from_value::<RunMessage>(message.payload.clone()) {
                Ok(RunMessage::WorkflowRunReady { workflow_run_id }) => {
                    out.push(WorkItem {
                        workflow_run_id,
                        receipt: Some(Receipt {
                            stream: stream.to_string(),
                            message_id: message.id,
                        }),
                    });
                }
                Err(e) => {
                    warn!(stream = %stream, id = message.id, error = %e, "poison message, dropping");
                    if let Err(e) = self.broker.ack(stream, &self.config.group, message.id).await {
                        warn!(stream = %stream, id = message.id, error = %e, "poison ack failed");
                    }
                }
            }
        }
    }

    /// Reclaim entries other consumers left idle past the threshold.
    async fn claim_stale(&self, stream: &str, budget: usize, out: &mut Vec<WorkItem>) {
        let pending = match self.broker.pending(stream, &self.config.group).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(stream = %stream, error = %e, "pending scan failed");
                return;
            }
        };

        let stale_ids: Vec<u64> = pending
            .iter()
            .filter(|entry| entry.consumer != self.config.consumer)
            .map(|entry| entry.id)
            .take(budget)
            .collect();
        if stale_ids.is_empty() {
            return;
        }

        match self
            .broker
            .claim(
                stream,
                &self.config.group,
                &self.config.consumer,
                self.config.claim_min_idle,
                &stale_ids,
            )
            .await
        {
            Ok(claimed) => {
                if !claimed.is_empty() {
                    debug!(stream = %stream, count = claimed.len(), "claimed idle entries");
                }
                self.collect(stream, claimed, out).await;
            }
            Err(e) => {
                warn!(stream = %stream, error = %e, "claim failed");
            }
        }
    }
}

#[async_trait]
impl DispatchStrategy for StreamingStrategy {
    async fn next_batch(&mut self, capacity: usize) -> Vec<WorkItem> {
        let mut streams = match self.broker.list_streams(STREAM_PREFIX).await {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, "stream discovery failed");
                self.poller.force_slow_polling();
                return Vec::new();
            }
        };
        if streams.is_empty() {
            self.poller.record_no_work();
            return Vec::new();
        }

        streams.shuffle(&mut rand::thread_rng());
        let per_stream = capacity.div_ceil(streams.len()).max(1);

        let mut batch = Vec::new();
        for stream in &streams {
            if batch.len() >= capacity {
                break;
            }
            if !self.ensure_group(stream).await {
                continue;
            }
            let want = per_stream.min(capacity - batch.len());
            match self
                .broker
                .read_group(stream, &self.config.group, &self.config.consumer, want)
                .await
            {
                Ok(messages) => self.collect(stream, messages, &mut batch).await,
                // One broken stream must not starve the rest.
                Err(e) => warn!(stream = %stream, error = %e, "stream read failed"),
            }
        }

        // Second pass: pick up work abandoned by crashed consumers.
        for stream in &streams {
            if batch.len() >= capacity {
                break;
            }
            if !self.ensured.contains(stream) {
                continue;
            }
            let budget = capacity - batch.len();
            self.claim_stale(stream, budget, &mut batch).await;
        }

        if batch.is_empty() {
            self.poller.record_no_work();
        } else {
            self.poller.record_work_found();
        }
        batch
    }

    fn next_delay(&mut self, context: DelayContext) -> Duration {
        match context {
            DelayContext::AtCapacity => self.config.poller.min_interval,
            _ => self.poller.next_interval(),
        }
    }

    async fn acknowledge(&mut self, item: &WorkItem) {
        let Some(receipt) = &item.receipt else {
            return;
        };
        if let Err(e) = self
            .broker
            .ack(&receipt.stream, &self.config.group, receipt.message_id)
            .await
        {
            warn!(stream = %receipt.stream, id = receipt.message_id, error = %e, "ack failed");
        }
    }
}
