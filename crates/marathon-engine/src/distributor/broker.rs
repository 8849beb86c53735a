//! Broker abstraction for work distribution
//!
//! Consumer-group semantics over named streams, modeled on Redis streams:
//! messages are appended with monotonically increasing ids, read through a
//! group cursor exactly once per group, tracked in a pending list until
//! acknowledged, and reclaimable by another consumer once idle long enough.
//!
//! One stream exists per `(workflow, shard)` pair so shard keys give cheap
//! ordering domains without per-message routing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix shared by all run streams.
pub const STREAM_PREFIX: &str = "marathon:runs";

/// Stream name for a workflow and optional shard key.
pub fn stream_name(workflow_name: &str, shard_key: Option<&str>) -> String {
    match shard_key {
        Some(shard) => format!("{STREAM_PREFIX}:{workflow_name}:{shard}"),
        None => format!("{STREAM_PREFIX}:{workflow_name}"),
    }
}

/// Errors from broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Unknown stream
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Unknown consumer group on a stream
    #[error("group '{group}' not found on stream '{stream}'")]
    GroupNotFound { stream: String, group: String },

    /// Transport or backend failure
    #[error("broker backend error: {0}")]
    Backend(String),
}

/// The wire payload published when a run becomes ready for pickup.
///
/// An enum so unknown message types fail decoding in one place and can be
/// dropped as poison without a panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunMessage {
    WorkflowRunReady { workflow_run_id: Uuid },
}

/// A message handed to a consumer. The payload stays raw JSON; decoding and
/// poison handling belong to the dispatch strategy.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub id: u64,
    pub payload: serde_json::Value,
}

/// A delivered-but-unacknowledged message, as seen in the pending list.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: u64,
    pub consumer: String,
    /// Last delivery time; idle time is measured from here.
    pub delivered_at: DateTime<Utc>,
    pub delivery_count: u32,
}

/// Stream broker with consumer-group delivery
///
/// Within one group each message is delivered to exactly one consumer at a
/// time; redelivery happens only through [`Broker::claim`] after the entry
/// sat idle. Distinct groups see independent copies of the stream.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Create the group on a stream if it does not exist. Idempotent; also
    /// creates the stream.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Append a message, returning its id.
    async fn publish(
        &self,
        stream: &str,
        payload: serde_json::Value,
    ) -> Result<u64, BrokerError>;

    /// Read up to `count` new messages for this consumer, advancing the
    /// group cursor and adding the messages to the pending list.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<DeliveredMessage>, BrokerError>;

    /// Acknowledge a delivered message, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<(), BrokerError>;

    /// The group's pending entries, ordered by id.
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError>;

    /// Transfer ownership of pending entries idle for at least `min_idle`
    /// to `consumer`, re-delivering their payloads. Entries not idle enough
    /// (or already acknowledged) are skipped.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[u64],
    ) -> Result<Vec<DeliveredMessage>, BrokerError>;

    /// All stream names starting with `prefix`.
    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>, BrokerError>;
}
