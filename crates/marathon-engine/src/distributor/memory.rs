//! In-memory implementation of the stream broker
//!
//! Single-process stand-in with the same visible semantics a Redis-streams
//! backend provides: per-stream monotone ids, per-group cursors, pending
//! lists with idle-based claim.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::broker::{Broker, BrokerError, DeliveredMessage, PendingEntry};

#[derive(Default)]
struct GroupState {
    /// Highest id delivered to this group.
    cursor: u64,
    pending: HashMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    next_id: u64,
    entries: Vec<(u64, serde_json::Value)>,
    groups: HashMap<String, GroupState>,
}

/// In-memory implementation of [`Broker`]
pub struct InMemoryBroker {
    streams: RwLock<HashMap<String, StreamState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Number of unread-or-pending entries on a stream (for tests).
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .read()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut streams = self.streams.write();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        stream: &str,
        payload: serde_json::Value,
    ) -> Result<u64, BrokerError> {
        let mut streams = self.streams.write();
        let state = streams.entry(stream.to_string()).or_default();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push((id, payload));
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<DeliveredMessage>, BrokerError> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;

        // Borrow entries and the group separately.
        let entries = &state.entries;
        let group_state =
            state
                .groups
                .get_mut(group)
                .ok_or_else(|| BrokerError::GroupNotFound {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })?;

        let now = Utc::now();
        let mut delivered = Vec::new();
        // Filter against the cursor as of loop start; the cursor advances
        // inside the loop.
        let cursor = group_state.cursor;
        for (id, payload) in entries.iter().filter(|(id, _)| *id > cursor) {
            if delivered.len() >= count {
                break;
            }
            group_state.cursor = *id;
            group_state.pending.insert(
                *id,
                PendingEntry {
                    id: *id,
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            delivered.push(DeliveredMessage {
                id: *id,
                payload: payload.clone(),
            });
        }
        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<(), BrokerError> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let group_state =
            state
                .groups
                .get_mut(group)
                .ok_or_else(|| BrokerError::GroupNotFound {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })?;

        group_state.pending.remove(&id);

        // Trim the entry once no group still has it unread or pending.
        let fully_consumed = |entry_id: u64, groups: &HashMap<String, GroupState>| {
            groups
                .values()
                .all(|g| g.cursor >= entry_id && !g.pending.contains_key(&entry_id))
        };
        let groups = &state.groups;
        state.entries.retain(|(entry_id, _)| !fully_consumed(*entry_id, groups));
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let streams = self.streams.read();
        let state = streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| BrokerError::GroupNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut entries: Vec<_> = group_state.pending.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[u64],
    ) -> Result<Vec<DeliveredMessage>, BrokerError> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;

        let entries = &state.entries;
        let group_state =
            state
                .groups
                .get_mut(group)
                .ok_or_else(|| BrokerError::GroupNotFound {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })?;

        let now = Utc::now();
        let min_idle = chrono::Duration::from_std(min_idle).unwrap_or(chrono::Duration::zero());

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = group_state.pending.get_mut(id) else {
                continue;
            };
            if now - pending.delivered_at < min_idle {
                continue;
            }
            let Some((_, payload)) = entries.iter().find(|(entry_id, _)| entry_id == id) else {
                // Entry trimmed under the pending record; drop the record.
                group_state.pending.remove(id);
                continue;
            };

            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(DeliveredMessage {
                id: *id,
                payload: payload.clone(),
            });
        }
        Ok(claimed)
    }

    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>, BrokerError> {
        let mut names: Vec<_> = self
            .streams
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
