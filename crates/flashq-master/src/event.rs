//! Per-consumer queues of pending connect/disconnect events.
//!
//! At most one event per consumer is in flight: the head of the queue moves
//! from `Todo` to `Processing` when it is handed out in a heartbeat response and
//! leaves the queue when the consumer acknowledges its rebalance id.

use crate::types::SubscribeInfo;
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Connect,
    Disconnect,
    OnlyConnect,
    OnlyDisconnect,
}

impl EventType {
    pub fn is_connect(self) -> bool {
        matches!(self, EventType::Connect | EventType::OnlyConnect)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Connect => write!(f, "CONNECT"),
            EventType::Disconnect => write!(f, "DISCONNECT"),
            EventType::OnlyConnect => write!(f, "ONLY_CONNECT"),
            EventType::OnlyDisconnect => write!(f, "ONLY_DISCONNECT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Todo,
    Processing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerEvent {
    pub rebalance_id: u64,
    pub event_type: EventType,
    pub subscribe_infos: Vec<SubscribeInfo>,
    pub status: EventStatus,
}

impl ConsumerEvent {
    pub fn new(rebalance_id: u64, event_type: EventType, subscribe_infos: Vec<SubscribeInfo>) -> Self {
        Self {
            rebalance_id,
            event_type,
            subscribe_infos,
            status: EventStatus::Todo,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsumerEventManager {
    queues: DashMap<String, VecDeque<ConsumerEvent>>,
    /// Consecutive passes a group has been skipped for unacknowledged events.
    unfinished_counts: DashMap<String, u32>,
}

impl ConsumerEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connect_event(&self, consumer_id: &str, event: ConsumerEvent) {
        debug!(
            "[Add Connect Event] consumer={consumer_id} rebalance_id={} partitions={}",
            event.rebalance_id,
            event.subscribe_infos.len()
        );
        self.push(consumer_id, event);
    }

    pub fn add_disconnect_event(&self, consumer_id: &str, event: ConsumerEvent) {
        debug!(
            "[Add Disconnect Event] consumer={consumer_id} rebalance_id={} partitions={}",
            event.rebalance_id,
            event.subscribe_infos.len()
        );
        self.push(consumer_id, event);
    }

    fn push(&self, consumer_id: &str, event: ConsumerEvent) {
        self.queues
            .entry(consumer_id.to_string())
            .or_default()
            .push_back(event);
    }

    pub fn peek(&self, consumer_id: &str) -> Option<ConsumerEvent> {
        self.queues
            .get(consumer_id)
            .and_then(|queue| queue.front().cloned())
    }

    /// Hand out the head event if it has not been handed out yet.
    ///
    /// Returns `None` while the head is already `Processing`, so a consumer never
    /// sees a second event before acknowledging the first.
    pub fn next_for_delivery(&self, consumer_id: &str) -> Option<ConsumerEvent> {
        let mut queue = self.queues.get_mut(consumer_id)?;
        let head = queue.front_mut()?;
        if head.status == EventStatus::Processing {
            return None;
        }
        head.status = EventStatus::Processing;
        info!(
            "[Push Consumer Event] consumer={consumer_id} rebalance_id={} type={}",
            head.rebalance_id, head.event_type
        );
        Some(head.clone())
    }

    pub fn remove_first(&self, consumer_id: &str) -> Option<ConsumerEvent> {
        let removed = {
            let mut queue = self.queues.get_mut(consumer_id)?;
            queue.pop_front()
        };
        self.queues.remove_if(consumer_id, |_, queue| queue.is_empty());
        removed
    }

    /// Drop the in-flight head once the consumer reports `acked_id` as applied.
    pub fn acknowledge(&self, consumer_id: &str, acked_id: u64) -> Option<ConsumerEvent> {
        let acked = self.queues.get(consumer_id).is_some_and(|queue| {
            queue.front().is_some_and(|head| {
                head.status == EventStatus::Processing && head.rebalance_id <= acked_id
            })
        });
        if !acked {
            return None;
        }
        let mut event = self.remove_first(consumer_id)?;
        event.status = EventStatus::Done;
        info!(
            "[Event Processed] consumer={consumer_id} rebalance_id={} type={}",
            event.rebalance_id, event.event_type
        );
        Some(event)
    }

    /// Drop every queued event of a consumer. Returns how many were dropped.
    pub fn remove_all(&self, consumer_id: &str) -> usize {
        self.queues
            .remove(consumer_id)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0)
    }

    pub fn has_event(&self, consumer_id: &str) -> bool {
        self.queues
            .get(consumer_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    pub fn pending_count(&self, consumer_id: &str) -> usize {
        self.queues.get(consumer_id).map_or(0, |queue| queue.len())
    }

    /// Consumers that still have queued events.
    pub fn unprocessed_consumer_ids(&self) -> HashSet<String> {
        self.queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Count one more unfinished pass for every group in `groups` and forget the rest.
    pub fn update_unfinished_counts(&self, groups: &HashSet<String>) {
        self.unfinished_counts
            .retain(|group, _| groups.contains(group));
        for group in groups {
            *self.unfinished_counts.entry(group.clone()).or_insert(0) += 1;
        }
    }

    pub fn unfinished_count(&self, group: &str) -> u32 {
        self.unfinished_counts.get(group).map_or(0, |count| *count)
    }
}
