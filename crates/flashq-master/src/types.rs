//! Core types shared by the registries, the balancer and the event protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Partition ids of a topic are `store * PARTITION_STORE_STRIDE + local_partition`.
pub const PARTITION_STORE_STRIDE: u32 = 10_000;

/// Unique identifier for a broker in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerId(pub u32);

impl From<u32> for BrokerId {
    fn from(id: u32) -> Self {
        BrokerId(id)
    }
}

impl From<BrokerId> for u32 {
    fn from(broker_id: BrokerId) -> Self {
        broker_id.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker-{}", self.0)
    }
}

/// Registered broker address. Replaced wholesale on re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: BrokerId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_port: u16,
}

impl BrokerInfo {
    pub fn new(id: BrokerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            tls_enabled: false,
            tls_port: 0,
        }
    }

    pub fn with_tls(mut self, tls_port: u16) -> Self {
        self.tls_enabled = true;
        self.tls_port = tls_port;
        self
    }

    /// Port a client connects to, depending on whether it talks TLS.
    pub fn port_for(&self, over_tls: bool) -> u16 {
        if over_tls { self.tls_port } else { self.port }
    }
}

/// A single partition of a topic hosted by one broker.
///
/// Equality, hashing and ordering only consider `(broker id, topic, partition id)`,
/// so two instances with different broker addresses or reset offsets are
/// interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub broker: BrokerInfo,
    pub topic: String,
    pub partition_id: u32,
    /// Offset the consumer must seek to when it connects, set by bound consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_offset: Option<i64>,
}

impl Partition {
    pub fn new(broker: BrokerInfo, topic: impl Into<String>, partition_id: u32) -> Self {
        Self {
            broker,
            topic: topic.into(),
            partition_id,
            reset_offset: None,
        }
    }

    pub fn with_reset_offset(mut self, offset: i64) -> Self {
        self.reset_offset = Some(offset);
        self
    }

    pub fn broker_id(&self) -> BrokerId {
        self.broker.id
    }

    /// Unique key: `{brokerId}-{topic}-{partitionId}`.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.broker.id.0, self.topic, self.partition_id)
    }

    /// Address-qualified form: `{brokerId}:{host}:{port}#{topic}:{partitionId}`.
    pub fn full_str(&self, over_tls: bool) -> String {
        format!(
            "{}:{}:{}#{}:{}",
            self.broker.id.0,
            self.broker.host,
            self.broker.port_for(over_tls),
            self.topic,
            self.partition_id
        )
    }

    /// Identity used when diffing assignments. TLS routing is address-sensitive.
    pub fn diff_key(&self, over_tls: bool) -> String {
        if over_tls {
            self.full_str(true)
        } else {
            self.key()
        }
    }

    fn identity(&self) -> (BrokerId, &str, u32) {
        (self.broker.id, self.topic.as_str(), self.partition_id)
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Partition {}

impl Hash for Partition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for Partition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Partition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Unit exchanged in connect/disconnect events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeInfo {
    pub consumer_id: String,
    pub group: String,
    #[serde(default)]
    pub over_tls: bool,
    pub partition: Partition,
}

impl SubscribeInfo {
    pub fn new(consumer: &ConsumerInfo, partition: Partition) -> Self {
        Self {
            consumer_id: consumer.consumer_id.clone(),
            group: consumer.group.clone(),
            over_tls: consumer.over_tls,
            partition,
        }
    }
}

/// Publish-side view of one topic on one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub broker_id: BrokerId,
    pub topic: String,
    pub partition_count: u32,
    pub store_count: u32,
    pub accept_publish: bool,
    pub accept_subscribe: bool,
}

impl TopicInfo {
    pub fn partition_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.store_count).flat_map(move |store| {
            (0..self.partition_count).map(move |p| store * PARTITION_STORE_STRIDE + p)
        })
    }

    /// Materialize the partitions of this topic on `broker`.
    pub fn partitions(&self, broker: &BrokerInfo) -> Vec<Partition> {
        self.partition_ids()
            .map(|pid| Partition::new(broker.clone(), self.topic.clone(), pid))
            .collect()
    }

    pub fn total_partitions(&self) -> u32 {
        self.partition_count * self.store_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: String,
    pub host: String,
    pub topics: BTreeSet<String>,
    pub over_tls: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub consumer_id: String,
    pub group: String,
    pub host: String,
    pub topics: BTreeSet<String>,
    /// Per-topic filter conditions; topics without filters are absent.
    #[serde(default)]
    pub topic_conditions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub over_tls: bool,
    /// Bound consumption: the consumer declares which partitions it wants.
    #[serde(default)]
    pub bound: bool,
    /// Declared partition key to requested start offset (negative means "no reset").
    #[serde(default)]
    pub required_partitions: BTreeMap<String, i64>,
    #[serde(default)]
    pub session_key: String,
    /// Number of members a bound group expects before it is assigned.
    #[serde(default)]
    pub source_count: u32,
    #[serde(default)]
    pub select_big: bool,
    pub registered_at: DateTime<Utc>,
}

impl ConsumerInfo {
    /// Key used for liveness tracking: `{consumerId}@{group}`.
    pub fn heartbeat_key(&self) -> String {
        consumer_heartbeat_key(&self.consumer_id, &self.group)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// TLS consumers can only reach brokers with TLS enabled.
    pub fn can_reach(&self, broker: &BrokerInfo) -> bool {
        !self.over_tls || broker.tls_enabled
    }
}

pub fn consumer_heartbeat_key(consumer_id: &str, group: &str) -> String {
    format!("{consumer_id}@{group}")
}

/// Split a consumer heartbeat key back into `(consumer_id, group)`.
pub fn split_consumer_heartbeat_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once('@')
}
