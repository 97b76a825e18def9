//! Manifest data structures describing configured brokers and black lists.

use crate::MasterError;
use crate::lifecycle::ManageStatus;
use crate::types::{BrokerId, PARTITION_STORE_STRIDE, TopicInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};

/// Seed data for the in-memory metadata store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterManifest {
    #[serde(default)]
    pub brokers: Vec<BrokerConf>,
    /// Group name to administratively blocked topics.
    #[serde(default)]
    pub black_topics: BTreeMap<String, BTreeSet<String>>,
}

/// Operator-side configuration of one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConf {
    pub broker_id: BrokerId,
    pub host: String,
    pub port: u16,
    /// Zero when the broker does not serve TLS.
    #[serde(default)]
    pub tls_port: u16,
    #[serde(default = "default_manage_status")]
    pub manage_status: ManageStatus,
    #[serde(default)]
    pub topics: Vec<TopicConf>,
    /// Bumped whenever the topic configuration changes.
    #[serde(default)]
    pub conf_id: u64,
}

fn default_manage_status() -> ManageStatus {
    ManageStatus::Online
}

impl BrokerConf {
    pub fn checksum(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.topics.hash(&mut hasher);
        hasher.finish()
    }

    /// Topic infos this broker exposes, masked by the accept flags of its current step.
    pub fn topic_infos(&self, accept_publish: bool, accept_subscribe: bool) -> Vec<TopicInfo> {
        self.topics
            .iter()
            .map(|topic| TopicInfo {
                broker_id: self.broker_id,
                topic: topic.topic.clone(),
                partition_count: topic.partition_count,
                store_count: topic.store_count,
                accept_publish: topic.accept_publish && accept_publish,
                accept_subscribe: topic.accept_subscribe && accept_subscribe,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicConf {
    pub topic: String,
    pub partition_count: u32,
    #[serde(default = "default_store_count")]
    pub store_count: u32,
    #[serde(default = "default_true")]
    pub accept_publish: bool,
    #[serde(default = "default_true")]
    pub accept_subscribe: bool,
}

impl TopicConf {
    pub fn new(topic: impl Into<String>, partition_count: u32, store_count: u32) -> Self {
        Self {
            topic: topic.into(),
            partition_count,
            store_count,
            accept_publish: true,
            accept_subscribe: true,
        }
    }
}

impl MasterManifest {
    /// Validate every broker configuration and reject duplicate broker ids.
    pub fn validate(&self) -> Result<(), MasterError> {
        let mut seen = HashSet::new();
        for conf in &self.brokers {
            conf.validate()?;
            if !seen.insert(conf.broker_id) {
                return Err(invalid_manifest(format!("duplicate broker id {}", conf.broker_id)));
            }
        }
        Ok(())
    }
}

impl BrokerConf {
    pub fn validate(&self) -> Result<(), MasterError> {
        if self.host.is_empty() || self.port == 0 {
            return Err(invalid_manifest(format!("{} has no valid address", self.broker_id)));
        }
        let mut topics = HashSet::new();
        for topic in &self.topics {
            topic.validate()?;
            if !topics.insert(topic.topic.as_str()) {
                return Err(invalid_manifest(format!(
                    "{} configures topic {} twice",
                    self.broker_id, topic.topic
                )));
            }
        }
        Ok(())
    }
}

impl TopicConf {
    /// Partition ids are `store * PARTITION_STORE_STRIDE + partition`, so the
    /// partition count must stay below the stride and the ids must fit a `u32`.
    pub fn validate(&self) -> Result<(), MasterError> {
        if self.topic.is_empty() {
            return Err(invalid_manifest("topic name must not be empty".to_string()));
        }
        if self.partition_count == 0 || self.partition_count >= PARTITION_STORE_STRIDE {
            return Err(invalid_manifest(format!(
                "topic {} partition_count {} must be between 1 and {}",
                self.topic,
                self.partition_count,
                PARTITION_STORE_STRIDE - 1
            )));
        }
        let max_store_count = u32::MAX / PARTITION_STORE_STRIDE;
        if self.store_count == 0 || self.store_count > max_store_count {
            return Err(invalid_manifest(format!(
                "topic {} store_count {} must be between 1 and {max_store_count}",
                self.topic, self.store_count
            )));
        }
        Ok(())
    }
}

fn invalid_manifest(reason: String) -> MasterError {
    MasterError::InvalidConfig {
        context: "manifest".to_string(),
        reason,
    }
}

fn default_store_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}
