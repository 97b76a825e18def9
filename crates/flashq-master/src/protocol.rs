//! Requests and responses exchanged with producers, consumers and brokers.
//!
//! Only the fields the coordination engine acts on are modelled; transport
//! encoding is left to whatever RPC layer fronts the master.

use crate::MasterError;
use crate::event::ConsumerEvent;
use crate::lifecycle::{ManageStatus, RunStatus};
use crate::manifest::TopicConf;
use crate::types::{BrokerId, BrokerInfo, SubscribeInfo, TopicInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

fn require_name(context: &str, field: &str, value: &str) -> Result<(), MasterError> {
    if value.trim().is_empty() {
        return Err(MasterError::bad_request(context, format!("{field} is required")));
    }
    if value.contains('@') {
        return Err(MasterError::bad_request(
            context,
            format!("{field} '{value}' must not contain '@'"),
        ));
    }
    Ok(())
}

fn require_topics(context: &str, topics: &BTreeSet<String>) -> Result<(), MasterError> {
    if topics.is_empty() {
        return Err(MasterError::bad_request(context, "at least one topic is required"));
    }
    for topic in topics {
        require_name(context, "topic", topic)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerRegisterRequest {
    pub producer_id: String,
    pub host: String,
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub over_tls: bool,
    /// Broker list version the producer holds.
    #[serde(default)]
    pub broker_checksum: u64,
}

impl ProducerRegisterRequest {
    pub fn validate(&self) -> Result<(), MasterError> {
        let context = "producer register";
        require_name(context, "producer_id", &self.producer_id)?;
        require_topics(context, &self.topics)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducerHeartbeatRequest {
    pub producer_id: String,
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub broker_checksum: u64,
}

impl ProducerHeartbeatRequest {
    pub fn validate(&self) -> Result<(), MasterError> {
        let context = "producer heartbeat";
        require_name(context, "producer_id", &self.producer_id)?;
        require_topics(context, &self.topics)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerResponse {
    pub broker_checksum: u64,
    /// Present only when the producer's broker list is stale.
    pub brokers: Option<Vec<BrokerInfo>>,
    /// Publish-visible topic infos per requested topic.
    pub topic_partitions: BTreeMap<String, Vec<TopicInfo>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRegisterRequest {
    pub consumer_id: String,
    pub group: String,
    pub host: String,
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub topic_conditions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub over_tls: bool,
    #[serde(default)]
    pub bound: bool,
    #[serde(default)]
    pub required_partitions: BTreeMap<String, i64>,
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub source_count: u32,
    #[serde(default)]
    pub select_big: bool,
    /// Partitions the consumer already holds, e.g. after a master failover.
    #[serde(default)]
    pub subscribed: Vec<SubscribeInfo>,
    /// Consumer-side view of whether its group has been allocated yet.
    #[serde(default = "default_true")]
    pub not_allocated: bool,
}

fn default_true() -> bool {
    true
}

impl ConsumerRegisterRequest {
    pub fn validate(&self) -> Result<(), MasterError> {
        let context = "consumer register";
        require_name(context, "consumer_id", &self.consumer_id)?;
        require_name(context, "group", &self.group)?;
        require_topics(context, &self.topics)?;
        if let Some(topic) = self
            .topic_conditions
            .keys()
            .find(|topic| !self.topics.contains(*topic))
        {
            return Err(MasterError::bad_request(
                context,
                format!("filter conditions given for unsubscribed topic {topic}"),
            ));
        }
        if self.bound {
            if self.session_key.is_empty() {
                return Err(MasterError::bad_request(
                    context,
                    "bound consumption requires a session key",
                ));
            }
            if self.source_count == 0 {
                return Err(MasterError::bad_request(
                    context,
                    "bound consumption requires a positive source count",
                ));
            }
        } else if !self.required_partitions.is_empty() {
            return Err(MasterError::bad_request(
                context,
                "required partitions are only allowed for bound consumption",
            ));
        }
        validate_reported(context, &self.consumer_id, &self.group, &self.subscribed)
    }
}

fn validate_reported(
    context: &str,
    consumer_id: &str,
    group: &str,
    infos: &[SubscribeInfo],
) -> Result<(), MasterError> {
    match infos
        .iter()
        .find(|info| info.consumer_id != consumer_id || info.group != group)
    {
        Some(info) => Err(MasterError::bad_request(
            context,
            format!(
                "reported partition {} belongs to {}@{}",
                info.partition, info.consumer_id, info.group
            ),
        )),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRegisterResponse {
    pub not_allocated: bool,
    pub brokers: Vec<BrokerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerHeartbeatRequest {
    pub consumer_id: String,
    pub group: String,
    /// Rebalance id of the last event the consumer applied; zero when none.
    #[serde(default)]
    pub acked_rebalance_id: u64,
    /// Full list of partitions the consumer holds, when it chooses to report it.
    #[serde(default)]
    pub reported_subscriptions: Option<Vec<SubscribeInfo>>,
}

impl ConsumerHeartbeatRequest {
    pub fn validate(&self) -> Result<(), MasterError> {
        let context = "consumer heartbeat";
        require_name(context, "consumer_id", &self.consumer_id)?;
        require_name(context, "group", &self.group)?;
        match &self.reported_subscriptions {
            Some(infos) => validate_reported(context, &self.consumer_id, &self.group, infos),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerHeartbeatResponse {
    pub not_allocated: bool,
    pub event: Option<ConsumerEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerCloseRequest {
    pub consumer_id: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerRegisterRequest {
    pub broker_id: BrokerId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_port: u16,
    /// Configuration the broker is currently running.
    #[serde(default)]
    pub conf_id: u64,
    #[serde(default)]
    pub conf_checksum: u64,
}

impl BrokerRegisterRequest {
    pub fn validate(&self) -> Result<(), MasterError> {
        let context = "broker register";
        if self.host.trim().is_empty() {
            return Err(MasterError::bad_request(context, "host is required"));
        }
        if self.port == 0 {
            return Err(MasterError::bad_request(context, "port is required"));
        }
        if self.tls_enabled && self.tls_port == 0 {
            return Err(MasterError::bad_request(
                context,
                "tls_port is required when TLS is enabled",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerHeartbeatRequest {
    pub broker_id: BrokerId,
    /// The broker considers itself ready to serve.
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default = "default_true")]
    pub writable: bool,
    #[serde(default)]
    pub conf_id: u64,
    #[serde(default)]
    pub conf_checksum: u64,
}

/// Configuration pushed to a broker whose reported configuration is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfPush {
    pub conf_id: u64,
    pub conf_checksum: u64,
    pub topics: Vec<TopicConf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerResponse {
    pub manage_status: ManageStatus,
    pub run_status: RunStatus,
    pub conf: Option<BrokerConfPush>,
    /// Ask the broker to report its full configuration on the next heartbeat.
    pub need_report_data: bool,
}
