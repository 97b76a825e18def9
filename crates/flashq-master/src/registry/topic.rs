//! Publish/subscribe topology per topic.
//!
//! `topic -> {broker -> TopicInfo}` is the publish side; the subscribe side maps
//! topics to consumer groups and producers. Brokers are referenced by id only.

use crate::types::{BrokerId, TopicInfo};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct TopicPSInfoManager {
    broker_pub: DashMap<String, HashMap<BrokerId, TopicInfo>>,
    group_sub: DashMap<String, BTreeSet<String>>,
    producer_pub: DashMap<String, BTreeSet<String>>,
}

impl TopicPSInfoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the topic info a broker publishes for its topic.
    pub fn set_topic_info(&self, info: TopicInfo) -> Option<TopicInfo> {
        self.broker_pub
            .entry(info.topic.clone())
            .or_default()
            .insert(info.broker_id, info)
    }

    pub fn remove_topic_info(&self, topic: &str, broker_id: BrokerId) -> Option<TopicInfo> {
        let removed = {
            let mut brokers = self.broker_pub.get_mut(topic)?;
            brokers.remove(&broker_id)
        };
        self.broker_pub
            .remove_if(topic, |_, brokers| brokers.is_empty());
        removed
    }

    pub fn topic_info(&self, topic: &str, broker_id: BrokerId) -> Option<TopicInfo> {
        self.broker_pub
            .get(topic)
            .and_then(|brokers| brokers.get(&broker_id).cloned())
    }

    /// Topic infos of every broker hosting `topic`, ordered by broker id.
    pub fn topic_infos(&self, topic: &str) -> Vec<TopicInfo> {
        let mut infos: Vec<TopicInfo> = self
            .broker_pub
            .get(topic)
            .map(|brokers| brokers.values().cloned().collect())
            .unwrap_or_default();
        infos.sort_by_key(|info| info.broker_id);
        infos
    }

    /// Topics for which `broker_id` currently publishes a topic info.
    pub fn topics_of_broker(&self, broker_id: BrokerId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .broker_pub
            .iter()
            .filter(|entry| entry.value().contains_key(&broker_id))
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn add_group_sub<'a>(&self, group: &str, topics: impl IntoIterator<Item = &'a String>) {
        for topic in topics {
            self.group_sub
                .entry(topic.clone())
                .or_default()
                .insert(group.to_string());
        }
    }

    pub fn remove_group_sub<'a>(&self, group: &str, topics: impl IntoIterator<Item = &'a String>) {
        for topic in topics {
            if let Some(mut groups) = self.group_sub.get_mut(topic) {
                groups.remove(group);
            }
            self.group_sub.remove_if(topic, |_, groups| groups.is_empty());
        }
    }

    pub fn subscribing_groups(&self, topic: &str) -> BTreeSet<String> {
        self.group_sub
            .get(topic)
            .map(|groups| groups.clone())
            .unwrap_or_default()
    }

    pub fn add_producer_pub<'a>(
        &self,
        producer_id: &str,
        topics: impl IntoIterator<Item = &'a String>,
    ) {
        for topic in topics {
            self.producer_pub
                .entry(topic.clone())
                .or_default()
                .insert(producer_id.to_string());
        }
    }

    pub fn remove_producer_pub<'a>(
        &self,
        producer_id: &str,
        topics: impl IntoIterator<Item = &'a String>,
    ) {
        for topic in topics {
            if let Some(mut producers) = self.producer_pub.get_mut(topic) {
                producers.remove(producer_id);
            }
            self.producer_pub
                .remove_if(topic, |_, producers| producers.is_empty());
        }
    }

    pub fn publishing_producers(&self, topic: &str) -> BTreeSet<String> {
        self.producer_pub
            .get(topic)
            .map(|producers| producers.clone())
            .unwrap_or_default()
    }
}
