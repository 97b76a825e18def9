//! Registered consumers, grouped by consumer group.

use crate::MasterError;
use crate::types::ConsumerInfo;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Shared settings and membership of one consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerGroupInfo {
    pub group: String,
    pub topics: BTreeSet<String>,
    pub topic_conditions: BTreeMap<String, BTreeSet<String>>,
    pub bound: bool,
    pub select_big: bool,
    pub session_key: String,
    pub source_count: u32,
    pub consumers: BTreeMap<String, ConsumerInfo>,
    /// True until any member acknowledges its first event.
    pub not_allocated: bool,
    pub created_at: DateTime<Utc>,
}

impl ConsumerGroupInfo {
    fn from_first_member(consumer: &ConsumerInfo) -> Self {
        Self {
            group: consumer.group.clone(),
            topics: consumer.topics.clone(),
            topic_conditions: consumer.topic_conditions.clone(),
            bound: consumer.bound,
            select_big: consumer.select_big,
            session_key: consumer.session_key.clone(),
            source_count: consumer.source_count,
            consumers: BTreeMap::new(),
            not_allocated: true,
            created_at: Utc::now(),
        }
    }

    /// Check that a joining consumer agrees with the group's settings.
    fn check_member(&self, consumer: &ConsumerInfo) -> Result<(), MasterError> {
        let context = "consumer register";
        if consumer.topics != self.topics {
            return Err(MasterError::bad_request(
                context,
                format!(
                    "topics {:?} of {} differ from group {} topics {:?}",
                    consumer.topics, consumer.consumer_id, self.group, self.topics
                ),
            ));
        }
        if consumer.topic_conditions != self.topic_conditions {
            return Err(MasterError::bad_request(
                context,
                format!(
                    "topic filter conditions of {} differ from group {}",
                    consumer.consumer_id, self.group
                ),
            ));
        }
        if consumer.bound != self.bound {
            return Err(MasterError::bad_request(
                context,
                format!(
                    "bound consumption flag of {} differs from group {}",
                    consumer.consumer_id, self.group
                ),
            ));
        }
        if self.bound {
            if consumer.session_key != self.session_key {
                return Err(MasterError::bad_request(
                    context,
                    format!(
                        "session key {} differs from group {} session {}",
                        consumer.session_key, self.group, self.session_key
                    ),
                ));
            }
            if consumer.source_count != self.source_count {
                return Err(MasterError::bad_request(
                    context,
                    format!(
                        "source count {} differs from group {} source count {}",
                        consumer.source_count, self.group, self.source_count
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConsumerInfoHolder {
    groups: DashMap<String, ConsumerGroupInfo>,
    consumer_groups: DashMap<String, String>,
}

impl ConsumerInfoHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a consumer after checking it against its group and any
    /// previous registration.
    ///
    /// The group check and the insert happen under the group's map entry, so two
    /// consumers joining the same group cannot both pass against a stale view.
    /// The group is created, or refreshed from the consumer when it is the only member.
    pub fn add(&self, consumer: ConsumerInfo) -> Result<(), MasterError> {
        if let Some(group) = self.consumer_groups.get(&consumer.consumer_id) {
            if *group != consumer.group {
                return Err(MasterError::bad_request(
                    "consumer register",
                    format!(
                        "consumer {} is already registered in group {}",
                        consumer.consumer_id, *group
                    ),
                ));
            }
        }

        let consumer_id = consumer.consumer_id.clone();
        let group_name = consumer.group.clone();
        {
            let mut group = self
                .groups
                .entry(group_name.clone())
                .or_insert_with(|| ConsumerGroupInfo::from_first_member(&consumer));
            let sole_member = group.consumers.keys().all(|id| *id == consumer_id);
            if sole_member {
                let not_allocated = group.not_allocated;
                let created_at = group.created_at;
                *group = ConsumerGroupInfo {
                    not_allocated,
                    created_at,
                    ..ConsumerGroupInfo::from_first_member(&consumer)
                };
            } else {
                group.check_member(&consumer)?;
            }
            group.consumers.insert(consumer_id.clone(), consumer);
        }
        self.consumer_groups.insert(consumer_id, group_name);
        Ok(())
    }

    /// Remove a consumer. Returns it with a flag telling whether its group is now empty
    /// (and therefore removed).
    pub fn remove(&self, consumer_id: &str) -> Option<(ConsumerInfo, bool)> {
        let (_, group_name) = self.consumer_groups.remove(consumer_id)?;
        let removed = {
            let mut group = self.groups.get_mut(&group_name)?;
            group.consumers.remove(consumer_id)
        }?;
        let emptied = self
            .groups
            .remove_if(&group_name, |_, group| group.consumers.is_empty())
            .is_some();
        Some((removed, emptied))
    }

    pub fn group_of(&self, consumer_id: &str) -> Option<String> {
        self.consumer_groups.get(consumer_id).map(|g| g.clone())
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<ConsumerInfo> {
        let group = self.group_of(consumer_id)?;
        self.groups
            .get(&group)
            .and_then(|g| g.consumers.get(consumer_id).cloned())
    }

    pub fn contains(&self, consumer_id: &str) -> bool {
        self.consumer_groups.contains_key(consumer_id)
    }

    /// Members of a group ordered by consumer id.
    pub fn consumers_of(&self, group: &str) -> Vec<ConsumerInfo> {
        self.groups
            .get(group)
            .map(|g| g.consumers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn group_info(&self, group: &str) -> Option<ConsumerGroupInfo> {
        self.groups.get(group).map(|g| g.clone())
    }

    /// All group names, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        groups.sort();
        groups
    }

    pub fn set_allocated(&self, group: &str) {
        if let Some(mut group) = self.groups.get_mut(group) {
            group.not_allocated = false;
        }
    }

    pub fn is_not_allocated(&self, group: &str) -> bool {
        self.groups.get(group).is_none_or(|g| g.not_allocated)
    }

    pub fn consumer_count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |g| g.consumers.len())
    }
}
