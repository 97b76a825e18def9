//! Target partition assignment for consumer groups.
//!
//! The balancer is a pure computation over registry snapshots. It produces, for
//! every consumer it handles, the partitions that consumer should hold per
//! subscribed topic; the rebalance orchestrator diffs that target against what
//! the consumer currently holds.

use crate::metadata_store::OffsetStore;
use crate::types::{BrokerId, ConsumerInfo, Partition};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// `topic -> partition key -> partition` held by one consumer.
pub type SubscriptionMap = HashMap<String, HashMap<String, Partition>>;

/// `consumer id -> topic -> partitions` produced by a balance strategy.
pub type Assignment = BTreeMap<String, BTreeMap<String, Vec<Partition>>>;

/// Everything the balancer needs to know about one group.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group: String,
    /// Members ordered by consumer id.
    pub consumers: Vec<ConsumerInfo>,
    pub topics: BTreeSet<String>,
    pub black_topics: HashSet<String>,
    /// Subscribable partitions per topic, sorted.
    pub partitions: BTreeMap<String, Vec<Partition>>,
    pub bound: bool,
    pub source_count: u32,
}

impl GroupSnapshot {
    fn broker_count(&self) -> usize {
        self.partitions
            .values()
            .flatten()
            .map(Partition::broker_id)
            .collect::<HashSet<BrokerId>>()
            .len()
    }

    fn topic_partitions(&self, topic: &str) -> &[Partition] {
        if self.black_topics.contains(topic) {
            return &[];
        }
        self.partitions
            .get(topic)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub trait LoadBalancer: Send + Sync {
    /// From-scratch assignment for groups without a prior assignment.
    fn bucket_assign(&self, groups: &[GroupSnapshot]) -> Assignment;

    /// Minimally disruptive assignment starting from what consumers hold.
    fn balance_cluster(
        &self,
        groups: &[GroupSnapshot],
        current: &HashMap<String, SubscriptionMap>,
    ) -> Assignment;

    /// Bound groups: hand out declared partitions with their requested start offsets.
    fn reset_bucket_assign(&self, groups: &[GroupSnapshot], offsets: &dyn OffsetStore)
    -> Assignment;

    /// Bound groups, keeping held partitions without re-seeking them.
    fn reset_balance_cluster(
        &self,
        groups: &[GroupSnapshot],
        current: &HashMap<String, SubscriptionMap>,
        offsets: &dyn OffsetStore,
    ) -> Assignment;
}

#[derive(Debug, Clone)]
pub struct DefaultLoadBalancer {
    /// Maximum brokers one consumer may be asked to read from; zero disables the cap.
    max_broker_consume_rate: u32,
}

impl DefaultLoadBalancer {
    pub fn new(max_broker_consume_rate: u32) -> Self {
        Self {
            max_broker_consume_rate,
        }
    }

    fn within_rate(&self, group: &GroupSnapshot) -> bool {
        if self.max_broker_consume_rate == 0 || group.consumers.is_empty() {
            return true;
        }
        let brokers = group.broker_count();
        let capacity = group.consumers.len() * self.max_broker_consume_rate as usize;
        if brokers > capacity {
            warn!(
                "[Rebalance] group {} skipped: {} brokers exceed {} consumers x rate {}",
                group.group,
                brokers,
                group.consumers.len(),
                self.max_broker_consume_rate
            );
            return false;
        }
        true
    }

    fn normal_groups<'a>(&self, groups: &'a [GroupSnapshot]) -> impl Iterator<Item = &'a GroupSnapshot> {
        groups
            .iter()
            .filter(|group| !group.bound && !group.consumers.is_empty())
            .filter(move |group| self.within_rate(group))
    }

    fn bound_groups<'a>(&self, groups: &'a [GroupSnapshot]) -> impl Iterator<Item = &'a GroupSnapshot> {
        groups.iter().filter(|group| {
            if !group.bound || group.consumers.is_empty() {
                return false;
            }
            if (group.consumers.len() as u32) < group.source_count {
                debug!(
                    "[Reset Rebalance] group {} waits for members: {}/{}",
                    group.group,
                    group.consumers.len(),
                    group.source_count
                );
                return false;
            }
            true
        })
    }

    fn reset_assign(
        &self,
        groups: &[GroupSnapshot],
        current: Option<&HashMap<String, SubscriptionMap>>,
        offsets: &dyn OffsetStore,
    ) -> Assignment {
        let mut assignment = Assignment::new();
        for group in self.bound_groups(groups) {
            let mut result = empty_targets(group);
            for topic in &group.topics {
                let available: HashMap<String, &Partition> = group
                    .topic_partitions(topic)
                    .iter()
                    .map(|p| (p.key(), p))
                    .collect();
                let mut claimed: HashSet<String> = HashSet::new();

                for consumer in group.consumers.iter().filter(|c| c.is_subscribed(topic)) {
                    for (key, requested) in &consumer.required_partitions {
                        let Some(partition) = available.get(key) else {
                            continue;
                        };
                        if !consumer.can_reach(&partition.broker) || !claimed.insert(key.clone()) {
                            continue;
                        }
                        let held = current
                            .and_then(|c| c.get(&consumer.consumer_id))
                            .and_then(|subs| subs.get(topic))
                            .is_some_and(|held| held.contains_key(key));
                        let mut target = (*partition).clone();
                        if !held && *requested >= 0 {
                            let committed = offsets.committed_offset(&group.group, key);
                            if committed != Some(*requested) {
                                target = target.with_reset_offset(*requested);
                            }
                        }
                        push_target(&mut result, consumer, topic, target);
                    }
                }
            }
            assignment.extend(result);
        }
        assignment
    }
}

impl LoadBalancer for DefaultLoadBalancer {
    fn bucket_assign(&self, groups: &[GroupSnapshot]) -> Assignment {
        let mut assignment = Assignment::new();
        for group in self.normal_groups(groups) {
            let mut result = empty_targets(group);
            let mut totals: HashMap<&str, usize> = HashMap::new();

            for topic in &group.topics {
                let candidates: Vec<&ConsumerInfo> = group
                    .consumers
                    .iter()
                    .filter(|c| c.is_subscribed(topic))
                    .collect();
                let mut per_topic: HashMap<&str, usize> = HashMap::new();

                for partition in group.topic_partitions(topic) {
                    let chosen = candidates
                        .iter()
                        .copied()
                        .filter(|c| c.can_reach(&partition.broker))
                        .min_by_key(|&c| {
                            let id = c.consumer_id.as_str();
                            (
                                per_topic.get(id).copied().unwrap_or(0),
                                totals.get(id).copied().unwrap_or(0),
                                id,
                            )
                        });
                    let Some(consumer) = chosen else {
                        continue;
                    };
                    *per_topic.entry(consumer.consumer_id.as_str()).or_default() += 1;
                    *totals.entry(consumer.consumer_id.as_str()).or_default() += 1;
                    push_target(&mut result, consumer, topic, partition.clone());
                }
            }
            assignment.extend(result);
        }
        assignment
    }

    fn balance_cluster(
        &self,
        groups: &[GroupSnapshot],
        current: &HashMap<String, SubscriptionMap>,
    ) -> Assignment {
        let mut assignment = Assignment::new();
        for group in self.normal_groups(groups) {
            let mut result = empty_targets(group);
            for topic in &group.topics {
                let candidates: Vec<&ConsumerInfo> = group
                    .consumers
                    .iter()
                    .filter(|c| c.is_subscribed(topic))
                    .collect();
                if candidates.is_empty() {
                    continue;
                }
                let eligible: BTreeMap<String, &Partition> = group
                    .topic_partitions(topic)
                    .iter()
                    .map(|p| (p.key(), p))
                    .collect();

                // Valid current holdings, each partition credited to one consumer only.
                let mut claimed: HashSet<&str> = HashSet::new();
                let holdings: Vec<Vec<&str>> = candidates
                    .iter()
                    .map(|consumer| {
                        let mut held: Vec<&str> = current
                            .get(&consumer.consumer_id)
                            .and_then(|subs| subs.get(topic))
                            .map(|held| {
                                held.keys()
                                    .filter_map(|key| eligible.get_key_value(key))
                                    .filter(|(_, p)| consumer.can_reach(&p.broker))
                                    .map(|(key, _)| key.as_str())
                                    .collect()
                            })
                            .unwrap_or_default();
                        held.sort_unstable();
                        held.retain(|key| claimed.insert(*key));
                        held
                    })
                    .collect();

                let quotas = quotas(eligible.len(), &candidates, &holdings);
                let mut kept: Vec<Vec<&str>> = holdings
                    .iter()
                    .zip(&quotas)
                    .map(|(held, quota)| held.iter().take(*quota).copied().collect())
                    .collect();
                let assigned: HashSet<&str> = kept.iter().flatten().copied().collect();

                for (key, partition) in eligible.iter().filter(|(k, _)| !assigned.contains(k.as_str())) {
                    let reachable = |i: &usize| candidates[*i].can_reach(&partition.broker);
                    let deficit = (0..candidates.len())
                        .filter(reachable)
                        .filter(|i| kept[*i].len() < quotas[*i])
                        .max_by_key(|i| (quotas[*i] - kept[*i].len(), std::cmp::Reverse(*i)));
                    let chosen = deficit.or_else(|| {
                        (0..candidates.len())
                            .filter(reachable)
                            .min_by_key(|i| (kept[*i].len(), *i))
                    });
                    if let Some(i) = chosen {
                        kept[i].push(key.as_str());
                    }
                }

                for (consumer, keys) in candidates.iter().zip(kept) {
                    let mut keys = keys;
                    keys.sort_unstable();
                    for key in keys {
                        if let Some(partition) = eligible.get(key) {
                            push_target(&mut result, consumer, topic, (*partition).clone());
                        }
                    }
                }
            }
            assignment.extend(result);
        }
        assignment
    }

    fn reset_bucket_assign(
        &self,
        groups: &[GroupSnapshot],
        offsets: &dyn OffsetStore,
    ) -> Assignment {
        self.reset_assign(groups, None, offsets)
    }

    fn reset_balance_cluster(
        &self,
        groups: &[GroupSnapshot],
        current: &HashMap<String, SubscriptionMap>,
        offsets: &dyn OffsetStore,
    ) -> Assignment {
        self.reset_assign(groups, Some(current), offsets)
    }
}

/// Per-consumer share of `total` partitions. The `total % n` extra slots go to
/// the consumers already holding the most, ties to the lowest id.
fn quotas(total: usize, candidates: &[&ConsumerInfo], holdings: &[Vec<&str>]) -> Vec<usize> {
    let n = candidates.len();
    let base = total / n;
    let extra = total % n;
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| {
        holdings[*b]
            .len()
            .cmp(&holdings[*a].len())
            .then_with(|| candidates[*a].consumer_id.cmp(&candidates[*b].consumer_id))
    });
    let mut quotas = vec![base; n];
    for i in order.into_iter().take(extra) {
        quotas[i] += 1;
    }
    quotas
}

/// Every member gets an entry for each topic it subscribes to, possibly empty,
/// so topics that lost all partitions still produce disconnects.
fn empty_targets(group: &GroupSnapshot) -> Assignment {
    group
        .consumers
        .iter()
        .map(|consumer| {
            let topics = consumer
                .topics
                .iter()
                .map(|topic| (topic.clone(), Vec::new()))
                .collect();
            (consumer.consumer_id.clone(), topics)
        })
        .collect()
}

fn push_target(result: &mut Assignment, consumer: &ConsumerInfo, topic: &str, partition: Partition) {
    result
        .entry(consumer.consumer_id.clone())
        .or_default()
        .entry(topic.to_string())
        .or_default()
        .push(partition);
}
