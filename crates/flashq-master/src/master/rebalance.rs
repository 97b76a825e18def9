//! Rebalance passes: group selection, sharding, target diffing and event scheduling.

use super::Master;
use crate::balancer::{GroupSnapshot, SubscriptionMap};
use crate::event::{ConsumerEvent, EventType};
use crate::heartbeat::NodeClass;
use crate::types::{ConsumerInfo, Partition, SubscribeInfo};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

/// Decrements the in-flight shard counter however the shard ends.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Partitions to drop and to take up for one consumer.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct SubscriptionDiff {
    pub disconnect: Vec<Partition>,
    pub connect: Vec<Partition>,
}

impl SubscriptionDiff {
    fn is_empty(&self) -> bool {
        self.disconnect.is_empty() && self.connect.is_empty()
    }
}

/// Compare what a consumer holds with its target.
///
/// Black-listed topics are always emptied. Without a target only black-listed
/// topics change. TLS consumers compare partitions by their full address form.
pub(crate) fn diff_subscription(
    consumer: &ConsumerInfo,
    held: Option<&SubscriptionMap>,
    target: Option<&BTreeMap<String, Vec<Partition>>>,
    black_topics: &HashSet<String>,
) -> SubscriptionDiff {
    let tls = consumer.over_tls;
    let mut topics: BTreeSet<&str> = BTreeSet::new();
    topics.extend(held.into_iter().flat_map(|subs| subs.keys().map(String::as_str)));
    topics.extend(target.into_iter().flat_map(|t| t.keys().map(String::as_str)));

    let mut diff = SubscriptionDiff::default();
    for topic in topics {
        let holding: Vec<&Partition> = held
            .and_then(|subs| subs.get(topic))
            .map(|parts| parts.values().collect())
            .unwrap_or_default();
        let wanted: Vec<&Partition> = if black_topics.contains(topic) {
            Vec::new()
        } else {
            match target {
                Some(target) => target
                    .get(topic)
                    .map(|parts| parts.iter().collect())
                    .unwrap_or_default(),
                None => holding.clone(),
            }
        };

        let holding_keys: HashSet<String> = holding.iter().map(|p| p.diff_key(tls)).collect();
        let wanted_keys: HashSet<String> = wanted.iter().map(|p| p.diff_key(tls)).collect();
        diff.disconnect.extend(
            holding
                .into_iter()
                .filter(|p| !wanted_keys.contains(&p.diff_key(tls)))
                .cloned(),
        );
        diff.connect.extend(
            wanted
                .into_iter()
                .filter(|p| !holding_keys.contains(&p.diff_key(tls)))
                .cloned(),
        );
    }
    diff.disconnect.sort();
    diff.connect.sort();
    diff
}

impl Master {
    /// Start one rebalance pass and return the handles of its shard tasks.
    ///
    /// Skipped entirely while shards of a previous pass are still running.
    /// Must be called from within a tokio runtime.
    pub fn run_balance_pass(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let Some(_setup) = self.pass_setup.try_lock() else {
            debug!("[Rebalance] another pass is being set up");
            return Vec::new();
        };
        let rebalance_id = self.rebalance_id.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            info!("[Rebalance] pass {rebalance_id} skipped: {in_flight} shards still running");
            return Vec::new();
        }

        let first_pass = self.first_pass.swap(false, Ordering::SeqCst);
        let groups = if first_pass {
            self.consumers.groups()
        } else {
            self.groups_needing_balance()
        };
        if groups.is_empty() {
            debug!("[Rebalance] pass {rebalance_id}: no groups to balance");
            return Vec::new();
        }

        let shard_size = groups.len().div_ceil(self.config.rebalance_parallelism.max(1));
        let shards: Vec<Vec<String>> = groups.chunks(shard_size).map(<[String]>::to_vec).collect();
        self.in_flight.store(shards.len(), Ordering::SeqCst);
        info!(
            "[Rebalance Start] id={rebalance_id} groups={} shards={} first_pass={first_pass}",
            groups.len(),
            shards.len()
        );

        shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| {
                let master = Arc::clone(self);
                tokio::task::spawn_blocking(move || {
                    let _in_flight = InFlightGuard(&master.in_flight);
                    master.balance_shard(rebalance_id, index, &shard, first_pass);
                })
            })
            .collect()
    }

    /// Run a pass and wait for all of its shards.
    pub async fn rebalance_now(self: &Arc<Self>) {
        for result in join_all(self.run_balance_pass()).await {
            if let Err(err) = result {
                warn!("[Rebalance] shard task failed: {err}");
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, groups), fields(groups = groups.len()))]
    fn balance_shard(&self, rebalance_id: u64, shard: usize, groups: &[String], first_pass: bool) {
        let snapshots = self.group_snapshots(groups);
        let current = self.current_holdings(&snapshots);
        let offsets = self.offset_store.as_ref();

        let reset = if first_pass {
            self.balancer.reset_bucket_assign(&snapshots, offsets)
        } else {
            self.balancer
                .reset_balance_cluster(&snapshots, &current, offsets)
        };
        let reset_events = self.schedule_assignment(rebalance_id, &snapshots, &reset, &current, true);

        let normal = if first_pass {
            self.balancer.bucket_assign(&snapshots)
        } else {
            self.balancer.balance_cluster(&snapshots, &current)
        };
        let normal_events = self.schedule_assignment(rebalance_id, &snapshots, &normal, &current, false);

        info!(
            "[Rebalance End] id={rebalance_id} shard={shard} groups={} reset_events={reset_events} events={normal_events}",
            groups.len()
        );
    }

    /// Registry snapshots of `groups`; subscribable partitions are those with
    /// subscribe visibility on a registered broker.
    pub(crate) fn group_snapshots(&self, groups: &[String]) -> Vec<GroupSnapshot> {
        groups
            .iter()
            .filter_map(|group| {
                let info = self.consumers.group_info(group)?;
                let partitions = info
                    .topics
                    .iter()
                    .map(|topic| (topic.clone(), self.subscribable_partitions(topic)))
                    .collect();
                Some(GroupSnapshot {
                    group: info.group,
                    consumers: info.consumers.into_values().collect(),
                    topics: info.topics,
                    black_topics: self.metadata_store.black_topics(group),
                    partitions,
                    bound: info.bound,
                    source_count: info.source_count,
                })
            })
            .collect()
    }

    fn subscribable_partitions(&self, topic: &str) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self
            .topics
            .topic_infos(topic)
            .into_iter()
            .filter(|info| info.accept_subscribe)
            .filter_map(|info| {
                self.brokers
                    .get(info.broker_id)
                    .map(|broker| info.partitions(&broker))
            })
            .flatten()
            .collect();
        partitions.sort();
        partitions
    }

    fn current_holdings(&self, snapshots: &[GroupSnapshot]) -> HashMap<String, SubscriptionMap> {
        snapshots
            .iter()
            .flat_map(|snapshot| &snapshot.consumers)
            .filter_map(|consumer| {
                self.current_subscription(&consumer.consumer_id)
                    .map(|subs| (consumer.consumer_id.clone(), subs))
            })
            .collect()
    }

    /// Diff every consumer of the matching groups against its target and queue
    /// the resulting events. Returns the number of events queued.
    fn schedule_assignment(
        &self,
        rebalance_id: u64,
        snapshots: &[GroupSnapshot],
        assignment: &BTreeMap<String, BTreeMap<String, Vec<Partition>>>,
        current: &HashMap<String, SubscriptionMap>,
        reset: bool,
    ) -> usize {
        let mut queued = 0;
        for snapshot in snapshots.iter().filter(|s| s.bound == reset) {
            for consumer in &snapshot.consumers {
                let diff = diff_subscription(
                    consumer,
                    current.get(&consumer.consumer_id),
                    assignment.get(&consumer.consumer_id),
                    &snapshot.black_topics,
                );
                if !diff.is_empty() {
                    queued += self.schedule_events(rebalance_id, consumer, diff, reset);
                }
            }
        }
        queued
    }

    /// Queue the disconnect event, then the connect event, of one consumer.
    fn schedule_events(
        &self,
        rebalance_id: u64,
        consumer: &ConsumerInfo,
        diff: SubscriptionDiff,
        reset: bool,
    ) -> usize {
        let consumer_id = consumer.consumer_id.as_str();
        let _guard = match self.consumer_lock.acquire(consumer_id) {
            Ok(guard) => guard,
            Err(err) => {
                warn!("[Rebalance] {consumer_id} skipped until the next pass: {err}");
                return 0;
            }
        };
        if !self.consumers.contains(consumer_id) {
            debug!("[Rebalance] {consumer_id} left during pass {rebalance_id}");
            return 0;
        }

        let paired = !diff.disconnect.is_empty() && !diff.connect.is_empty();
        let mut queued = 0;
        if !diff.disconnect.is_empty() {
            let event_type = if paired {
                EventType::Disconnect
            } else {
                EventType::OnlyDisconnect
            };
            info!(
                "[Disconnect] {consumer_id}@{} rebalance_id={rebalance_id} {:?}",
                consumer.group,
                diff.disconnect.iter().map(Partition::key).collect::<Vec<_>>()
            );
            let infos = diff
                .disconnect
                .into_iter()
                .map(|partition| SubscribeInfo::new(consumer, partition))
                .collect();
            self.events
                .add_disconnect_event(consumer_id, ConsumerEvent::new(rebalance_id, event_type, infos));
            queued += 1;
        }
        if !diff.connect.is_empty() {
            let event_type = if paired {
                EventType::Connect
            } else {
                EventType::OnlyConnect
            };
            info!(
                "[{}] {consumer_id}@{} rebalance_id={rebalance_id} {:?}",
                if reset { "ResetConnect" } else { "Connect" },
                consumer.group,
                diff.connect.iter().map(Partition::key).collect::<Vec<_>>()
            );
            let infos = diff
                .connect
                .into_iter()
                .map(|partition| SubscribeInfo::new(consumer, partition))
                .collect();
            self.events
                .add_connect_event(consumer_id, ConsumerEvent::new(rebalance_id, event_type, infos));
            queued += 1;
        }
        queued
    }

    /// Groups to balance on a regular pass.
    ///
    /// Groups whose live members still have queued events are left alone, unless
    /// that has lasted `max_unfinished_balance_rounds` passes, in which case their
    /// backlog is dropped, their round count starts over and they are balanced again.
    pub(crate) fn groups_needing_balance(&self) -> Vec<String> {
        let max_rounds = self.config.max_unfinished_balance_rounds;
        let mut waiting: HashSet<String> = HashSet::new();
        let mut cleared: HashSet<String> = HashSet::new();
        for consumer_id in self.events.unprocessed_consumer_ids() {
            let Some(consumer) = self.consumers.consumer(&consumer_id) else {
                continue;
            };
            if !self
                .heartbeat
                .is_registered(NodeClass::Consumer, &consumer.heartbeat_key())
            {
                continue;
            }
            let group = consumer.group;
            if waiting.contains(&group) || cleared.contains(&group) {
                continue;
            }
            let rounds = self.events.unfinished_count(&group);
            if rounds < max_rounds {
                debug!("[Rebalance] group {group} waits for acknowledgements ({rounds}/{max_rounds})");
                waiting.insert(group);
                continue;
            }
            warn!("[Rebalance] group {group} left events unacknowledged for {rounds} passes, dropping them");
            for member in self.consumers.consumers_of(&group) {
                match self.consumer_lock.acquire(&member.consumer_id) {
                    Ok(_guard) => {
                        self.events.remove_all(&member.consumer_id);
                    }
                    Err(err) => warn!("[Rebalance] {} backlog kept: {err}", member.consumer_id),
                }
            }
            cleared.insert(group);
        }
        self.events.update_unfinished_counts(&waiting);

        self.consumers
            .groups()
            .into_iter()
            .filter(|group| !waiting.contains(group))
            .collect()
    }
}
