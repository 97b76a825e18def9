//! The coordination master.
//!
//! `Master` owns the registries, liveness tracking, event queues and the
//! rebalance orchestrator of one master instance. Client-facing handlers live
//! in the `producer`, `consumer` and `broker` submodules; periodic work is
//! started with [`Master::start`] and torn down with [`Master::stop`].

mod broker;
mod consumer;
mod producer;
mod rebalance;

use crate::balancer::{DefaultLoadBalancer, LoadBalancer, SubscriptionMap};
use crate::config::MasterConfig;
use crate::event::ConsumerEventManager;
use crate::heartbeat::{HeartbeatManager, NodeClass, TimeoutHandlers};
use crate::lifecycle::{BrokerRunManager, Visibility, build_topic_infos, diff_topic_infos};
use crate::metadata_store::{MetadataStore, OffsetStore};
use crate::registry::{
    BrokerInfoHolder, ConsumerInfoHolder, ProducerInfoHolder, TopicPSInfoManager,
};
use crate::row_lock::RowLock;
use crate::types::{BrokerId, ConsumerInfo, split_consumer_heartbeat_key};
use crate::MasterError;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Liveness key of a broker.
pub(crate) fn broker_key(broker_id: BrokerId) -> String {
    broker_id.0.to_string()
}

pub struct Master {
    config: MasterConfig,
    metadata_store: Arc<dyn MetadataStore>,
    offset_store: Arc<dyn OffsetStore>,
    balancer: Arc<dyn LoadBalancer>,

    heartbeat: Arc<HeartbeatManager>,
    events: ConsumerEventManager,
    brokers: BrokerInfoHolder,
    producers: ProducerInfoHolder,
    consumers: ConsumerInfoHolder,
    topics: TopicPSInfoManager,
    broker_runs: BrokerRunManager,
    /// What each consumer currently holds, as last acknowledged or reported.
    current_sub: DashMap<String, SubscriptionMap>,

    consumer_lock: RowLock,
    producer_lock: RowLock,
    topic_lock: RowLock,

    rebalance_id: AtomicU64,
    /// Shard tasks of the current pass that have not finished yet.
    in_flight: AtomicUsize,
    /// Serializes pass setup so two callers cannot both see zero shards in flight.
    pass_setup: Mutex<()>,
    first_pass: AtomicBool,

    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Master {
    /// Create a master with the default load balancer.
    pub fn new(
        config: MasterConfig,
        metadata_store: Arc<dyn MetadataStore>,
        offset_store: Arc<dyn OffsetStore>,
    ) -> Result<Arc<Self>, MasterError> {
        let balancer = Arc::new(DefaultLoadBalancer::new(config.max_group_broker_consume_rate));
        Self::with_balancer(config, metadata_store, offset_store, balancer)
    }

    pub fn with_balancer(
        config: MasterConfig,
        metadata_store: Arc<dyn MetadataStore>,
        offset_store: Arc<dyn OffsetStore>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Result<Arc<Self>, MasterError> {
        config.validate()?;
        Ok(Arc::new_cyclic(|master: &Weak<Master>| {
            let heartbeat = Arc::new(HeartbeatManager::new(&config, timeout_handlers(master)));
            let lock_wait = config.row_lock_wait();
            Master {
                metadata_store,
                offset_store,
                balancer,
                heartbeat,
                events: ConsumerEventManager::new(),
                brokers: BrokerInfoHolder::new(),
                producers: ProducerInfoHolder::new(),
                consumers: ConsumerInfoHolder::new(),
                topics: TopicPSInfoManager::new(),
                broker_runs: BrokerRunManager::new(),
                current_sub: DashMap::new(),
                consumer_lock: RowLock::new("consumer", lock_wait),
                producer_lock: RowLock::new("producer", lock_wait),
                topic_lock: RowLock::new("topic", lock_wait),
                rebalance_id: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                pass_setup: Mutex::new(()),
                first_pass: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                config,
            }
        }))
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn heartbeat(&self) -> &HeartbeatManager {
        &self.heartbeat
    }

    pub fn events(&self) -> &ConsumerEventManager {
        &self.events
    }

    pub fn brokers(&self) -> &BrokerInfoHolder {
        &self.brokers
    }

    pub fn producers(&self) -> &ProducerInfoHolder {
        &self.producers
    }

    pub fn consumers(&self) -> &ConsumerInfoHolder {
        &self.consumers
    }

    pub fn topics(&self) -> &TopicPSInfoManager {
        &self.topics
    }

    pub fn broker_runs(&self) -> &BrokerRunManager {
        &self.broker_runs
    }

    /// Partitions a consumer currently holds, per topic.
    pub fn current_subscription(&self, consumer_id: &str) -> Option<SubscriptionMap> {
        self.current_sub.get(consumer_id).map(|subs| subs.clone())
    }

    /// Id of the most recent rebalance pass, zero before the first one.
    pub fn last_rebalance_id(&self) -> u64 {
        self.rebalance_id.load(Ordering::SeqCst)
    }

    pub fn in_flight_shards(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_primary(&self) -> Result<(), MasterError> {
        if self.metadata_store.is_primary() {
            Ok(())
        } else {
            Err(MasterError::NotLeader {
                master: self.config.address(),
            })
        }
    }

    /// Spawn the heartbeat scans and the balancer chore on the current runtime.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("[Master Start] already running");
            return;
        }
        self.stopped.store(false, Ordering::SeqCst);

        let scan_period = self.config.heartbeat_check_interval();
        for class in NodeClass::ALL {
            tasks.push(tokio::spawn(
                Arc::clone(&self.heartbeat).run_scan(class, scan_period),
            ));
        }

        let master = Arc::downgrade(self);
        let first_delay = self.config.first_balance_delay();
        let period = self.config.consumer_balance_period();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(first_delay).await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(master) = master.upgrade() else {
                    break;
                };
                if master.is_stopped() {
                    break;
                }
                // Shards run detached; the in-flight counter gates the next pass.
                drop(master.run_balance_pass());
            }
        }));

        info!(
            "[Master Start] {} heartbeat scan every {:?}, first balance in {:?}, then every {:?}",
            self.config.address(),
            scan_period,
            first_delay,
            period
        );
    }

    /// Stop periodic work: heartbeat scans first, then the balancer chore.
    /// Shards already running finish on their own; see [`Master::wait_for_rebalance`].
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!("[Master Stop] {} stopped", self.config.address());
    }

    /// Wait until no rebalance shard is in flight.
    pub async fn wait_for_rebalance(&self) {
        while self.in_flight_shards() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drop a consumer and everything the master tracks for it.
    pub(crate) fn release_consumer(&self, consumer_id: &str) -> Result<Option<ConsumerInfo>, MasterError> {
        let _guard = self.consumer_lock.acquire(consumer_id)?;
        Ok(self.release_consumer_locked(consumer_id))
    }

    fn release_consumer_locked(&self, consumer_id: &str) -> Option<ConsumerInfo> {
        let held = self
            .current_sub
            .remove(consumer_id)
            .map(|(_, subs)| subs.values().map(|held| held.len()).sum::<usize>())
            .unwrap_or(0);
        let dropped = self.events.remove_all(consumer_id);
        let (consumer, emptied) = self.consumers.remove(consumer_id)?;
        self.heartbeat
            .unregister(NodeClass::Consumer, &consumer.heartbeat_key());
        if emptied {
            self.topics.remove_group_sub(&consumer.group, &consumer.topics);
            debug!("[Group Release] group {} has no members left", consumer.group);
        }
        info!(
            "[Consumer Release] {}@{} released {held} partitions, dropped {dropped} pending events",
            consumer.consumer_id, consumer.group
        );
        Some(consumer)
    }

    pub(crate) fn release_producer(&self, producer_id: &str) -> Result<bool, MasterError> {
        let _guard = self.producer_lock.acquire(producer_id)?;
        self.heartbeat.unregister(NodeClass::Producer, producer_id);
        let Some(producer) = self.producers.remove(producer_id) else {
            return Ok(false);
        };
        self.topics
            .remove_producer_pub(&producer.producer_id, &producer.topics);
        info!(
            "[Producer Release] {} unpublished {} topics",
            producer.producer_id,
            producer.topics.len()
        );
        Ok(true)
    }

    /// Withdraw a broker's topic infos from the publish topology, then forget it.
    ///
    /// The broker stays registered until every topic info is gone. On a lock
    /// timeout the topics still published are kept in its run set and the error
    /// is returned, so the release can be retried.
    pub(crate) fn release_broker(&self, broker_id: BrokerId) -> Result<(), MasterError> {
        let mut published = self.broker_runs.run_topics(broker_id);
        let mut topics: BTreeSet<String> = published.keys().cloned().collect();
        topics.extend(self.topics.topics_of_broker(broker_id));

        let mut withdrawn = 0;
        for topic in &topics {
            let _guard = match self.topic_lock.acquire(topic) {
                Ok(guard) => guard,
                Err(err) => {
                    if withdrawn > 0 {
                        self.broker_runs.set_run_topics(broker_id, published);
                    }
                    return Err(err);
                }
            };
            if self.topics.remove_topic_info(topic, broker_id).is_some() {
                self.log_audience(broker_id, topic, "withdrawn");
            }
            published.remove(topic);
            withdrawn += 1;
        }

        self.heartbeat
            .unregister(NodeClass::Broker, &broker_key(broker_id));
        self.broker_runs.remove(broker_id);
        if self.brokers.remove(broker_id).is_some() {
            info!("[Broker Release] {broker_id} withdrew {} topics", topics.len());
        }
        Ok(())
    }

    fn log_audience(&self, broker_id: BrokerId, topic: &str, change: &str) {
        let groups = self.topics.subscribing_groups(topic);
        let producers = self.topics.publishing_producers(topic);
        if !groups.is_empty() || !producers.is_empty() {
            debug!(
                "[Topology] {broker_id} {topic} {change}, seen by groups {groups:?} producers {producers:?}"
            );
        }
    }

    /// Bring the publish topology in line with the broker's current visibility.
    ///
    /// Only the changed topic infos are written. The broker's published set is
    /// recorded once every write went through, so a partial failure is retried
    /// on the next heartbeat.
    pub(crate) fn push_topology(&self, broker_id: BrokerId) -> Result<(), MasterError> {
        let Some(conf) = self.metadata_store.broker_conf(broker_id) else {
            return Ok(());
        };
        let Some(status) = self.broker_runs.status(broker_id) else {
            return Ok(());
        };
        let report = self.brokers.report(broker_id).unwrap_or_default();
        let visibility = Visibility {
            accept_publish: status.visibility.accept_publish && report.writable,
            accept_subscribe: status.visibility.accept_subscribe && report.readable,
        };

        let target = build_topic_infos(&conf, visibility);
        let diff = diff_topic_infos(&self.broker_runs.run_topics(broker_id), &target);
        if diff.is_empty() {
            return Ok(());
        }
        for topic in &diff.removed {
            let _guard = self.topic_lock.acquire(topic)?;
            self.topics.remove_topic_info(topic, broker_id);
            self.log_audience(broker_id, topic, "removed");
        }
        for info in diff.changed {
            let _guard = self.topic_lock.acquire(&info.topic)?;
            debug!(
                "[Topology] {broker_id} {} publish={} subscribe={}",
                info.topic, info.accept_publish, info.accept_subscribe
            );
            let topic = info.topic.clone();
            self.topics.set_topic_info(info);
            self.log_audience(broker_id, &topic, "changed");
        }
        self.broker_runs.set_run_topics(broker_id, target);
        Ok(())
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Release callbacks bound to a master that may already be gone.
fn timeout_handlers(master: &Weak<Master>) -> TimeoutHandlers {
    let producer_master = master.clone();
    let consumer_master = master.clone();
    let broker_master = master.clone();
    TimeoutHandlers {
        producer: Arc::new(move |key: &str| {
            let Some(master) = producer_master.upgrade() else {
                return;
            };
            if let Err(err) = master.release_producer(key) {
                warn!("[Producer Timeout] release of {key} deferred: {err}");
                master.heartbeat.register(NodeClass::Producer, key);
            }
        }),
        consumer: Arc::new(move |key: &str| {
            let Some(master) = consumer_master.upgrade() else {
                return;
            };
            let Some((consumer_id, _group)) = split_consumer_heartbeat_key(key) else {
                warn!("[Consumer Timeout] malformed node key {key}");
                return;
            };
            if let Err(err) = master.release_consumer(consumer_id) {
                // Re-armed so the next scan retries the release.
                warn!("[Consumer Timeout] release of {key} deferred: {err}");
                master.heartbeat.register(NodeClass::Consumer, key);
            }
        }),
        broker: Arc::new(move |key: &str| {
            let Some(master) = broker_master.upgrade() else {
                return;
            };
            let Ok(id) = key.parse::<u32>() else {
                warn!("[Broker Timeout] malformed node key {key}");
                return;
            };
            if let Err(err) = master.release_broker(BrokerId(id)) {
                warn!("[Broker Timeout] release of {key} deferred: {err}");
                master.heartbeat.register(NodeClass::Broker, key);
            }
        }),
    }
}
