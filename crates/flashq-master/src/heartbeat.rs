//! Liveness tracking for producers, consumers and brokers.
//!
//! Each node class has its own last-seen map and timeout. An expired node is
//! removed from its map and its class handler is invoked exactly once with the
//! node key; the handler releases whatever the node held.

use crate::{MasterError, config::MasterConfig};
use dashmap::DashMap;
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    Producer,
    Consumer,
    Broker,
}

impl NodeClass {
    pub const ALL: [NodeClass; 3] = [NodeClass::Producer, NodeClass::Consumer, NodeClass::Broker];
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeClass::Producer => write!(f, "producer"),
            NodeClass::Consumer => write!(f, "consumer"),
            NodeClass::Broker => write!(f, "broker"),
        }
    }
}

pub type TimeoutHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Release callbacks, one per node class.
#[derive(Clone)]
pub struct TimeoutHandlers {
    pub producer: TimeoutHandler,
    pub consumer: TimeoutHandler,
    pub broker: TimeoutHandler,
}

impl TimeoutHandlers {
    pub fn noop() -> Self {
        Self {
            producer: Arc::new(|_| {}),
            consumer: Arc::new(|_| {}),
            broker: Arc::new(|_| {}),
        }
    }

    fn get(&self, class: NodeClass) -> &TimeoutHandler {
        match class {
            NodeClass::Producer => &self.producer,
            NodeClass::Consumer => &self.consumer,
            NodeClass::Broker => &self.broker,
        }
    }
}

impl fmt::Debug for TimeoutHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHandlers").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct NodeTable {
    last_seen: DashMap<String, Instant>,
    timeout: Duration,
}

impl NodeTable {
    fn new(timeout: Duration) -> Self {
        Self {
            last_seen: DashMap::new(),
            timeout,
        }
    }
}

#[derive(Debug)]
pub struct HeartbeatManager {
    producers: NodeTable,
    consumers: NodeTable,
    brokers: NodeTable,
    handlers: TimeoutHandlers,
}

impl HeartbeatManager {
    pub fn new(config: &MasterConfig, handlers: TimeoutHandlers) -> Self {
        Self {
            producers: NodeTable::new(config.producer_heartbeat_timeout()),
            consumers: NodeTable::new(config.consumer_heartbeat_timeout()),
            brokers: NodeTable::new(config.broker_heartbeat_timeout()),
            handlers,
        }
    }

    fn table(&self, class: NodeClass) -> &NodeTable {
        match class {
            NodeClass::Producer => &self.producers,
            NodeClass::Consumer => &self.consumers,
            NodeClass::Broker => &self.brokers,
        }
    }

    pub fn timeout(&self, class: NodeClass) -> Duration {
        self.table(class).timeout
    }

    /// Start (or restart) tracking a node.
    pub fn register(&self, class: NodeClass, key: &str) {
        self.register_at(class, key, Instant::now());
    }

    pub fn register_at(&self, class: NodeClass, key: &str, now: Instant) {
        self.table(class).last_seen.insert(key.to_string(), now);
    }

    /// Refresh a node's deadline. Unknown nodes must register again.
    pub fn update(&self, class: NodeClass, key: &str) -> Result<(), MasterError> {
        self.update_at(class, key, Instant::now())
    }

    pub fn update_at(&self, class: NodeClass, key: &str, now: Instant) -> Result<(), MasterError> {
        match self.table(class).last_seen.get_mut(key) {
            Some(mut last_seen) => {
                *last_seen = now;
                Ok(())
            }
            None => Err(MasterError::NoSuchNode {
                node: format!("{class} {key}"),
            }),
        }
    }

    pub fn unregister(&self, class: NodeClass, key: &str) -> bool {
        self.table(class).last_seen.remove(key).is_some()
    }

    pub fn is_registered(&self, class: NodeClass, key: &str) -> bool {
        self.table(class).last_seen.contains_key(key)
    }

    pub fn registered_keys(&self, class: NodeClass) -> Vec<String> {
        let mut keys: Vec<String> = self
            .table(class)
            .last_seen
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove every node of `class` whose deadline passed before `now` and fire
    /// the class handler once per removed node. Returns the expired keys.
    pub fn expire_nodes(&self, class: NodeClass, now: Instant) -> Vec<String> {
        let table = self.table(class);
        let timeout = table.timeout;
        let is_expired = |last_seen: &Instant| now.saturating_duration_since(*last_seen) > timeout;

        let candidates: Vec<String> = table
            .last_seen
            .iter()
            .filter(|entry| is_expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for key in candidates {
            // A heartbeat may have landed since the scan; only the remover fires.
            if table
                .last_seen
                .remove_if(&key, |_, last_seen| is_expired(last_seen))
                .is_some()
            {
                warn!("[{class} Timeout] {key} missed its heartbeat deadline of {timeout:?}");
                (self.handlers.get(class))(&key);
                expired.push(key);
            }
        }
        expired
    }

    /// Periodic timeout scan for one node class. Runs until the task is aborted.
    pub async fn run_scan(self: Arc<Self>, class: NodeClass, period: Duration) {
        debug!("Starting {class} heartbeat scan every {period:?}");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.expire_nodes(class, Instant::now());
        }
    }
}
