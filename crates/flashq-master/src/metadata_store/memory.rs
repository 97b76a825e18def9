//! In-memory metadata and offset stores.

use crate::{
    MasterError,
    lifecycle::ManageStatus,
    manifest::{BrokerConf, MasterManifest, TopicConf},
    metadata_store::r#trait::{MetadataStore, OffsetStore},
    types::BrokerId,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// In-memory implementation of the MetadataStore trait.
///
/// Suitable for development, testing and single-node deployments where the
/// configuration is seeded from a manifest file.
#[derive(Debug)]
pub struct InMemoryMetadataStore {
    state: Arc<RwLock<MetadataState>>,
}

#[derive(Debug, Clone)]
struct MetadataState {
    primary: bool,
    brokers: BTreeMap<BrokerId, BrokerConf>,
    black_topics: BTreeMap<String, BTreeSet<String>>,
    broker_checksum: u64,
}

impl MetadataState {
    fn new() -> Self {
        Self {
            primary: true,
            brokers: BTreeMap::new(),
            black_topics: BTreeMap::new(),
            broker_checksum: 0,
        }
    }

    fn broker_mut(&mut self, broker_id: BrokerId) -> Result<&mut BrokerConf, MasterError> {
        self.brokers
            .get_mut(&broker_id)
            .ok_or(MasterError::BrokerNotConfigured {
                broker_id: broker_id.into(),
            })
    }
}

impl InMemoryMetadataStore {
    /// Create a new empty store that considers itself primary.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MetadataState::new())),
        }
    }

    /// Create a new store initialized with the given manifest.
    pub fn new_with_manifest(manifest: MasterManifest) -> Result<Self, MasterError> {
        let store = Self::new();
        store.load_from_manifest(manifest)?;
        Ok(store)
    }

    pub fn set_primary(&self, primary: bool) {
        self.state.write().primary = primary;
    }

    /// Add or replace a broker configuration.
    pub fn upsert_broker_conf(&self, conf: BrokerConf) -> Result<(), MasterError> {
        conf.validate()?;
        let mut state = self.state.write();
        state.brokers.insert(conf.broker_id, conf);
        state.broker_checksum += 1;
        Ok(())
    }

    pub fn remove_broker_conf(&self, broker_id: BrokerId) -> Option<BrokerConf> {
        let mut state = self.state.write();
        let removed = state.brokers.remove(&broker_id);
        if removed.is_some() {
            state.broker_checksum += 1;
        }
        removed
    }

    /// Replace a broker's topic configuration and bump its configuration id.
    pub fn set_broker_topics(
        &self,
        broker_id: BrokerId,
        topics: Vec<TopicConf>,
    ) -> Result<u64, MasterError> {
        let mut state = self.state.write();
        let conf = state.broker_mut(broker_id)?;
        let mut updated = conf.clone();
        updated.topics = topics;
        updated.validate()?;
        conf.topics = updated.topics;
        conf.conf_id += 1;
        Ok(conf.conf_id)
    }

    pub fn add_black_topic(&self, group: &str, topic: &str) {
        self.state
            .write()
            .black_topics
            .entry(group.to_string())
            .or_default()
            .insert(topic.to_string());
    }

    pub fn remove_black_topic(&self, group: &str, topic: &str) -> bool {
        let mut state = self.state.write();
        let Some(topics) = state.black_topics.get_mut(group) else {
            return false;
        };
        let removed = topics.remove(topic);
        if topics.is_empty() {
            state.black_topics.remove(group);
        }
        removed
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn is_primary(&self) -> bool {
        self.state.read().primary
    }

    fn broker_conf(&self, broker_id: BrokerId) -> Option<BrokerConf> {
        self.state.read().brokers.get(&broker_id).cloned()
    }

    fn broker_confs(&self) -> Vec<BrokerConf> {
        self.state.read().brokers.values().cloned().collect()
    }

    fn broker_checksum(&self) -> u64 {
        self.state.read().broker_checksum
    }

    fn black_topics(&self, group: &str) -> HashSet<String> {
        self.state
            .read()
            .black_topics
            .get(group)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_manage_status(
        &self,
        broker_id: BrokerId,
        status: ManageStatus,
    ) -> Result<(), MasterError> {
        let mut state = self.state.write();
        state.broker_mut(broker_id)?.manage_status = status;
        Ok(())
    }

    fn load_from_manifest(&self, manifest: MasterManifest) -> Result<(), MasterError> {
        manifest.validate()?;
        let brokers: BTreeMap<BrokerId, BrokerConf> = manifest
            .brokers
            .into_iter()
            .map(|conf| (conf.broker_id, conf))
            .collect();

        let mut state = self.state.write();
        state.brokers = brokers;
        state.black_topics = manifest.black_topics;
        state.broker_checksum += 1;
        Ok(())
    }

    fn export_to_manifest(&self) -> MasterManifest {
        let state = self.state.read();
        MasterManifest {
            brokers: state.brokers.values().cloned().collect(),
            black_topics: state.black_topics.clone(),
        }
    }
}

/// In-memory committed offsets keyed by `(group, partition key)`.
#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: DashMap<(String, String), i64>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffsetStore for InMemoryOffsetStore {
    fn committed_offset(&self, group: &str, partition_key: &str) -> Option<i64> {
        self.offsets
            .get(&(group.to_string(), partition_key.to_string()))
            .map(|offset| *offset)
    }

    fn commit_offset(&self, group: &str, partition_key: &str, offset: i64) {
        self.offsets
            .insert((group.to_string(), partition_key.to_string()), offset);
    }
}
