//! Registered producers.

use crate::types::ProducerInfo;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ProducerInfoHolder {
    producers: DashMap<String, ProducerInfo>,
}

impl ProducerInfoHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a producer. Returns the previous registration.
    pub fn add(&self, info: ProducerInfo) -> Option<ProducerInfo> {
        self.producers.insert(info.producer_id.clone(), info)
    }

    pub fn remove(&self, producer_id: &str) -> Option<ProducerInfo> {
        self.producers.remove(producer_id).map(|(_, info)| info)
    }

    pub fn get(&self, producer_id: &str) -> Option<ProducerInfo> {
        self.producers.get(producer_id).map(|info| info.clone())
    }

    pub fn contains(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}
