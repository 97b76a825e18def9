//! Registered brokers and their latest read/write reports.

use crate::types::{BrokerId, BrokerInfo};
use dashmap::DashMap;

/// Read/write availability last reported by a broker heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerReport {
    pub readable: bool,
    pub writable: bool,
}

impl Default for BrokerReport {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct BrokerInfoHolder {
    brokers: DashMap<BrokerId, BrokerInfo>,
    reports: DashMap<BrokerId, BrokerReport>,
}

impl BrokerInfoHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a broker. Returns the previous registration.
    pub fn register(&self, info: BrokerInfo) -> Option<BrokerInfo> {
        self.reports.insert(info.id, BrokerReport::default());
        self.brokers.insert(info.id, info)
    }

    pub fn remove(&self, broker_id: BrokerId) -> Option<BrokerInfo> {
        self.reports.remove(&broker_id);
        self.brokers.remove(&broker_id).map(|(_, info)| info)
    }

    pub fn get(&self, broker_id: BrokerId) -> Option<BrokerInfo> {
        self.brokers.get(&broker_id).map(|info| info.clone())
    }

    pub fn contains(&self, broker_id: BrokerId) -> bool {
        self.brokers.contains_key(&broker_id)
    }

    /// All registered brokers ordered by id.
    pub fn all(&self) -> Vec<BrokerInfo> {
        let mut brokers: Vec<BrokerInfo> = self.brokers.iter().map(|e| e.value().clone()).collect();
        brokers.sort_by_key(|broker| broker.id);
        brokers
    }

    pub fn update_report(&self, broker_id: BrokerId, readable: bool, writable: bool) {
        if self.brokers.contains_key(&broker_id) {
            self.reports
                .insert(broker_id, BrokerReport { readable, writable });
        }
    }

    pub fn report(&self, broker_id: BrokerId) -> Option<BrokerReport> {
        self.reports.get(&broker_id).map(|report| *report)
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
