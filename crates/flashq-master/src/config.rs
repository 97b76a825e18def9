//! Master runtime configuration.

use crate::MasterError;
use crate::manifest::loader::read_document;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for liveness, rebalancing and the broker lifecycle.
///
/// All periods are expressed in milliseconds; use the `Duration` accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,

    pub producer_heartbeat_timeout_ms: u64,
    pub consumer_heartbeat_timeout_ms: u64,
    pub broker_heartbeat_timeout_ms: u64,
    pub heartbeat_check_interval_ms: u64,

    /// Number of shards (and worker threads) per rebalance pass.
    pub rebalance_parallelism: usize,
    pub consumer_balance_period_ms: u64,
    pub first_balance_delay_after_start_ms: u64,
    /// A group whose events stay unacknowledged for this many passes has its backlog dropped.
    pub max_unfinished_balance_rounds: u32,
    /// Zero disables the cap.
    pub max_group_broker_consume_rate: u32,

    pub step_change_wait_period_ms: u64,
    pub online_only_read_to_rw_period_ms: u64,
    pub offline_only_read_to_rw_period_ms: u64,
    /// Skip dwell times for brokers that come up with no configured topics.
    pub fast_start_enabled: bool,

    pub row_lock_wait_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8715,
            producer_heartbeat_timeout_ms: 30_000,
            consumer_heartbeat_timeout_ms: 30_000,
            broker_heartbeat_timeout_ms: 30_000,
            heartbeat_check_interval_ms: 1_000,
            rebalance_parallelism: 4,
            consumer_balance_period_ms: 60_000,
            first_balance_delay_after_start_ms: 30_000,
            max_unfinished_balance_rounds: 10,
            max_group_broker_consume_rate: 50,
            step_change_wait_period_ms: 12_000,
            online_only_read_to_rw_period_ms: 120_000,
            offline_only_read_to_rw_period_ms: 30_000,
            fast_start_enabled: true,
            row_lock_wait_ms: 5_000,
        }
    }
}

impl MasterConfig {
    /// Load configuration from a JSON or YAML file and validate it.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, MasterError> {
        let config: MasterConfig = read_document(path.as_ref(), "config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MasterError> {
        let invalid = |reason: &str| MasterError::InvalidConfig {
            context: "master config".to_string(),
            reason: reason.to_string(),
        };

        if self.rebalance_parallelism == 0 {
            return Err(invalid("rebalance_parallelism must be at least 1"));
        }
        if self.producer_heartbeat_timeout_ms == 0
            || self.consumer_heartbeat_timeout_ms == 0
            || self.broker_heartbeat_timeout_ms == 0
        {
            return Err(invalid("heartbeat timeouts must be positive"));
        }
        if self.heartbeat_check_interval_ms == 0 || self.consumer_balance_period_ms == 0 {
            return Err(invalid("periodic task intervals must be positive"));
        }
        if self.max_unfinished_balance_rounds == 0 {
            return Err(invalid("max_unfinished_balance_rounds must be at least 1"));
        }
        Ok(())
    }

    /// Address reported to clients that reach a non-primary master.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn producer_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_heartbeat_timeout_ms)
    }

    pub fn consumer_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_heartbeat_timeout_ms)
    }

    pub fn broker_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_heartbeat_timeout_ms)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_interval_ms)
    }

    pub fn consumer_balance_period(&self) -> Duration {
        Duration::from_millis(self.consumer_balance_period_ms)
    }

    pub fn first_balance_delay(&self) -> Duration {
        Duration::from_millis(self.first_balance_delay_after_start_ms)
    }

    pub fn step_change_wait_period(&self) -> Duration {
        Duration::from_millis(self.step_change_wait_period_ms)
    }

    pub fn online_only_read_to_rw_period(&self) -> Duration {
        Duration::from_millis(self.online_only_read_to_rw_period_ms)
    }

    pub fn offline_only_read_to_rw_period(&self) -> Duration {
        Duration::from_millis(self.offline_only_read_to_rw_period_ms)
    }

    pub fn row_lock_wait(&self) -> Duration {
        Duration::from_millis(self.row_lock_wait_ms)
    }
}
