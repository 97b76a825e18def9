//! Broker lifecycle: operator intent versus step-wise run status.
//!
//! A broker's manage status is what the operator wants (online, read-only,
//! write-only, offline). Its run status walks a fixed step sequence toward that
//! intent, one step per configuration report, each step gated by a dwell time.
//! The visibility of a step decides whether the broker's topics accept publish
//! and subscribe traffic.

use crate::config::MasterConfig;
use crate::manifest::BrokerConf;
use crate::types::{BrokerId, TopicInfo};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManageStatus {
    /// Configured but not yet activated; the broker may not join.
    Apply,
    Online,
    OnlineNotWrite,
    OnlineNotRead,
    Offline,
}

impl ManageStatus {
    /// Visibility once a broker has settled in this status.
    pub fn steady_visibility(self) -> Visibility {
        match self {
            ManageStatus::Online => Visibility::BOTH,
            ManageStatus::OnlineNotWrite => Visibility::SUBSCRIBE_ONLY,
            ManageStatus::OnlineNotRead => Visibility::PUBLISH_ONLY,
            ManageStatus::Apply | ManageStatus::Offline => Visibility::NONE,
        }
    }

    pub fn is_partial(self) -> bool {
        matches!(self, ManageStatus::OnlineNotWrite | ManageStatus::OnlineNotRead)
    }
}

impl fmt::Display for ManageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManageStatus::Apply => "MANAGE_APPLY",
            ManageStatus::Online => "MANAGE_ONLINE",
            ManageStatus::OnlineNotWrite => "MANAGE_ONLINE_NOT_WRITE",
            ManageStatus::OnlineNotRead => "MANAGE_ONLINE_NOT_READ",
            ManageStatus::Offline => "MANAGE_OFFLINE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    WaitRegister,
    WaitOnline,
    OnlyRead,
    OnlyWrite,
    ReadAndWrite,
    PartWaitRegister,
    PartWaitOnline,
    PartOnlyRead,
    NotWrite,
    NotReadWrite,
    WaitRebalance,
    /// Steady state: the sequence for the current intent has completed.
    Undefined,
}

/// Whether a broker's topics currently accept publish and subscribe traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Visibility {
    pub accept_publish: bool,
    pub accept_subscribe: bool,
}

impl Visibility {
    pub const NONE: Visibility = Visibility {
        accept_publish: false,
        accept_subscribe: false,
    };
    pub const BOTH: Visibility = Visibility {
        accept_publish: true,
        accept_subscribe: true,
    };
    pub const SUBSCRIBE_ONLY: Visibility = Visibility {
        accept_publish: false,
        accept_subscribe: true,
    };
    pub const PUBLISH_ONLY: Visibility = Visibility {
        accept_publish: true,
        accept_subscribe: false,
    };
}

/// Lifecycle and configuration-push state of one registered broker.
#[derive(Debug, Clone)]
pub struct BrokerSyncStatus {
    pub broker_id: BrokerId,
    pub manage_status: ManageStatus,
    pub run_status: RunStatus,
    pub visibility: Visibility,
    /// Configuration id and checksum last pushed to the broker.
    pub conf_id: u64,
    pub conf_checksum: u64,
    pub reported_conf_id: Option<u64>,
    pub reported_checksum: Option<u64>,
    /// The configuration changed since the broker last settled online.
    pub conf_changed: bool,
    /// The broker reported the pushed configuration as applied.
    pub loaded: bool,
    /// Dwell times are skipped while set.
    pub fast_start: bool,
    pub broker_online: bool,
    topics_configured: bool,
    step_changed_at: Instant,
}

impl BrokerSyncStatus {
    pub fn new(conf: &BrokerConf, fast_start_enabled: bool, now: Instant) -> Self {
        let (run_status, visibility) = first_step(conf.manage_status, None, Visibility::NONE);
        Self {
            broker_id: conf.broker_id,
            manage_status: conf.manage_status,
            run_status,
            visibility,
            conf_id: conf.conf_id,
            conf_checksum: conf.checksum(),
            reported_conf_id: None,
            reported_checksum: None,
            conf_changed: false,
            loaded: false,
            fast_start: fast_start_enabled && conf.topics.is_empty(),
            broker_online: true,
            topics_configured: !conf.topics.is_empty(),
            step_changed_at: now,
        }
    }

    /// Record the configuration the broker reports it is running with.
    pub fn record_report(&mut self, conf: &BrokerConf, reported_conf_id: u64, reported_checksum: u64) {
        let checksum = conf.checksum();
        if conf.conf_id != self.conf_id || checksum != self.conf_checksum {
            self.conf_id = conf.conf_id;
            self.conf_checksum = checksum;
            self.conf_changed = true;
        }
        self.topics_configured = !conf.topics.is_empty();
        self.reported_conf_id = Some(reported_conf_id);
        self.reported_checksum = Some(reported_checksum);
        self.loaded = reported_conf_id == self.conf_id && reported_checksum == self.conf_checksum;
    }

    /// Whether the broker must be sent its configuration again.
    pub fn needs_conf_push(&self) -> bool {
        !self.loaded
    }

    pub fn time_in_step(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.step_changed_at)
    }

    /// Restart the step sequence for a new operator intent.
    pub fn update_manage_status(&mut self, status: ManageStatus, now: Instant) -> bool {
        if status == self.manage_status {
            return false;
        }
        let (run_status, visibility) = first_step(status, Some(self.manage_status), self.visibility);
        self.manage_status = status;
        self.run_status = run_status;
        self.visibility = visibility;
        self.step_changed_at = now;
        true
    }

    /// Advance at most one step. Returns the new run status if the step changed.
    pub fn advance(&mut self, now: Instant, config: &MasterConfig) -> Option<RunStatus> {
        use ManageStatus as M;
        use RunStatus as R;

        let dwell = self.time_in_step(now);
        let step = self.gate(config.step_change_wait_period());
        let settle = self.gate(config.offline_only_read_to_rw_period());
        let read_to_write = if self.conf_changed || !self.loaded {
            self.gate(config.online_only_read_to_rw_period())
        } else {
            Duration::ZERO
        };
        let current = self.visibility;

        let (next, visibility) = match (self.manage_status, self.run_status) {
            (M::Online, R::OnlyRead | R::PartOnlyRead | R::ReadAndWrite) if !self.broker_online => {
                (R::WaitOnline, Visibility::NONE)
            }
            (M::Online, R::WaitRegister) if dwell >= step => (R::WaitOnline, current),
            (M::Online, R::PartWaitRegister) if dwell >= step => (R::PartWaitOnline, current),
            (M::Online, R::WaitOnline) if self.broker_online && dwell >= step => {
                (R::OnlyRead, Visibility::SUBSCRIBE_ONLY)
            }
            (M::Online, R::PartWaitOnline) if self.broker_online && dwell >= step => (
                R::PartOnlyRead,
                Visibility {
                    accept_subscribe: true,
                    ..current
                },
            ),
            (M::Online, R::OnlyRead | R::PartOnlyRead) if dwell >= read_to_write => {
                (R::ReadAndWrite, Visibility::BOTH)
            }
            (M::Online, R::ReadAndWrite) if dwell >= step => (R::Undefined, Visibility::BOTH),
            (M::OnlineNotWrite, R::OnlyRead) if dwell >= step => (R::WaitRebalance, current),
            (M::OnlineNotRead, R::OnlyWrite) if dwell >= step => (R::WaitRebalance, current),
            (M::Offline, R::NotWrite) => (R::NotReadWrite, Visibility::NONE),
            (M::Offline, R::NotReadWrite) if dwell >= step => (R::WaitRebalance, current),
            (M::OnlineNotWrite | M::OnlineNotRead | M::Offline, R::WaitRebalance)
                if dwell >= settle =>
            {
                (R::Undefined, current)
            }
            _ => return None,
        };

        self.run_status = next;
        self.visibility = visibility;
        self.step_changed_at = now;
        if next == R::Undefined {
            self.fast_start = config.fast_start_enabled && !self.topics_configured;
            if self.manage_status == M::Online {
                self.conf_changed = false;
            }
        }
        Some(next)
    }

    fn gate(&self, wait: Duration) -> Duration {
        if self.fast_start { Duration::ZERO } else { wait }
    }
}

/// First step, and its visibility, when a broker starts moving toward `target`.
fn first_step(
    target: ManageStatus,
    previous: Option<ManageStatus>,
    current: Visibility,
) -> (RunStatus, Visibility) {
    match target {
        ManageStatus::Online if previous.is_some_and(ManageStatus::is_partial) => {
            (RunStatus::PartWaitRegister, current)
        }
        ManageStatus::Online => (RunStatus::WaitRegister, current),
        ManageStatus::OnlineNotWrite => (RunStatus::OnlyRead, Visibility::SUBSCRIBE_ONLY),
        ManageStatus::OnlineNotRead => (RunStatus::OnlyWrite, Visibility::PUBLISH_ONLY),
        ManageStatus::Offline => (
            RunStatus::NotWrite,
            Visibility {
                accept_publish: false,
                ..current
            },
        ),
        ManageStatus::Apply => (RunStatus::Undefined, Visibility::NONE),
    }
}

/// Topic infos a broker publishes at the given visibility, keyed by topic.
pub fn build_topic_infos(conf: &BrokerConf, visibility: Visibility) -> HashMap<String, TopicInfo> {
    conf.topic_infos(visibility.accept_publish, visibility.accept_subscribe)
        .into_iter()
        .map(|info| (info.topic.clone(), info))
        .collect()
}

/// Changes to apply to the publish topology when a broker's topic infos change.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TopicInfoDiff {
    pub removed: Vec<String>,
    pub changed: Vec<TopicInfo>,
}

impl TopicInfoDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_topic_infos(
    old: &HashMap<String, TopicInfo>,
    new: &HashMap<String, TopicInfo>,
) -> TopicInfoDiff {
    let mut removed: Vec<String> = old
        .keys()
        .filter(|topic| !new.contains_key(*topic))
        .cloned()
        .collect();
    removed.sort();

    let mut changed: Vec<TopicInfo> = new
        .values()
        .filter(|info| old.get(&info.topic) != Some(*info))
        .cloned()
        .collect();
    changed.sort_by(|a, b| a.topic.cmp(&b.topic));

    TopicInfoDiff { removed, changed }
}

/// Sync status and currently published topic infos of every registered broker.
#[derive(Debug, Default)]
pub struct BrokerRunManager {
    statuses: DashMap<BrokerId, BrokerSyncStatus>,
    run_topics: DashMap<BrokerId, HashMap<String, TopicInfo>>,
}

impl BrokerRunManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a (re-)registered broker. Previously published topics are kept
    /// so the next push diffs against what clients can still see.
    pub fn register(&self, status: BrokerSyncStatus) {
        self.statuses.insert(status.broker_id, status);
    }

    pub fn remove(&self, broker_id: BrokerId) -> (Option<BrokerSyncStatus>, HashMap<String, TopicInfo>) {
        let status = self.statuses.remove(&broker_id).map(|(_, status)| status);
        let topics = self
            .run_topics
            .remove(&broker_id)
            .map(|(_, topics)| topics)
            .unwrap_or_default();
        (status, topics)
    }

    pub fn status(&self, broker_id: BrokerId) -> Option<BrokerSyncStatus> {
        self.statuses.get(&broker_id).map(|status| status.clone())
    }

    /// Run `f` against a broker's status while holding its map entry.
    pub fn update<R>(&self, broker_id: BrokerId, f: impl FnOnce(&mut BrokerSyncStatus) -> R) -> Option<R> {
        self.statuses.get_mut(&broker_id).map(|mut status| f(&mut status))
    }

    pub fn run_topics(&self, broker_id: BrokerId) -> HashMap<String, TopicInfo> {
        self.run_topics
            .get(&broker_id)
            .map(|topics| topics.clone())
            .unwrap_or_default()
    }

    pub fn set_run_topics(&self, broker_id: BrokerId, topics: HashMap<String, TopicInfo>) {
        self.run_topics.insert(broker_id, topics);
    }
}
